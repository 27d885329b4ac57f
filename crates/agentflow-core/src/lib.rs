pub mod config;
pub mod dataset;
pub mod error;
pub mod event;
pub mod flow;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use dataset::ExecutionData;
pub use error::{FlowError, Result};
pub use event::EventBus;
pub use flow::*;
pub use types::*;
