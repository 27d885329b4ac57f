use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use agentflow_core::error::{FlowError, Result};
use agentflow_core::flow::FlowDefinition;
use agentflow_core::traits::FlowStore;
use agentflow_core::types::*;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS flows (
        tenant_id TEXT NOT NULL,
        flow_id TEXT NOT NULL,
        status TEXT NOT NULL,
        definition TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, flow_id)
    );

    CREATE TABLE IF NOT EXISTS flow_executions (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        flow_id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        status TEXT NOT NULL,
        current_node_id TEXT,
        created_at TEXT NOT NULL,
        record TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_executions_flow
        ON flow_executions(tenant_id, flow_id, seq);

    CREATE TABLE IF NOT EXISTS node_executions (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL,
        execution_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        status TEXT NOT NULL,
        retry_attempt INTEGER NOT NULL,
        record TEXT NOT NULL,
        UNIQUE (execution_id, node_id)
    );";

/// SQLite-backed `FlowStore`.
///
/// Records are kept whole as JSON; the columns beside them exist for
/// filtering and ordering.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| FlowError::Database(e.to_string()))?;

        // WAL lets pollers read while an execution is writing.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| FlowError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| FlowError::Database(e.to_string()))?;

        debug!(path = %path.display(), "SQLite flow store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| FlowError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| FlowError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl FlowStore for SqliteStore {
    fn save_flow(&self, flow: &FlowDefinition) -> BoxFuture<'_, Result<()>> {
        let flow = flow.clone();
        Box::pin(async move {
            let definition = serde_json::to_string(&flow)?;
            let conn = self
                .conn
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;
            conn.execute(
                "INSERT INTO flows (tenant_id, flow_id, status, definition, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(tenant_id, flow_id) DO UPDATE SET
                    status = excluded.status,
                    definition = excluded.definition,
                    updated_at = excluded.updated_at",
                params![
                    flow.tenant_id,
                    flow.id,
                    flow.status.as_str(),
                    definition,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|e| FlowError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn load_flow(&self, flow_id: &str, tenant_id: &str) -> BoxFuture<'_, Result<FlowDefinition>> {
        let flow_id = flow_id.to_string();
        let tenant_id = tenant_id.to_string();
        Box::pin(async move {
            let definition: Option<String> = {
                let conn = self
                    .conn
                    .lock()
                    .map_err(|e| FlowError::Database(e.to_string()))?;
                conn.query_row(
                    "SELECT definition FROM flows WHERE tenant_id = ?1 AND flow_id = ?2",
                    params![tenant_id, flow_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| FlowError::Database(e.to_string()))?
            };

            match definition {
                Some(json) => Ok(serde_json::from_str(&json)?),
                None => Err(FlowError::FlowNotFound(format!(
                    "{} (tenant {})",
                    flow_id, tenant_id
                ))),
            }
        })
    }

    fn create_execution(&self, execution: &FlowExecution) -> BoxFuture<'_, Result<()>> {
        let execution = execution.clone();
        Box::pin(async move {
            let record = serde_json::to_string(&execution)?;
            let conn = self
                .conn
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;
            conn.execute(
                "INSERT INTO flow_executions
                    (id, flow_id, tenant_id, status, current_node_id, created_at, record)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    execution.id.as_str(),
                    execution.flow_id,
                    execution.tenant_id,
                    execution.status.as_str(),
                    execution.current_node_id,
                    execution.created_at.to_rfc3339(),
                    record
                ],
            )
            .map_err(|e| FlowError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn update_execution(&self, execution: &FlowExecution) -> BoxFuture<'_, Result<()>> {
        let execution = execution.clone();
        Box::pin(async move {
            let record = serde_json::to_string(&execution)?;
            let conn = self
                .conn
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;
            let changed = conn
                .execute(
                    "UPDATE flow_executions
                     SET status = ?2, current_node_id = ?3, record = ?4
                     WHERE id = ?1",
                    params![
                        execution.id.as_str(),
                        execution.status.as_str(),
                        execution.current_node_id,
                        record
                    ],
                )
                .map_err(|e| FlowError::Database(e.to_string()))?;
            if changed == 0 {
                return Err(FlowError::ExecutionNotFound(execution.id.to_string()));
            }
            Ok(())
        })
    }

    fn get_execution(&self, id: &ExecutionId) -> BoxFuture<'_, Result<FlowExecution>> {
        let id = id.clone();
        Box::pin(async move {
            let record: Option<String> = {
                let conn = self
                    .conn
                    .lock()
                    .map_err(|e| FlowError::Database(e.to_string()))?;
                conn.query_row(
                    "SELECT record FROM flow_executions WHERE id = ?1",
                    params![id.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| FlowError::Database(e.to_string()))?
            };

            match record {
                Some(json) => Ok(serde_json::from_str(&json)?),
                None => Err(FlowError::ExecutionNotFound(id.to_string())),
            }
        })
    }

    fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> BoxFuture<'_, Result<Vec<FlowExecution>>> {
        let filter = filter.clone();
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;

            let mut stmt = conn
                .prepare(
                    "SELECT record FROM flow_executions
                     WHERE (?1 IS NULL OR flow_id = ?1)
                       AND (?2 IS NULL OR tenant_id = ?2)
                       AND (?3 IS NULL OR status = ?3)
                     ORDER BY seq DESC
                     LIMIT ?4",
                )
                .map_err(|e| FlowError::Database(e.to_string()))?;

            // A negative LIMIT means no limit in SQLite.
            let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
            let rows = stmt
                .query_map(
                    params![
                        filter.flow_id,
                        filter.tenant_id,
                        filter.status.map(|s| s.as_str()),
                        limit
                    ],
                    |row| row.get::<_, String>(0),
                )
                .map_err(|e| FlowError::Database(e.to_string()))?;

            let mut executions = Vec::new();
            for row in rows {
                let json = row.map_err(|e| FlowError::Database(e.to_string()))?;
                executions.push(serde_json::from_str(&json)?);
            }
            Ok(executions)
        })
    }

    fn upsert_node_execution(&self, node: &NodeExecution) -> BoxFuture<'_, Result<()>> {
        let node = node.clone();
        Box::pin(async move {
            let record = serde_json::to_string(&node)?;
            let conn = self
                .conn
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;
            conn.execute(
                "INSERT INTO node_executions
                    (id, execution_id, node_id, status, retry_attempt, record)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(execution_id, node_id) DO UPDATE SET
                    status = excluded.status,
                    retry_attempt = excluded.retry_attempt,
                    record = excluded.record",
                params![
                    node.id,
                    node.execution_id.as_str(),
                    node.node_id,
                    node.status.as_str(),
                    node.retry_attempt,
                    record
                ],
            )
            .map_err(|e| FlowError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn list_node_executions(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Vec<NodeExecution>>> {
        let id = id.clone();
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;

            let mut stmt = conn
                .prepare(
                    "SELECT record FROM node_executions
                     WHERE execution_id = ?1
                     ORDER BY seq ASC",
                )
                .map_err(|e| FlowError::Database(e.to_string()))?;
            let rows = stmt
                .query_map(params![id.as_str()], |row| row.get::<_, String>(0))
                .map_err(|e| FlowError::Database(e.to_string()))?;

            let mut nodes = Vec::new();
            for row in rows {
                let json = row.map_err(|e| FlowError::Database(e.to_string()))?;
                nodes.push(serde_json::from_str(&json)?);
            }
            Ok(nodes)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::flow::{EdgeSpec, FlowStatus, NodeSpec, Predicate};
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_flow_roundtrip_and_replace() {
        let store = SqliteStore::in_memory().unwrap();
        let flow = FlowDefinition::new("triage", "acme")
            .with_node(NodeSpec::agent("a", "classifier", "classify").with_input("text", "${trigger_data.body}"))
            .with_node(NodeSpec::condition("b", Predicate::greater_than("a.score", json!(0.5))))
            .with_edge(EdgeSpec::always("a", "b"))
            .with_timeout(60);
        store.save_flow(&flow).await.unwrap();
        assert_eq!(store.load_flow("triage", "acme").await.unwrap(), flow);

        let archived = flow.clone().with_status(FlowStatus::Archived);
        store.save_flow(&archived).await.unwrap();
        assert_eq!(
            store.load_flow("triage", "acme").await.unwrap().status,
            FlowStatus::Archived
        );
        assert!(matches!(
            store.load_flow("triage", "other").await,
            Err(FlowError::FlowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_execution_lifecycle() {
        let store = SqliteStore::in_memory().unwrap();
        let mut exec = FlowExecution::new(
            "triage",
            "acme",
            json!({"body": "help"}).as_object().cloned().unwrap(),
            Value::Null,
        );
        assert!(matches!(
            store.update_execution(&exec).await,
            Err(FlowError::ExecutionNotFound(_))
        ));

        store.create_execution(&exec).await.unwrap();
        exec.status = ExecutionStatus::Failed;
        exec.failure_kind = Some(FailureKind::Timeout);
        exec.execution_data.record("a", json!({"score": 0.7}));
        store.update_execution(&exec).await.unwrap();

        let loaded = store.get_execution(&exec.id).await.unwrap();
        assert_eq!(loaded, exec);
        assert!(matches!(
            store.get_execution(&ExecutionId::new()).await,
            Err(FlowError::ExecutionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() {
        let store = SqliteStore::in_memory().unwrap();
        let mut ids = Vec::new();
        for (flow, status) in [
            ("f1", ExecutionStatus::Completed),
            ("f2", ExecutionStatus::Failed),
            ("f1", ExecutionStatus::Failed),
        ] {
            let mut exec = FlowExecution::new(flow, "acme", Payload::new(), Value::Null);
            exec.status = status;
            store.create_execution(&exec).await.unwrap();
            ids.push(exec.id);
        }

        let all = store.list_executions(&ExecutionFilter::default()).await.unwrap();
        assert_eq!(
            all.iter().map(|e| e.id.clone()).collect::<Vec<_>>(),
            [ids[2].clone(), ids[1].clone(), ids[0].clone()]
        );

        let failed_f1 = store
            .list_executions(&ExecutionFilter {
                flow_id: Some("f1".into()),
                status: Some(ExecutionStatus::Failed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failed_f1.len(), 1);
        assert_eq!(failed_f1[0].id, ids[2]);

        let one = store
            .list_executions(&ExecutionFilter {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(one.len(), 1);

        let other_tenant = store
            .list_executions(&ExecutionFilter {
                tenant_id: Some("globex".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(other_tenant.is_empty());
    }

    #[tokio::test]
    async fn test_node_upsert_is_unique_per_node() {
        let store = SqliteStore::in_memory().unwrap();
        let exec_id = ExecutionId::new();

        let mut first = NodeExecution::new(exec_id.clone(), "a");
        store.upsert_node_execution(&first).await.unwrap();
        store
            .upsert_node_execution(&NodeExecution::new(exec_id.clone(), "b"))
            .await
            .unwrap();

        first.status = NodeStatus::Failed;
        first.retry_attempt = 2;
        first.error_message = Some("boom".into());
        store.upsert_node_execution(&first).await.unwrap();

        let nodes = store.list_node_executions(&exec_id).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0], first);
        assert_eq!(nodes[1].node_id, "b");
    }

    #[tokio::test]
    async fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("flows.db");
        let store = SqliteStore::open(&path).unwrap();
        store
            .save_flow(&FlowDefinition::new("f", "t").with_node(NodeSpec::delay("d", 1)))
            .await
            .unwrap();
        assert!(path.exists());
    }
}
