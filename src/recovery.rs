//! Recovery sweep run when the hosting session ends
//!
//! A worker process can be killed without ever reporting `worker-stop`, so
//! silence is never taken as success: every worker still `running` when the
//! session stops is closed as failed.

use serde::Serialize;

use crate::error::Result;
use crate::models::SESSION_TERMINATED;
use crate::store::Store;

/// Workers closed by one sweep
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub worker_ids: Vec<String>,
}

impl SweepReport {
    pub fn count(&self) -> usize {
        self.worker_ids.len()
    }
}

/// Fail all running workers in a single statement. A sweep with nothing running is a no-op.
pub async fn sweep(store: &Store) -> Result<SweepReport> {
    let worker_ids = store.sweep_orphans(SESSION_TERMINATED).await?;

    if worker_ids.is_empty() {
        tracing::debug!("recovery sweep found no running workers");
    } else {
        tracing::warn!(
            count = worker_ids.len(),
            workers = ?worker_ids,
            "closed orphaned workers after session stop"
        );
    }

    Ok(SweepReport { worker_ids })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewWorker, WorkerStatus};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> Store {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database");
        crate::store::migrate(&pool).await.unwrap();
        Store::new(pool)
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let store = setup_test_db().await;
        let spec_id = store.upsert_spec("auth", "auth", None).await.unwrap();
        for id in ["w-1", "w-2"] {
            store
                .insert_worker(
                    &spec_id,
                    NewWorker {
                        worker_id: id.to_string(),
                        session_id: None,
                        task_id: "1".to_string(),
                        task_title: None,
                        executor: "codex".to_string(),
                    },
                )
                .await
                .unwrap();
        }

        let first = sweep(&store).await.unwrap();
        assert_eq!(first.count(), 2);
        let second = sweep(&store).await.unwrap();
        assert_eq!(second.count(), 0);

        let worker = store.get_worker("w-2").await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Failed);
        assert_eq!(worker.result.as_deref(), Some(SESSION_TERMINATED));
    }
}
