use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::engine::{Engine, EngineError};
use crate::observability::WAL_COMPACTIONS_TOTAL;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Rewrite the WAL as a snapshot once `threshold` appends have piled up.
/// Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
    info!("compacted WAL after {appends} appends");
    Ok(true)
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            error!("WAL compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("spabook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn service(name: &str) -> NewService {
        NewService {
            id: Ulid::new(),
            name: name.into(),
            name_en: None,
            duration_min: 45,
            price_cents: 6000,
            category: ServiceCategory::Body,
            active: true,
        }
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();

        let first = engine.create_service(service("Massage")).await.unwrap();
        engine
            .update_service(
                first.id,
                ServicePatch {
                    price_cents: Some(6500),
                    ..ServicePatch::default()
                },
            )
            .await
            .unwrap();
        assert!(!compact_if_due(&engine, 3).await.unwrap());

        engine.create_service(service("Scrub")).await.unwrap();
        assert!(compact_if_due(&engine, 3).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert!(!compact_if_due(&engine, 3).await.unwrap());
        drop(engine);

        let replayed = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
        let services = replayed.list_services(false);
        assert_eq!(services.len(), 2);
        assert_eq!(replayed.get_service(&first.id).unwrap().price_cents, 6500);
    }
}
