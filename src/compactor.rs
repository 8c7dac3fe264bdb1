use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::engine::{Engine, EngineError};

/// Compact once at least `threshold` records were appended since the last
/// compaction. Returns whether it compacted.
pub async fn maybe_compact(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    debug!(appends, threshold, "WAL over threshold, compacting");
    engine.compact_wal().await?;
    Ok(true)
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if let Err(e) = maybe_compact(&engine, threshold).await {
            error!("WAL compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use chrono::{NaiveDate, NaiveTime};
    use ulid::Ulid;

    use crate::catalog::{InMemoryCatalog, Provider, ServiceItem};
    use crate::model::*;
    use crate::notify::NotificationQueue;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bookd_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let provider_id = Ulid::new();
        let item_id = Ulid::new();
        catalog.insert_provider(Provider {
            id: provider_id,
            user_id: Ulid::new(),
            name: None,
        });
        catalog.insert_service_item(ServiceItem {
            id: item_id,
            name: "Deep clean".into(),
            base_price: Money(400_000),
            is_active: true,
        });
        let (queue, _rx) = NotificationQueue::channel();
        let engine = Engine::new(test_wal_path("threshold.wal"), catalog, Arc::new(queue)).unwrap();

        for h in 10..13 {
            engine
                .create_booking(BookingRequest {
                    customer_id: Ulid::new(),
                    provider_id,
                    service_item_id: item_id,
                    date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
                    window: TimeWindow::new(
                        NaiveTime::from_hms_opt(h, 0, 0).unwrap(),
                        NaiveTime::from_hms_opt(h + 1, 0, 0).unwrap(),
                    )
                    .unwrap(),
                    notes: None,
                    customer_address: None,
                    customer_phone: None,
                })
                .await
                .unwrap();
        }

        assert!(!maybe_compact(&engine, 4).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 3);
        assert!(maybe_compact(&engine, 3).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
