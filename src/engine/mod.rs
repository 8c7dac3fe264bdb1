mod availability;
mod conflict;
mod error;
mod ledger;
mod lifecycle;
mod queries;

pub use availability::{RuleBook, merge_overlapping, subtract_windows};
pub use error::EngineError;
pub use lifecycle::{is_edge, permitted_targets};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, Provider};
use crate::model::*;
use crate::notify::NotificationGateway;
use crate::observability;
use crate::wal::Wal;

pub type SharedDaySchedule = Arc<RwLock<DaySchedule>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Each Append wakes the loop, every other Append already
/// queued joins the same batch, and the batch shares one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // Everything queued before it must be on disk first.
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    debug!("WAL channel closed, writer exiting");
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut results = Vec::with_capacity(batch.len());
    for (event, _) in &batch {
        results.push(wal.append_buffered(event));
    }
    // A failed fsync fails the whole batch, including records that encoded fine.
    let flushed = wal.flush_sync();

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    if let Err(e) = &flushed {
        error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for ((_, tx), appended) in batch.into_iter().zip(results) {
        let outcome = match (&flushed, appended) {
            (_, Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(io::Error::new(e.kind(), e.to_string())),
            (Ok(()), Ok(())) => Ok(()),
        };
        let _ = tx.send(outcome);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            commit_batch(wal, vec![(event, response)]);
        }
    }
}

/// Booking scheduling core: one serialized schedule per provider and date,
/// the weekly rule book, and the indexes the queries need.
pub struct Engine {
    pub(super) days: DashMap<DayKey, SharedDaySchedule>,
    pub(super) rules: RuleBook,
    /// booking id → owning day
    pub(super) booking_index: DashMap<BookingId, DayKey>,
    pub(super) by_customer: DashMap<UserId, Vec<BookingId>>,
    pub(super) by_provider: DashMap<ProviderId, Vec<BookingId>>,
    pub(super) catalog: Arc<dyn Catalog>,
    pub(super) gateway: Arc<dyn NotificationGateway>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Writers hold it shared from WAL append until apply; compaction holds
    /// it exclusively so its snapshot and the log cannot drift apart.
    pub(super) commit_gate: RwLock<()>,
    /// Serializes rule upserts so WAL order matches apply order.
    pub(super) rule_writes: Mutex<()>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        catalog: Arc<dyn Catalog>,
        gateway: Arc<dyn NotificationGateway>,
    ) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            days: DashMap::new(),
            rules: RuleBook::new(),
            booking_index: DashMap::new(),
            by_customer: DashMap::new(),
            by_provider: DashMap::new(),
            catalog,
            gateway,
            wal_tx,
            commit_gate: RwLock::new(()),
            rule_writes: Mutex::new(()),
        };

        // Rebuild day schedules unshared first, then publish them.
        let mut days: HashMap<DayKey, DaySchedule> = HashMap::new();
        for event in &events {
            match event {
                Event::RuleUpserted { rule } => engine.rules.upsert(rule.clone()),
                Event::BookingCreated { booking } => {
                    let day = days
                        .entry((booking.provider_id, booking.date))
                        .or_insert_with(|| DaySchedule::new(booking.provider_id, booking.date));
                    engine.apply_to_day(day, event);
                }
                Event::BookingStatusChanged {
                    id,
                    provider_id,
                    date,
                    ..
                } => match days.get_mut(&(*provider_id, *date)) {
                    Some(day) => engine.apply_to_day(day, event),
                    None => {
                        warn!(booking = %id, "status change for unknown booking in WAL, skipping")
                    }
                },
            }
        }
        for (key, day) in days {
            engine.days.insert(key, Arc::new(RwLock::new(day)));
        }

        if !events.is_empty() {
            info!(
                events = events.len(),
                bookings = engine.booking_index.len(),
                rules = engine.rules.len(),
                "replayed WAL from {}",
                wal_path.display()
            );
        }
        Ok(engine)
    }

    /// Apply a booking event to its day. Caller holds the day's write lock.
    pub(super) fn apply_to_day(&self, day: &mut DaySchedule, event: &Event) {
        match event {
            Event::BookingCreated { booking } => {
                self.booking_index.insert(booking.id, day.key());
                self.by_customer
                    .entry(booking.customer_id)
                    .or_default()
                    .push(booking.id);
                self.by_provider
                    .entry(booking.provider_id)
                    .or_default()
                    .push(booking.id);
                day.insert_booking(booking.clone());
            }
            Event::BookingStatusChanged { id, status, .. } => match day.get_mut(id) {
                Some(b) => b.status = *status,
                None => warn!(booking = %id, "status change for booking missing from its day"),
            },
            Event::RuleUpserted { .. } => {}
        }
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        day: &mut DaySchedule,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_to_day(day, event);
        Ok(())
    }

    pub(super) async fn persist_rule(&self, rule: AvailabilityRule) -> Result<(), EngineError> {
        let _serial = self.rule_writes.lock().await;
        let _gate = self.commit_gate.read().await;
        self.wal_append(&Event::RuleUpserted { rule: rule.clone() })
            .await?;
        self.rules.upsert(rule);
        Ok(())
    }

    pub(super) fn existing_day(&self, key: &DayKey) -> Option<SharedDaySchedule> {
        self.days.get(key).map(|e| e.value().clone())
    }

    /// Day schedule for `key`, created empty on first write.
    pub(super) fn day_for_write(&self, key: DayKey) -> SharedDaySchedule {
        self.days
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(DaySchedule::new(key.0, key.1))))
            .value()
            .clone()
    }

    /// Take the commit gate and the write lock of the day owning `id`.
    pub(super) async fn lock_booking_day(
        &self,
        id: &BookingId,
    ) -> Result<(RwLockReadGuard<'_, ()>, OwnedRwLockWriteGuard<DaySchedule>), EngineError> {
        let key = self
            .booking_index
            .get(id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound { kind: "booking", id: *id })?;
        let day = self
            .existing_day(&key)
            .ok_or(EngineError::NotFound { kind: "booking", id: *id })?;
        let gate = self.commit_gate.read().await;
        Ok((gate, day.write_owned().await))
    }

    /// Catalog provider for a booking that already exists. A miss here
    /// means the catalog lost a provider that bookings still reference.
    pub(super) async fn provider_of_booking(
        &self,
        booking: &Booking,
    ) -> Result<Provider, EngineError> {
        match self.catalog.provider(booking.provider_id).await {
            Some(p) => Ok(p),
            None => {
                error!(
                    booking = %booking.id,
                    provider = %booking.provider_id,
                    "booking references a provider missing from the catalog"
                );
                Err(EngineError::NotFound {
                    kind: "provider",
                    id: booking.provider_id,
                })
            }
        }
    }

    /// The provider, if `actor` is the account acting for it.
    pub async fn authorize_provider(
        &self,
        provider_id: ProviderId,
        actor: UserId,
    ) -> Result<Provider, EngineError> {
        let provider = self
            .catalog
            .provider(provider_id)
            .await
            .ok_or(EngineError::NotFound {
                kind: "provider",
                id: provider_id,
            })?;
        if provider.user_id != actor {
            return Err(EngineError::Forbidden("not acting for this provider"));
        }
        Ok(provider)
    }

    /// Rewrite the WAL as one record per rule and one per booking.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut events: Vec<Event> = self
            .rules
            .all()
            .into_iter()
            .map(|rule| Event::RuleUpserted { rule })
            .collect();

        let days: Vec<SharedDaySchedule> = self.days.iter().map(|e| e.value().clone()).collect();
        for day in days {
            let guard = day.read().await;
            events.extend(
                guard
                    .bookings
                    .iter()
                    .map(|b| Event::BookingCreated { booking: b.clone() }),
            );
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!(records = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
