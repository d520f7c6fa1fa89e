use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::ledger::{LedgerEntry, ResourceLedger};
use crate::error::PoolError;

/// How an attempt went for the identity it leased. Variants are ordered by
/// severity, so `max` picks the outcome that costs the identity most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReleaseOutcome {
    Success,
    /// A transient failure happened while the identity was in use.
    Transient,
    /// The downstream service blocked this identity.
    Rejected,
}

/// Allocation policy for the pool.
#[derive(Debug, Clone)]
pub struct PoolPolicy {
    /// How long a rejected identity stays ineligible.
    pub cooldown: Duration,
    /// Also cool down identities released after a transient failure.
    pub cooldown_on_transient: bool,
    /// Minimum spacing between successive leases of the same identity.
    pub min_reuse_spacing: Duration,
    /// Default wait in [`ResourcePool::acquire`] before giving up.
    pub acquire_timeout: Duration,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(24 * 60 * 60),
            cooldown_on_transient: false,
            min_reuse_spacing: Duration::ZERO,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of one egress identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceRecord {
    pub identifier: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub use_count: u64,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub assigned: bool,
}

impl ResourceRecord {
    fn fresh(identifier: String) -> Self {
        Self {
            identifier,
            last_used_at: None,
            first_seen_at: None,
            use_count: 0,
            cooldown_until: None,
            assigned: false,
        }
    }

    fn from_ledger(identifier: String, entry: &LedgerEntry) -> Self {
        Self {
            identifier,
            last_used_at: entry.last_used,
            first_seen_at: Some(entry.first_seen),
            use_count: entry.use_count,
            cooldown_until: entry.cooldown_until,
            assigned: false,
        }
    }

    fn to_ledger(&self) -> Option<LedgerEntry> {
        Some(LedgerEntry {
            last_used: self.last_used_at,
            first_seen: self.first_seen_at?,
            use_count: self.use_count,
            cooldown_until: self.cooldown_until,
        })
    }

    /// Whether a cooldown is still running at `now`.
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

type Slot = Arc<Mutex<ResourceRecord>>;

enum Selection {
    Leased(String),
    Wait { next_eligible: Option<DateTime<Utc>> },
}

fn lock(slot: &Slot) -> MutexGuard<'_, ResourceRecord> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Raises the cooldown to `until` unless it is already later.
fn extend_cooldown(record: &mut ResourceRecord, until: DateTime<Utc>) {
    record.cooldown_until = Some(record.cooldown_until.map_or(until, |current| current.max(until)));
}

/// Hands out one egress identity per attempt, least recently used first,
/// and keeps rejected identities out of rotation until their cooldown ends.
///
/// Every record sits behind its own mutex. The map lock is held only while
/// scanning for a candidate, never while waiting.
#[derive(Debug)]
pub struct ResourcePool {
    slots: RwLock<BTreeMap<String, Slot>>,
    /// Ledger entries for identities no longer configured; kept so the
    /// ledger never drops history on its own.
    retired: Mutex<BTreeMap<String, LedgerEntry>>,
    ledger: ResourceLedger,
    persist_lock: Mutex<()>,
    policy: PoolPolicy,
    released: Notify,
}

impl ResourcePool {
    /// Builds a pool over `identifiers`, restoring their history from the ledger.
    pub fn new<I, S>(
        identifiers: I,
        ledger: ResourceLedger,
        policy: PoolPolicy,
    ) -> Result<Self, PoolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut known = ledger.load()?;
        let mut slots = BTreeMap::new();
        for identifier in identifiers {
            let identifier = identifier.into();
            let record = match known.remove(&identifier) {
                Some(entry) => ResourceRecord::from_ledger(identifier.clone(), &entry),
                None => ResourceRecord::fresh(identifier.clone()),
            };
            slots.insert(identifier, Arc::new(Mutex::new(record)));
        }
        if slots.is_empty() {
            return Err(PoolError::Empty);
        }

        info!(
            resources = slots.len(),
            retired = known.len(),
            cooldown_secs = policy.cooldown.as_secs(),
            "resource pool ready"
        );

        Ok(Self {
            slots: RwLock::new(slots),
            retired: Mutex::new(known),
            ledger,
            persist_lock: Mutex::new(()),
            policy,
            released: Notify::new(),
        })
    }

    /// The allocation policy the pool was built with.
    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    /// Leases an identity, waiting up to the configured acquire timeout.
    pub async fn acquire(&self) -> Result<String, PoolError> {
        self.acquire_within(self.policy.acquire_timeout).await
    }

    /// Leases the least recently used eligible identity, waiting at most
    /// `timeout` for one to become eligible.
    pub async fn acquire_within(&self, timeout: Duration) -> Result<String, PoolError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register for release notifications before scanning so a release
            // between the scan and the wait is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Utc::now();
            let next_eligible = match self.select(now)? {
                Selection::Leased(identifier) => return Ok(identifier),
                Selection::Wait { next_eligible } => next_eligible,
            };

            if Instant::now() >= deadline {
                warn!(waited_ms = timeout.as_millis() as u64, "no eligible egress identity");
                return Err(PoolError::Exhausted { waited: timeout });
            }

            let wake = next_eligible
                .and_then(|at| (at - now).to_std().ok())
                .map_or(deadline, |until| deadline.min(Instant::now() + until));

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    /// Like [`acquire`](Self::acquire) but returns a guard that releases on drop.
    pub async fn lease(self: &Arc<Self>) -> Result<Lease, PoolError> {
        let identifier = self.acquire().await?;
        Ok(Lease {
            pool: Arc::clone(self),
            identifier,
            on_drop: ReleaseOutcome::Success,
            released: false,
        })
    }

    fn eligible_at(&self, record: &ResourceRecord) -> Option<DateTime<Utc>> {
        let spacing = chrono::Duration::from_std(self.policy.min_reuse_spacing)
            .unwrap_or(chrono::Duration::zero());
        let reuse_at = record.last_used_at.map(|at| at + spacing);
        match (record.cooldown_until, reuse_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    fn is_eligible(&self, record: &ResourceRecord, now: DateTime<Utc>) -> bool {
        !record.assigned && self.eligible_at(record).is_none_or(|at| at <= now)
    }

    fn select(&self, now: DateTime<Utc>) -> Result<Selection, PoolError> {
        let mut candidates = Vec::new();
        let mut next_eligible: Option<DateTime<Utc>> = None;
        {
            let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
            if slots.is_empty() {
                return Err(PoolError::Empty);
            }
            for (identifier, slot) in slots.iter() {
                let record = lock(slot);
                if record.assigned {
                    continue;
                }
                if self.is_eligible(&record, now) {
                    candidates.push((record.last_used_at, identifier.clone(), Arc::clone(slot)));
                } else if let Some(at) = self.eligible_at(&record) {
                    next_eligible = Some(next_eligible.map_or(at, |n| n.min(at)));
                }
            }
        }

        // Never-used identities sort first (None < Some).
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        for (_, identifier, slot) in candidates {
            let mut record = lock(&slot);
            // Another acquirer may have won the race since the scan.
            if !self.is_eligible(&record, now) {
                continue;
            }
            record.assigned = true;
            record.last_used_at = Some(now);
            record.first_seen_at.get_or_insert(now);
            record.use_count += 1;
            debug!(resource = %identifier, use_count = record.use_count, "resource leased");
            return Ok(Selection::Leased(identifier));
        }

        Ok(Selection::Wait { next_eligible })
    }

    fn slot(&self, identifier: &str) -> Result<Slot, PoolError> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identifier)
            .cloned()
            .ok_or_else(|| PoolError::UnknownResource(identifier.to_string()))
    }

    fn penalizes(&self, outcome: ReleaseOutcome) -> bool {
        match outcome {
            ReleaseOutcome::Success => false,
            ReleaseOutcome::Rejected => true,
            ReleaseOutcome::Transient => self.policy.cooldown_on_transient,
        }
    }

    /// Returns a leased identity to the pool.
    ///
    /// A penalising outcome puts the identity in cooldown. Releasing an
    /// identity that is not leased is reported as [`PoolError::NotLeased`].
    ///
    /// The ledger is rewritten synchronously before this returns: a small
    /// JSON file written to a temp file and renamed into place. It stays
    /// synchronous because [`Lease`] releases from `Drop`, including while a
    /// panicking task unwinds, where nothing can be awaited. Async callers
    /// that release often should use [`release_async`](Self::release_async).
    pub fn release(&self, identifier: &str, outcome: ReleaseOutcome) -> Result<(), PoolError> {
        let slot = self.slot(identifier)?;
        {
            let mut record = lock(&slot);
            if !record.assigned {
                return Err(PoolError::NotLeased(identifier.to_string()));
            }
            record.assigned = false;
            if self.penalizes(outcome) {
                let cooldown = chrono::Duration::from_std(self.policy.cooldown)
                    .unwrap_or(chrono::Duration::MAX);
                let until = Utc::now()
                    .checked_add_signed(cooldown)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                extend_cooldown(&mut record, until);
                warn!(
                    resource = %identifier,
                    ?outcome,
                    cooldown_until = %until,
                    "resource cooling down"
                );
            } else {
                debug!(resource = %identifier, ?outcome, "resource released");
            }
        }
        self.released.notify_waiters();

        if let Err(err) = self.persist() {
            error!(resource = %identifier, error = %err, "failed to persist resource ledger");
        }
        Ok(())
    }

    /// [`release`](Self::release) with the ledger write moved onto tokio's
    /// blocking thread pool, so a slow disk never stalls a runtime worker.
    pub async fn release_async(
        self: &Arc<Self>,
        identifier: &str,
        outcome: ReleaseOutcome,
    ) -> Result<(), PoolError> {
        let pool = Arc::clone(self);
        let owned = identifier.to_string();
        match tokio::task::spawn_blocking(move || pool.release(&owned, outcome)).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            // Cancelled before it ran: the runtime is shutting down.
            Err(_) => self.release(identifier, outcome),
        }
    }

    fn persist(&self) -> Result<(), PoolError> {
        let _guard = self.persist_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.retired.lock().unwrap_or_else(PoisonError::into_inner).clone();
        for record in self.snapshot() {
            if let Some(entry) = record.to_ledger() {
                entries.insert(record.identifier, entry);
            }
        }
        self.ledger.save(&entries)?;
        Ok(())
    }

    /// Read-only view of every configured identity.
    pub fn snapshot(&self) -> Vec<ResourceRecord> {
        let slots: Vec<Slot> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        slots.iter().map(|slot| lock(slot).clone()).collect()
    }

    /// Number of identities that could be leased right now.
    pub fn eligible_count(&self) -> usize {
        let now = Utc::now();
        self.snapshot().iter().filter(|r| self.is_eligible(r, now)).count()
    }

    /// Adds a newly observed identity; a no-op if it is already known.
    pub fn observe(&self, identifier: impl Into<String>) {
        let identifier = identifier.into();
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if slots.contains_key(&identifier) {
            return;
        }
        let revived = self
            .retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&identifier);
        let record = match revived {
            Some(entry) => ResourceRecord::from_ledger(identifier.clone(), &entry),
            None => ResourceRecord::fresh(identifier.clone()),
        };
        info!(resource = %identifier, "resource added to pool");
        slots.insert(identifier, Arc::new(Mutex::new(record)));
        drop(slots);
        self.released.notify_waiters();
    }

    /// Maintenance: forgets an identity entirely, including its ledger history.
    pub fn evict(&self, identifier: &str) -> Result<(), PoolError> {
        {
            let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            let assigned = slots.get(identifier).map(|slot| lock(slot).assigned);
            match assigned {
                Some(true) => return Err(PoolError::Busy(identifier.to_string())),
                Some(false) => {
                    slots.remove(identifier);
                }
                None => {
                    let removed = self
                        .retired
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(identifier);
                    if removed.is_none() {
                        return Err(PoolError::UnknownResource(identifier.to_string()));
                    }
                }
            }
        }
        info!(resource = %identifier, "resource evicted");
        self.persist()
    }
}

/// A leased identity. Dropping it without [`Lease::release`] returns it to
/// the pool with the most severe outcome noted so far, so a panicking stage
/// neither leaks the identity nor clears a penalty it already earned.
#[derive(Debug)]
pub struct Lease {
    pool: Arc<ResourcePool>,
    identifier: String,
    on_drop: ReleaseOutcome,
    released: bool,
}

impl Lease {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Records what the attempt has cost the identity so far. Only ever
    /// raises the outcome a drop would release with.
    pub fn note(&mut self, outcome: ReleaseOutcome) {
        self.on_drop = self.on_drop.max(outcome);
    }

    /// The outcome a drop would release with.
    pub fn noted(&self) -> ReleaseOutcome {
        self.on_drop
    }

    /// Returns the identity with `outcome`, writing the ledger off the runtime threads.
    pub async fn release(mut self, outcome: ReleaseOutcome) -> Result<(), PoolError> {
        self.released = true;
        self.pool.release_async(&self.identifier, outcome).await
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            let outcome = self.on_drop;
            warn!(resource = %self.identifier, ?outcome, "lease dropped without release");
            if let Err(err) = self.pool.release(&self.identifier, outcome) {
                error!(
                    resource = %self.identifier,
                    error = %err,
                    "failed to release dropped lease"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(cooldown: Duration) -> PoolPolicy {
        PoolPolicy {
            cooldown,
            acquire_timeout: Duration::from_millis(100),
            ..Default::default()
        }
    }

    fn pool(ids: &[&str], cooldown: Duration) -> Arc<ResourcePool> {
        let ledger = ResourceLedger::in_memory();
        Arc::new(ResourcePool::new(ids.iter().copied(), ledger, policy(cooldown)).unwrap())
    }

    fn record(pool: &ResourcePool, id: &str) -> ResourceRecord {
        pool.snapshot().into_iter().find(|r| r.identifier == id).unwrap()
    }

    #[test]
    fn empty_pool_is_rejected() {
        let err = ResourcePool::new(
            Vec::<String>::new(),
            ResourceLedger::in_memory(),
            PoolPolicy::default(),
        );
        assert!(matches!(err, Err(PoolError::Empty)));
    }

    #[tokio::test]
    async fn least_recently_used_first() {
        let pool = pool(&["a", "b", "c"], Duration::from_secs(60));

        let first = pool.acquire().await.unwrap();
        assert_eq!(first, "a");
        pool.release(&first, ReleaseOutcome::Success).unwrap();

        // a was just used, so the never-used identities come first.
        assert_eq!(pool.acquire().await.unwrap(), "b");
        assert_eq!(pool.acquire().await.unwrap(), "c");
        // Only a remains unassigned.
        assert_eq!(pool.acquire().await.unwrap(), "a");
    }

    #[tokio::test]
    async fn held_identities_are_exclusive() {
        let pool = pool(&["a", "b"], Duration::from_secs(60));
        let x = pool.acquire().await.unwrap();
        let y = pool.acquire().await.unwrap();
        assert_ne!(x, y);

        let err = pool.acquire_within(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));
        assert!(pool.snapshot().iter().all(|r| r.assigned));
    }

    #[tokio::test]
    async fn waiting_acquirer_wakes_on_release() {
        let pool = pool(&["only"], Duration::from_secs(60));
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire_within(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release(&held, ReleaseOutcome::Success).unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, "only");
        assert_eq!(record(&pool, "only").use_count, 2);
    }

    #[tokio::test]
    async fn rejected_identity_is_skipped_until_cooldown_ends() {
        let pool = pool(&["x", "y"], Duration::from_secs(24 * 60 * 60));
        let x = pool.acquire().await.unwrap();
        assert_eq!(x, "x");
        pool.release(&x, ReleaseOutcome::Rejected).unwrap();

        let before = Utc::now();
        let cooled = record(&pool, "x");
        assert!(cooled.cooldown_until.unwrap() > before + chrono::Duration::hours(23));

        for _ in 0..3 {
            let next = pool.acquire().await.unwrap();
            assert_eq!(next, "y");
            pool.release(&next, ReleaseOutcome::Success).unwrap();
        }
    }

    #[tokio::test]
    async fn cooled_identity_returns_after_cooldown() {
        let pool = pool(&["x"], Duration::from_millis(150));
        let x = pool.acquire().await.unwrap();
        pool.release(&x, ReleaseOutcome::Rejected).unwrap();
        let until = record(&pool, "x").cooldown_until.unwrap();

        let again = pool.acquire_within(Duration::from_secs(2)).await.unwrap();
        assert_eq!(again, "x");
        assert!(Utc::now() >= until);
    }

    #[tokio::test]
    async fn success_leaves_cooldown_untouched() {
        let pool = pool(&["x"], Duration::from_secs(60));
        let before = record(&pool, "x");

        let x = pool.acquire().await.unwrap();
        pool.release(&x, ReleaseOutcome::Success).unwrap();

        let after = record(&pool, "x");
        assert_eq!(after.cooldown_until, before.cooldown_until);
        assert_eq!(after.use_count, before.use_count + 1);
        assert!(!after.assigned);
    }

    #[tokio::test]
    async fn transient_penalty_follows_policy() {
        let lenient = pool(&["x"], Duration::from_secs(60));
        let x = lenient.acquire().await.unwrap();
        lenient.release(&x, ReleaseOutcome::Transient).unwrap();
        assert!(record(&lenient, "x").cooldown_until.is_none());

        let strict = Arc::new(
            ResourcePool::new(
                ["x"],
                ResourceLedger::in_memory(),
                PoolPolicy {
                    cooldown_on_transient: true,
                    ..policy(Duration::from_secs(60))
                },
            )
            .unwrap(),
        );
        let x = strict.acquire().await.unwrap();
        strict.release(&x, ReleaseOutcome::Transient).unwrap();
        assert!(record(&strict, "x").in_cooldown(Utc::now()));
    }

    #[tokio::test]
    async fn misuse_of_release_is_distinct() {
        let pool = pool(&["x"], Duration::from_secs(60));
        assert!(matches!(
            pool.release("x", ReleaseOutcome::Success),
            Err(PoolError::NotLeased(_))
        ));

        let x = pool.acquire().await.unwrap();
        pool.release(&x, ReleaseOutcome::Success).unwrap();
        assert!(matches!(
            pool.release(&x, ReleaseOutcome::Success),
            Err(PoolError::NotLeased(_))
        ));
        assert!(matches!(
            pool.release("nope", ReleaseOutcome::Success),
            Err(PoolError::UnknownResource(_))
        ));
    }

    #[test]
    fn cooldown_never_moves_backwards() {
        let mut record = ResourceRecord::fresh("x".into());
        let later = Utc::now() + chrono::Duration::hours(48);
        extend_cooldown(&mut record, later);
        extend_cooldown(&mut record, Utc::now() + chrono::Duration::hours(1));
        assert_eq!(record.cooldown_until, Some(later));
    }

    #[tokio::test]
    async fn min_reuse_spacing_delays_reuse() {
        let pool = Arc::new(
            ResourcePool::new(
                ["x"],
                ResourceLedger::in_memory(),
                PoolPolicy {
                    min_reuse_spacing: Duration::from_secs(60),
                    ..policy(Duration::from_secs(60))
                },
            )
            .unwrap(),
        );
        let x = pool.acquire().await.unwrap();
        pool.release(&x, ReleaseOutcome::Success).unwrap();
        assert_eq!(pool.eligible_count(), 0);
        assert!(pool.acquire_within(Duration::from_millis(30)).await.is_err());
    }

    #[tokio::test]
    async fn cooldown_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resources.json");
        {
            let hour = policy(Duration::from_secs(3600));
            let pool = ResourcePool::new(["x", "y"], ResourceLedger::open(&path), hour).unwrap();
            let x = pool.acquire().await.unwrap();
            pool.release(&x, ReleaseOutcome::Rejected).unwrap();
        }

        let hour = policy(Duration::from_secs(3600));
        let pool = ResourcePool::new(["x", "y"], ResourceLedger::open(&path), hour).unwrap();
        let x = record(&pool, "x");
        assert_eq!(x.use_count, 1);
        assert!(x.in_cooldown(Utc::now()));
        assert_eq!(pool.acquire().await.unwrap(), "y");
    }

    #[tokio::test]
    async fn retired_identities_stay_in_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resources.json");
        {
            let ledger = ResourceLedger::open(&path);
            let pool = ResourcePool::new(["old"], ledger, policy(Duration::from_secs(60))).unwrap();
            let id = pool.acquire().await.unwrap();
            pool.release(&id, ReleaseOutcome::Success).unwrap();
        }

        let ledger = ResourceLedger::open(&path);
        let pool = ResourcePool::new(["new"], ledger, policy(Duration::from_secs(60))).unwrap();
        let id = pool.acquire().await.unwrap();
        pool.release(&id, ReleaseOutcome::Success).unwrap();

        let saved = ResourceLedger::open(&path).load().unwrap();
        assert!(saved.contains_key("old"));
        assert!(saved.contains_key("new"));
    }

    #[tokio::test]
    async fn evict_refuses_leased_identity() {
        let pool = pool(&["x", "y"], Duration::from_secs(60));
        let x = pool.acquire().await.unwrap();
        assert!(matches!(pool.evict(&x), Err(PoolError::Busy(_))));
        pool.evict("y").unwrap();
        assert_eq!(pool.snapshot().len(), 1);
        assert!(matches!(pool.evict("y"), Err(PoolError::UnknownResource(_))));
    }

    #[tokio::test]
    async fn observe_adds_identity_and_wakes_waiters() {
        let pool = pool(&["x"], Duration::from_secs(60));
        let _held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire_within(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.observe("z");

        assert_eq!(waiter.await.unwrap().unwrap(), "z");
    }

    #[tokio::test]
    async fn dropped_lease_is_released() {
        let pool = pool(&["x"], Duration::from_secs(60));
        {
            let lease = pool.lease().await.unwrap();
            assert_eq!(lease.identifier(), "x");
            assert!(record(&pool, "x").assigned);
        }
        assert!(!record(&pool, "x").assigned);
        assert!(record(&pool, "x").cooldown_until.is_none());
    }

    #[test]
    fn outcomes_order_by_severity() {
        use ReleaseOutcome::*;
        assert!(Success < Transient && Transient < Rejected);
        assert_eq!(Rejected.max(Transient), Rejected);
    }

    #[tokio::test]
    async fn dropped_lease_keeps_the_noted_penalty() {
        let pool = pool(&["x"], Duration::from_secs(60));
        {
            let mut lease = pool.lease().await.unwrap();
            lease.note(ReleaseOutcome::Rejected);
            lease.note(ReleaseOutcome::Success);
            assert_eq!(lease.noted(), ReleaseOutcome::Rejected);
        }
        let x = record(&pool, "x");
        assert!(!x.assigned);
        assert!(x.in_cooldown(Utc::now()));
    }

    #[tokio::test]
    async fn async_release_persists_the_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resources.json");
        let ledger = ResourceLedger::open(&path);
        let minute = policy(Duration::from_secs(60));
        let pool = Arc::new(ResourcePool::new(["x"], ledger, minute).unwrap());

        let lease = pool.lease().await.unwrap();
        lease.release(ReleaseOutcome::Rejected).await.unwrap();

        assert!(!record(&pool, "x").assigned);
        let saved = ResourceLedger::open(&path).load().unwrap();
        assert!(saved["x"].cooldown_until.is_some());
    }
}
