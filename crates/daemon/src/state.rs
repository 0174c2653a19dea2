//! Shared coordinator state.
//!
//! `is_ripping` is an atomic flag claimed with compare-and-swap and released
//! by dropping the [`RipGuard`], so no exit path out of a rip cycle can
//! leave it set. Everything else sits behind one lock and only changes
//! through the transition methods below.

use crate::status::{CoordinatorStatus, Phase};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::info;

/// What a presence reading means relative to the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    /// Absent -> present: a rip cycle may start
    Inserted,
    /// Present -> absent
    Removed,
    /// The ejected disc was taken out; detection is re-armed
    RemovedAfterEject,
    /// Still waiting for the ejected disc to be taken out
    AwaitingRemoval,
    Unchanged,
}

#[derive(Debug, Default)]
struct Inner {
    last_ripped_disc: Option<String>,
    last_rip_at: Option<Instant>,
    last_disc_present: bool,
    waiting_for_disc_removal: bool,
    completed_cycles: u64,
    failed_cycles: u64,
    last_error: Option<String>,
}

#[derive(Debug)]
pub struct CoordinatorState {
    is_ripping: AtomicBool,
    cooldown: Duration,
    inner: RwLock<Inner>,
}

/// Proof that the holder owns the single rip slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct RipGuard {
    state: Arc<CoordinatorState>,
}

impl Drop for RipGuard {
    fn drop(&mut self) {
        self.state.is_ripping.store(false, Ordering::Release);
    }
}

impl CoordinatorState {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            is_ripping: AtomicBool::new(false),
            cooldown,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn is_ripping(&self) -> bool {
        self.is_ripping.load(Ordering::Acquire)
    }

    /// Claim the rip slot; `None` if a cycle is already running.
    pub fn try_begin_rip(self: &Arc<Self>) -> Option<RipGuard> {
        self.is_ripping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RipGuard {
                state: Arc::clone(self),
            })
    }

    /// Fold a presence reading into the edge-detection state.
    pub async fn observe_presence(&self, present: bool) -> PresenceChange {
        let mut inner = self.inner.write().await;

        if inner.waiting_for_disc_removal {
            if present {
                inner.last_disc_present = true;
                return PresenceChange::AwaitingRemoval;
            }
            inner.waiting_for_disc_removal = false;
            inner.last_disc_present = false;
            return PresenceChange::RemovedAfterEject;
        }

        let changed = present != inner.last_disc_present;
        inner.last_disc_present = present;
        match (changed, present) {
            (true, true) => PresenceChange::Inserted,
            (true, false) => PresenceChange::Removed,
            _ => PresenceChange::Unchanged,
        }
    }

    /// Fold a reading taken while a cycle holds the rip slot. Only removals
    /// are recorded; an insertion is left for the first poll after the cycle
    /// so its edge is not lost.
    pub async fn observe_presence_while_busy(&self, present: bool) -> PresenceChange {
        if present {
            return PresenceChange::Unchanged;
        }
        self.observe_presence(false).await
    }

    /// Called after a successful eject.
    pub async fn mark_ejected(&self) {
        let mut inner = self.inner.write().await;
        inner.waiting_for_disc_removal = true;
    }

    /// Remaining cooldown for `disc` at `now`; `None` when it may be ripped.
    /// A different disc is never held back.
    pub async fn cooldown_remaining(&self, disc: &str, now: Instant) -> Option<Duration> {
        let inner = self.inner.read().await;
        if inner.last_ripped_disc.as_deref() != Some(disc) {
            return None;
        }
        remaining(inner.last_rip_at, self.cooldown, now)
    }

    /// Record the end of a cycle for `disc`; starts its cooldown.
    pub async fn record_completion(&self, disc: &str, at: Instant, error: Option<String>) {
        let mut inner = self.inner.write().await;
        inner.last_ripped_disc = Some(disc.to_string());
        inner.last_rip_at = Some(at);
        match error {
            Some(e) => {
                inner.failed_cycles += 1;
                inner.last_error = Some(e);
            }
            None => inner.completed_cycles += 1,
        }
        info!(
            disc = %disc,
            cooldown_secs = self.cooldown.as_secs(),
            "cooldown started to prevent re-ripping the same disc"
        );
    }

    /// Record a failed cycle whose disc could not be identified.
    pub async fn record_failure(&self, error: String) {
        let mut inner = self.inner.write().await;
        inner.failed_cycles += 1;
        inner.last_error = Some(error);
    }

    pub async fn status(&self) -> CoordinatorStatus {
        self.status_at(Instant::now()).await
    }

    pub async fn status_at(&self, now: Instant) -> CoordinatorStatus {
        let inner = self.inner.read().await;
        let is_ripping = self.is_ripping();
        let cooldown_left = remaining(inner.last_rip_at, self.cooldown, now);

        let phase = if is_ripping {
            Phase::Ripping
        } else if inner.waiting_for_disc_removal {
            Phase::WaitingForRemoval
        } else if cooldown_left.is_some() {
            Phase::CoolingDown
        } else {
            Phase::Idle
        };

        CoordinatorStatus {
            phase,
            is_ripping,
            last_ripped_disc: inner.last_ripped_disc.clone(),
            cooldown_remaining_secs: cooldown_left.map(|d| d.as_secs_f64().ceil() as u64).unwrap_or(0),
            waiting_for_disc_removal: inner.waiting_for_disc_removal,
            last_disc_present: inner.last_disc_present,
            completed_cycles: inner.completed_cycles,
            failed_cycles: inner.failed_cycles,
            last_error: inner.last_error.clone(),
        }
    }
}

fn remaining(since: Option<Instant>, window: Duration, now: Instant) -> Option<Duration> {
    let elapsed = now.saturating_duration_since(since?);
    window.checked_sub(elapsed).filter(|d| !d.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> Arc<CoordinatorState> {
        Arc::new(CoordinatorState::new(Duration::from_secs(30)))
    }

    #[test]
    fn test_second_claim_is_rejected_until_release() {
        let state = state();
        let guard = state.try_begin_rip().unwrap();
        assert!(state.is_ripping());
        assert!(state.try_begin_rip().is_none());

        drop(guard);
        assert!(!state.is_ripping());
        assert!(state.try_begin_rip().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_admit_one() {
        let state = state();
        let barrier = Arc::new(tokio::sync::Barrier::new(16));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let state = state.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                state.try_begin_rip()
            }));
        }

        let mut guards = Vec::new();
        for handle in handles {
            if let Some(guard) = handle.await.unwrap() {
                guards.push(guard);
            }
        }
        assert_eq!(guards.len(), 1);
    }

    #[test]
    fn test_guard_released_on_panic() {
        let state = state();
        let cloned = state.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = cloned.try_begin_rip().unwrap();
            panic!("stage failed");
        }));
        assert!(result.is_err());
        assert!(!state.is_ripping());
    }

    #[tokio::test]
    async fn test_presence_edges() {
        let state = state();
        assert_eq!(state.observe_presence(false).await, PresenceChange::Unchanged);
        assert_eq!(state.observe_presence(true).await, PresenceChange::Inserted);
        assert_eq!(state.observe_presence(true).await, PresenceChange::Unchanged);
        assert_eq!(state.observe_presence(false).await, PresenceChange::Removed);
        assert_eq!(state.observe_presence(false).await, PresenceChange::Unchanged);
    }

    #[tokio::test]
    async fn test_waiting_for_removal() {
        let state = state();
        state.observe_presence(true).await;
        state.mark_ejected().await;

        // Tray closed again with the same disc
        assert_eq!(state.observe_presence(true).await, PresenceChange::AwaitingRemoval);
        assert_eq!(state.status().await.phase, Phase::WaitingForRemoval);

        assert_eq!(state.observe_presence(false).await, PresenceChange::RemovedAfterEject);
        assert!(!state.status().await.waiting_for_disc_removal);
        assert_eq!(state.observe_presence(true).await, PresenceChange::Inserted);
    }

    #[tokio::test]
    async fn test_busy_readings_only_record_removal() {
        let state = state();
        state.observe_presence(true).await;
        state.mark_ejected().await;

        // Ejected disc taken out mid-cycle, then a new one put in
        assert_eq!(
            state.observe_presence_while_busy(false).await,
            PresenceChange::RemovedAfterEject
        );
        assert_eq!(state.observe_presence_while_busy(true).await, PresenceChange::Unchanged);
        assert!(!state.status().await.last_disc_present);

        assert_eq!(state.observe_presence(true).await, PresenceChange::Inserted);
    }

    #[tokio::test]
    async fn test_cooldown_window_for_same_disc() {
        let state = state();
        let t = Instant::now();
        state.record_completion("X", t, None).await;

        assert!(state.cooldown_remaining("X", t + Duration::from_secs(10)).await.is_some());
        assert!(state.cooldown_remaining("X", t + Duration::from_secs(31)).await.is_none());
        assert!(state.cooldown_remaining("Y", t + Duration::from_secs(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_status_phases_and_counters() {
        let state = state();
        let t = Instant::now();
        assert_eq!(state.status_at(t).await.phase, Phase::Idle);

        state.record_completion("X", t, None).await;
        let status = state.status_at(t + Duration::from_secs(10)).await;
        assert_eq!(status.phase, Phase::CoolingDown);
        assert_eq!(status.cooldown_remaining_secs, 20);
        assert_eq!(status.completed_cycles, 1);

        state.record_failure("scan failed".to_string()).await;
        let status = state.status_at(t + Duration::from_secs(40)).await;
        assert_eq!(status.phase, Phase::Idle);
        assert_eq!(status.failed_cycles, 1);
        assert_eq!(status.last_error.as_deref(), Some("scan failed"));
    }
}
