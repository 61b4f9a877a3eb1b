//! The eviction scheduler.
//!
//! One recurring task per pool. Each run trims aged idle connections down
//! toward `min_idle`, validates the survivors, reclaims abandoned borrows,
//! and tops the idle set back up to `min_idle`. Physical closes happen
//! outside the pool locks so a slow network teardown never blocks
//! borrowers. Runs never overlap: the next tick waits for the previous
//! pass to finish.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::holder::ConnectionHolder;
use crate::pool::PoolInner;

/// Spawn the recurring eviction task for a pool.
///
/// Holds only a weak reference so an abandoned pool (dropped without
/// shutdown) is not kept alive by its own scheduler.
pub(crate) fn spawn(inner: &Arc<PoolInner>) -> JoinHandle<()> {
    let weak: Weak<PoolInner> = Arc::downgrade(inner);
    let period = inner.config.time_between_eviction_runs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so the pool's
        // warm-up state is left alone.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else { break };
            if inner.is_closed() {
                break;
            }
            inner.evict_once().await;
        }
    })
}

impl PoolInner {
    /// One full eviction pass.
    pub(crate) async fn evict_once(&self) {
        let now = Instant::now();
        let min_idle = self.config.min_idle as usize;
        let min_evictable = self.config.min_evictable_idle_time;

        let mut to_discard: Vec<ConnectionHolder> = Vec::new();
        let mut to_validate: Vec<ConnectionHolder> = Vec::new();

        // Partition the idle set under the lock. Aged holders beyond the
        // min_idle floor are discarded; aged holders needed for the floor,
        // plus everything else when test_while_idle is on, get probed.
        {
            let mut idle = self.idle.lock();
            let mut removable = idle.len().saturating_sub(min_idle);
            let mut keep: VecDeque<ConnectionHolder> = VecDeque::with_capacity(idle.len());
            while let Some(holder) = idle.pop_front() {
                let aged = holder.idle_for(now) >= min_evictable;
                if aged && removable > 0 {
                    removable -= 1;
                    to_discard.push(holder);
                } else if aged || self.config.test_while_idle {
                    to_validate.push(holder);
                } else {
                    keep.push_back(holder);
                }
            }
            *idle = keep;
        }

        // Probe outside the lock; failures mark for discard rather than
        // blocking anything.
        for holder in to_validate {
            if self.probe(holder.proxy()).await {
                self.idle.lock().push_back(holder);
            } else {
                to_discard.push(holder);
            }
        }

        let discarded = to_discard.len();
        for holder in to_discard {
            self.discard_holder(holder, "evicted").await;
        }

        if self.config.remove_abandoned {
            self.reclaim_abandoned(now).await;
        }

        let created = self.refill_to_min_idle().await;

        if discarded > 0 || created > 0 {
            tracing::debug!(
                pool = %self.name,
                discarded = discarded,
                created = created,
                "eviction pass complete"
            );
        }
    }

    /// Force-reclaim borrows held past the abandoned timeout.
    async fn reclaim_abandoned(&self, now: Instant) {
        let timeout = self.config.remove_abandoned_timeout;
        let expired: Vec<(ConnectionHolder, Duration)> = {
            let mut borrowed = self.borrowed.lock();
            let ids: Vec<u64> = borrowed
                .iter()
                .filter(|(_, entry)| {
                    now.saturating_duration_since(entry.borrowed_at) >= timeout
                })
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    borrowed.remove(&id).map(|entry| {
                        let held = now.saturating_duration_since(entry.borrowed_at);
                        (entry.holder, held)
                    })
                })
                .collect()
        };

        for (holder, held) in expired {
            self.counters.leaks_reclaimed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                pool = %self.name,
                connection_id = holder.proxy().id(),
                held_ms = u64::try_from(held.as_millis()).unwrap_or(u64::MAX),
                "abandoned connection reclaimed"
            );
            holder.proxy().mark_reclaimed(held);
            self.close_holder(holder).await;
            // The leaking borrower's permit comes back to the pool.
            self.semaphore.add_permits(1);
        }
    }

    /// Create connections until the idle set reaches `min_idle`.
    ///
    /// One failed creation stops the pass but never the scheduler; the
    /// next run retries.
    async fn refill_to_min_idle(&self) -> usize {
        let min_idle = self.config.min_idle as usize;
        let mut created = 0;
        loop {
            if self.is_closed() || self.idle.lock().len() >= min_idle {
                break;
            }
            if !self.try_reserve_slot() {
                break;
            }
            match self.create_connection().await {
                Ok(holder) => {
                    self.idle.lock().push_back(holder);
                    created += 1;
                }
                Err(e) => {
                    self.release_slot();
                    tracing::warn!(pool = %self.name, error = %e, "idle refill failed");
                    break;
                }
            }
        }
        created
    }
}
