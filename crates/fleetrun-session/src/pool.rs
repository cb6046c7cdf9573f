//! Keyed cache of remote-shell sessions with a capacity bound and idle sweep.

use std::collections::HashMap;
use std::fmt;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use fleetrun_core::{ExecError, HostTarget, Transport};

use crate::session::{RemoteSession, SessionLimits};

/// Pool tuning knobs. Injected at construction; no global state.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Hard cap on concurrently open sessions, idle or checked out.
    pub max_connections: usize,
    /// Idle sessions unused longer than this are closed by the sweeper.
    pub idle_timeout: Duration,
    /// How often the sweeper wakes.
    pub sweep_interval: Duration,
    /// How long `acquire` waits for a slot before failing `PoolExhausted`.
    pub acquire_timeout: Duration,
    /// Limits applied to every session's executions.
    pub limits: SessionLimits,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(30),
            limits: SessionLimits::default(),
        }
    }
}

struct IdleEntry {
    session: RemoteSession,
    permit: OwnedSemaphorePermit,
    last_used: Instant,
}

/// A session checked out of the pool.
///
/// Held by exactly one executor at a time: checkout moves the session out of
/// the pool's idle map, so exclusive use is an ownership fact. Hand it back
/// with [`ConnectionPool::release`] or [`ConnectionPool::discard`].
pub struct PooledSession {
    session: RemoteSession,
    key: String,
    permit: OwnedSemaphorePermit,
}

impl PooledSession {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl std::ops::Deref for PooledSession {
    type Target = RemoteSession;

    fn deref(&self) -> &RemoteSession {
        &self.session
    }
}

impl std::ops::DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut RemoteSession {
        &mut self.session
    }
}

enum Checkout {
    /// An idle session for the requested key.
    Reuse(Box<IdleEntry>),
    /// Capacity for a fresh connection.
    Slot(OwnedSemaphorePermit),
    /// At capacity, but this cold idle session can be closed to make room.
    Evict(Box<IdleEntry>),
    /// Every slot is checked out; wait for a release.
    Wait,
}

/// Keyed cache of `RemoteSession` handles reused across batches.
///
/// The idle map is the only state shared across host tasks; it is guarded by
/// a std mutex that is never held across an await. Capacity is a semaphore
/// whose permits travel with each open session.
pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    config: PoolConfig,
    idle: Mutex<HashMap<String, IdleEntry>>,
    slots: Arc<Semaphore>,
    returned: Notify,
    closed: AtomicBool,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: PoolConfig) -> Self {
        Self {
            transport,
            config,
            idle: Mutex::new(HashMap::new()),
            slots: Arc::new(Semaphore::new(config.max_connections)),
            returned: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of idle cached sessions.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle_map().len()
    }

    /// The idle map holds no invariants beyond its entries, so a poisoned
    /// lock is recoverable.
    fn idle_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, IdleEntry>> {
        self.idle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Check out a session for the target, reusing an idle one when present.
    ///
    /// When every slot is checked out, waits up to `acquire_timeout` for a
    /// release before failing.
    ///
    /// # Errors
    /// - `PoolExhausted` when no slot frees within the acquire timeout
    /// - `PoolClosed` after `close_all`
    /// - `Connection` when opening a fresh session fails
    pub async fn acquire(&self, target: &HostTarget) -> Result<PooledSession, ExecError> {
        let key = target.pool_key();
        let deadline = Instant::now() + self.config.acquire_timeout;

        loop {
            if self.is_closed() {
                return Err(ExecError::PoolClosed);
            }

            // Register for release notifications before inspecting state so a
            // release between the check and the wait is not lost.
            let mut notified = pin!(self.returned.notified());
            notified.as_mut().enable();

            match self.poll_checkout(&key) {
                Checkout::Reuse(entry) => {
                    let entry = *entry;
                    if entry.session.is_broken() {
                        // Stale cache entry; dropping it frees the slot.
                        drop(entry);
                        self.returned.notify_waiters();
                        continue;
                    }
                    tracing::debug!(%key, "reusing idle session");
                    return Ok(PooledSession {
                        session: entry.session,
                        key,
                        permit: entry.permit,
                    });
                }
                Checkout::Slot(permit) => return self.open(target, key, permit).await,
                Checkout::Evict(entry) => {
                    let mut entry = *entry;
                    tracing::debug!(evicted = %entry.session.host(), "evicting idle session to free a slot");
                    entry.session.close().await;
                    drop(entry);
                    self.returned.notify_waiters();
                }
                Checkout::Wait => {
                    let Some(wait) = deadline.checked_duration_since(Instant::now()) else {
                        return Err(ExecError::PoolExhausted {
                            max: self.config.max_connections,
                        });
                    };
                    if tokio::time::timeout(wait, notified).await.is_err() {
                        return Err(ExecError::PoolExhausted {
                            max: self.config.max_connections,
                        });
                    }
                }
            }
        }
    }

    /// Return a session to the idle set without closing it.
    pub async fn release(&self, pooled: PooledSession) {
        let PooledSession {
            mut session,
            key,
            permit,
        } = pooled;

        if self.is_closed() || session.is_broken() {
            session.close().await;
            drop(permit);
        } else {
            let leftover = {
                let mut idle = self.idle_map();
                match idle.entry(key) {
                    std::collections::hash_map::Entry::Vacant(slot) => {
                        slot.insert(IdleEntry {
                            session,
                            permit,
                            last_used: Instant::now(),
                        });
                        None
                    }
                    // Another release beat us to the key; keep theirs.
                    std::collections::hash_map::Entry::Occupied(_) => Some((session, permit)),
                }
            };
            if let Some((mut session, permit)) = leftover {
                session.close().await;
                drop(permit);
            }
        }
        self.returned.notify_waiters();
    }

    /// Close a broken session and free its slot.
    pub async fn discard(&self, pooled: PooledSession) {
        let PooledSession {
            mut session, key, ..
        } = pooled;
        tracing::debug!(%key, "discarding session");
        session.close().await;
        // permit dropped with `pooled`'s remains
        self.returned.notify_waiters();
    }

    /// Close and evict idle sessions unused longer than `idle_timeout`.
    pub async fn sweep_idle(&self) {
        let Some(cutoff) = Instant::now().checked_sub(self.config.idle_timeout) else {
            return;
        };
        let expired: Vec<IdleEntry> = {
            let mut idle = self.idle_map();
            let keys: Vec<String> = idle
                .iter()
                .filter(|(_, e)| e.last_used < cutoff)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| idle.remove(k)).collect()
        };
        if expired.is_empty() {
            return;
        }
        tracing::debug!(count = expired.len(), "sweeping idle sessions");
        for mut entry in expired {
            entry.session.close().await;
        }
        self.returned.notify_waiters();
    }

    /// Spawn the background sweeper. Ends once the pool is closed.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(pool.config.sweep_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if pool.is_closed() {
                    break;
                }
                pool.sweep_idle().await;
            }
        })
    }

    /// Terminate every tracked session and refuse further acquires.
    ///
    /// Checked-out sessions are closed as they come back through `release`.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<IdleEntry> = {
            let mut idle = self.idle_map();
            idle.drain().map(|(_, entry)| entry).collect()
        };
        tracing::info!(count = drained.len(), "closing connection pool");
        for mut entry in drained {
            entry.session.close().await;
        }
        self.returned.notify_waiters();
    }

    fn poll_checkout(&self, key: &str) -> Checkout {
        let mut idle = self.idle_map();
        if let Some(entry) = idle.remove(key) {
            return Checkout::Reuse(Box::new(entry));
        }
        if let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() {
            return Checkout::Slot(permit);
        }
        let lru = idle
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| k.clone());
        match lru.and_then(|k| idle.remove(&k)) {
            Some(entry) => Checkout::Evict(Box::new(entry)),
            None => Checkout::Wait,
        }
    }

    async fn open(
        &self,
        target: &HostTarget,
        key: String,
        permit: OwnedSemaphorePermit,
    ) -> Result<PooledSession, ExecError> {
        tracing::debug!(host = %target.host_id, %key, "opening session");
        let shell = self.transport.connect(target).await?;
        let session = RemoteSession::new(target.host_id.clone(), shell, self.config.limits);
        Ok(PooledSession {
            session,
            key,
            permit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTransport, target};

    fn pool_with(transport: &FakeTransport, config: PoolConfig) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(Arc::new(transport.clone()), config))
    }

    #[tokio::test]
    async fn released_session_is_reused_for_same_key() {
        let transport = FakeTransport::new();
        let pool = pool_with(&transport, PoolConfig::default());
        let host = target("web-1");

        let first = pool.acquire(&host).await.unwrap();
        pool.release(first).await;
        let second = pool.acquire(&host).await.unwrap();

        assert_eq!(transport.opened_total(), 1);
        assert_eq!(second.key(), "ops@web-1.internal:22");
    }

    #[tokio::test]
    async fn at_capacity_an_idle_session_is_evicted_for_a_new_key() {
        let transport = FakeTransport::new();
        let pool = pool_with(
            &transport,
            PoolConfig {
                max_connections: 1,
                ..PoolConfig::default()
            },
        );

        let a = pool.acquire(&target("a")).await.unwrap();
        pool.release(a).await;
        assert_eq!(pool.idle_count(), 1);

        // The single slot is held by a's idle session; acquiring b evicts it.
        let b = pool.acquire(&target("b")).await.unwrap();
        assert_eq!(transport.opened_total(), 2);
        assert_eq!(transport.open_now(), 1);
        pool.release(b).await;
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_blocks_until_release_when_all_slots_checked_out() {
        let transport = FakeTransport::new();
        let pool = pool_with(
            &transport,
            PoolConfig {
                max_connections: 1,
                ..PoolConfig::default()
            },
        );

        let a = pool.acquire(&target("a")).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(&target("b")).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        pool.release(a).await;
        let b = waiter.await.unwrap().unwrap();
        assert_eq!(transport.max_open(), 1);
        pool.release(b).await;
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_fails_pool_exhausted_after_timeout() {
        let transport = FakeTransport::new();
        let pool = pool_with(
            &transport,
            PoolConfig {
                max_connections: 1,
                acquire_timeout: Duration::from_secs(1),
                ..PoolConfig::default()
            },
        );

        let _held = pool.acquire(&target("a")).await.unwrap();
        let err = pool.acquire(&target("b")).await.unwrap_err();
        assert!(matches!(err, ExecError::PoolExhausted { max: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_stale_idle_sessions() {
        let transport = FakeTransport::new();
        let pool = pool_with(
            &transport,
            PoolConfig {
                idle_timeout: Duration::from_secs(10),
                sweep_interval: Duration::from_secs(5),
                ..PoolConfig::default()
            },
        );
        let sweeper = pool.spawn_sweeper();

        let a = pool.acquire(&target("a")).await.unwrap();
        pool.release(a).await;
        assert_eq!(pool.idle_count(), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(transport.open_now(), 0);

        pool.close_all().await;
        sweeper.abort();
    }

    #[tokio::test]
    async fn closed_pool_refuses_acquires_and_closes_releases() {
        let transport = FakeTransport::new();
        let pool = pool_with(&transport, PoolConfig::default());

        let a = pool.acquire(&target("a")).await.unwrap();
        pool.close_all().await;

        assert!(matches!(
            pool.acquire(&target("b")).await.unwrap_err(),
            ExecError::PoolClosed
        ));

        pool.release(a).await;
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(transport.open_now(), 0);
    }

    #[tokio::test]
    async fn pooled_session_debug_shows_the_key() {
        let transport = FakeTransport::new();
        let pool = pool_with(&transport, PoolConfig::default());

        let a = pool.acquire(&target("a")).await.unwrap();
        assert!(format!("{a:?}").contains("ops@a.internal:22"));
        pool.release(a).await;
    }

    #[tokio::test]
    async fn connect_failure_frees_the_slot() {
        let transport = FakeTransport::new();
        let pool = pool_with(
            &transport,
            PoolConfig {
                max_connections: 1,
                ..PoolConfig::default()
            },
        );
        transport.fail_connects("a", 1);

        let err = pool.acquire(&target("a")).await.unwrap_err();
        assert!(matches!(err, ExecError::Connection { .. }));

        // The failed open released its slot; the next acquire succeeds.
        let a = pool.acquire(&target("a")).await.unwrap();
        pool.release(a).await;
    }
}
