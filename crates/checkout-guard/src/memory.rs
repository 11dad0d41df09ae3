//! In-process store used by tests and by the race harness when no database is configured
//!
//! Named locks belong to the session that took them and are freed when that
//! session is dropped, like a server releasing a disconnected client's locks.
//! Reads can be routed to a simulated replica that only sees commits older
//! than a fixed lag.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{GuardError, GuardResult};
use crate::fingerprint::{Fingerprint, LockName};
use crate::store::{wait_deadline, window_cutoff, LockStore, NewOrder, OrderRef, StoreSession};

/// Where `find_recent` reads come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadRouting {
    /// Reads run on the session holding the lock and see every commit
    #[default]
    SameSession,
    /// Reads go to a replica that trails the primary by `lag`
    Replica { lag: Duration },
}

struct StoredOrder {
    order: OrderRef,
    fingerprint: Fingerprint,
    /// When the write becomes visible to replica reads
    replicated_at: Instant,
}

#[derive(Default)]
struct MemoryState {
    /// Lock name -> owning session id
    locks: HashMap<LockName, u64>,
    orders: Vec<StoredOrder>,
    next_order_id: u64,
}

struct Inner {
    state: Mutex<MemoryState>,
    released: Notify,
    routing: ReadRouting,
    unavailable: AtomicBool,
    next_session_id: AtomicU64,
}

/// Shared in-memory store; clones share state
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_read_routing(ReadRouting::SameSession)
    }

    pub fn with_read_routing(routing: ReadRouting) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(MemoryState::default()),
                released: Notify::new(),
                routing,
                unavailable: AtomicBool::new(false),
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    /// Make every following operation fail as if the server were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Insert an order that was committed (and replicated) at `created_at`
    pub fn seed_order(&self, order: NewOrder, created_at: DateTime<Utc>) -> OrderRef {
        let mut state = self.inner.state.lock();
        state.next_order_id += 1;
        let order_ref = OrderRef {
            id: state.next_order_id,
            status: order.status,
            created_at,
        };
        state.orders.push(StoredOrder {
            order: order_ref.clone(),
            fingerprint: order.fingerprint,
            replicated_at: Instant::now(),
        });
        order_ref
    }

    /// Orders stored for a fingerprint, as seen by the primary
    pub fn order_count(&self, fingerprint: &Fingerprint) -> usize {
        self.inner
            .state
            .lock()
            .orders
            .iter()
            .filter(|stored| &stored.fingerprint == fingerprint)
            .count()
    }

    pub fn is_locked(&self, name: &LockName) -> bool {
        self.inner.state.lock().locks.contains_key(name)
    }

    pub fn lock_count(&self) -> usize {
        self.inner.state.lock().locks.len()
    }

    fn check_available(&self) -> GuardResult<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            Err(GuardError::store_unavailable("memory store marked unavailable"))
        } else {
            Ok(())
        }
    }

    fn release_session_locks(&self, session_id: u64) -> usize {
        let released = {
            let mut state = self.inner.state.lock();
            let before = state.locks.len();
            state.locks.retain(|_, owner| *owner != session_id);
            before - state.locks.len()
        };
        if released > 0 {
            self.inner.released.notify_waiters();
        }
        released
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    type Session = MemorySession;

    async fn open_session(&self) -> GuardResult<MemorySession> {
        self.check_available()?;
        let id = self.inner.next_session_id.fetch_add(1, Ordering::SeqCst);
        trace!("Opened memory session {}", id);
        Ok(MemorySession {
            store: self.clone(),
            id,
        })
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Session on a [`MemoryStore`]; dropping it frees its locks
pub struct MemorySession {
    store: MemoryStore,
    id: u64,
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn try_lock(&mut self, name: &LockName, max_wait: Duration) -> GuardResult<bool> {
        let deadline = wait_deadline(max_wait)?;

        loop {
            self.store.check_available()?;
            // Registered before inspecting the map so a release in between is not missed
            let released = self.store.inner.released.notified();
            {
                let mut state = self.store.inner.state.lock();
                match state.locks.get(name) {
                    None => {
                        state.locks.insert(name.clone(), self.id);
                        return Ok(true);
                    }
                    Some(owner) if *owner == self.id => return Ok(true),
                    Some(_) => {}
                }
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Ok(false);
            }
        }
    }

    async fn unlock(&mut self, name: &LockName) -> GuardResult<()> {
        self.store.check_available()?;
        let removed = {
            let mut state = self.store.inner.state.lock();
            if state.locks.get(name) == Some(&self.id) {
                state.locks.remove(name);
                true
            } else {
                false
            }
        };
        if removed {
            self.store.inner.released.notify_waiters();
        }
        Ok(())
    }

    async fn find_recent(
        &mut self,
        fingerprint: &Fingerprint,
        window: Duration,
    ) -> GuardResult<Option<OrderRef>> {
        self.store.check_available()?;
        let cutoff = window_cutoff(window)?;
        let now = Instant::now();
        let routing = self.store.inner.routing;

        let state = self.store.inner.state.lock();
        Ok(state
            .orders
            .iter()
            .filter(|stored| &stored.fingerprint == fingerprint)
            .filter(|stored| stored.order.status.counts_as_duplicate())
            .filter(|stored| stored.order.created_at > cutoff)
            .filter(|stored| match routing {
                ReadRouting::SameSession => true,
                ReadRouting::Replica { .. } => stored.replicated_at <= now,
            })
            .max_by_key(|stored| (stored.order.created_at, stored.order.id))
            .map(|stored| stored.order.clone()))
    }

    async fn record_order(&mut self, order: NewOrder) -> GuardResult<OrderRef> {
        self.store.check_available()?;
        let lag = match self.store.inner.routing {
            ReadRouting::SameSession => Duration::ZERO,
            ReadRouting::Replica { lag } => lag,
        };

        let mut state = self.store.inner.state.lock();
        state.next_order_id += 1;
        let order_ref = OrderRef {
            id: state.next_order_id,
            status: order.status,
            created_at: Utc::now(),
        };
        state.orders.push(StoredOrder {
            order: order_ref.clone(),
            fingerprint: order.fingerprint,
            replicated_at: Instant::now() + lag,
        });
        debug!("Memory session {} recorded order {}", self.id, order_ref.id);
        Ok(order_ref)
    }

    async fn count_orders(&mut self, fingerprint: &Fingerprint) -> GuardResult<u64> {
        self.store.check_available()?;
        Ok(self.store.order_count(fingerprint) as u64)
    }

    async fn close(self) -> GuardResult<()> {
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let released = self.store.release_session_locks(self.id);
        if released > 0 {
            debug!("Memory session {} torn down, freed {} lock(s)", self.id, released);
        }
    }
}
