//! The session pool: a fair waiter queue plus an idle FIFO, guarded by a
//! `parking_lot::Mutex`. Acquirers that arrive while others are already
//! queued are made to wait behind them; a `ManagedSession` RAII guard
//! makes sure every acquired session is either released or discarded
//! exactly once, no matter how the holder's task exits.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::SessionError;
use crate::transport::LedgerTransport;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Pool capacity: the maximum number of sessions open at once, idle or
    /// in use. Bounds the number of concurrently running transactions.
    pub max_concurrent_transactions: u32,
    /// Background replenishment keeps at least this many sessions idle.
    pub min_idle: u32,
    /// The idle FIFO is shrunk back to this size by the health-check task.
    pub max_idle: u32,
    /// Idle sessions older than this are ended by the health-check task.
    pub idle_timeout: Duration,
    /// How long `acquire` waits for a permit before failing with
    /// `NoSessionAvailable`.
    pub session_get_timeout: Duration,
    /// Interval between health-check sweeps.
    pub health_check_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_concurrent_transactions: 400,
            min_idle: 10,
            max_idle: 300,
            idle_timeout: Duration::from_secs(30 * 60),
            session_get_timeout: Duration::from_millis(1),
            health_check_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// A server-issued session token plus local bookkeeping. Single-task-owned
/// at any moment: the pool only ever hands it out wrapped in a
/// [`ManagedSession`].
#[derive(Debug)]
pub struct SessionHandle {
    token: String,
    last_active: Instant,
    valid: bool,
}

impl SessionHandle {
    fn new(token: String) -> Self {
        SessionHandle {
            token,
            last_active: Instant::now(),
            valid: true,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn touch(&mut self) {
        self.last_active = Instant::now();
    }
}

/// What a parked waiter receives once it is woken.
enum Grant {
    /// A healthy, already-open session handed back by another holder.
    Session(SessionHandle),
    /// A bare permit: the pool has capacity but no idle session to give,
    /// so the waiter must create its own.
    CreatePermit,
}

struct Sessions {
    idle: VecDeque<SessionHandle>,
    waiters: VecDeque<oneshot::Sender<Grant>>,
    num_opened: u32,
    num_in_use: u32,
    closed: bool,
}

/// Fair, fixed-capacity pool of sessions against one ledger.
pub struct SessionPool {
    transport: Arc<dyn LedgerTransport>,
    ledger_name: String,
    config: SessionConfig,
    inner: Mutex<Sessions>,
}

impl SessionPool {
    pub fn new(
        transport: Arc<dyn LedgerTransport>,
        ledger_name: impl Into<String>,
        config: SessionConfig,
    ) -> Arc<Self> {
        Arc::new(SessionPool {
            transport,
            ledger_name: ledger_name.into(),
            config,
            inner: Mutex::new(Sessions {
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                num_opened: 0,
                num_in_use: 0,
                closed: false,
            }),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    async fn create_session(&self) -> Result<SessionHandle, SessionError> {
        let resp = self.transport.start_session(&self.ledger_name).await?;
        trace!(session = %resp.session_token, "created session");
        Ok(SessionHandle::new(resp.session_token))
    }

    fn release_permit(&self) {
        let mut inner = self.inner.lock();
        inner.num_opened = inner.num_opened.saturating_sub(1);
        inner.num_in_use = inner.num_in_use.saturating_sub(1);
    }

    /// Waits up to `session_get_timeout` for a permit. Returns an idle
    /// session if one is available, otherwise creates a fresh one (up to
    /// `max_concurrent_transactions`), otherwise queues fairly behind any
    /// already-waiting acquirer.
    pub async fn acquire(self: &Arc<Self>) -> Result<ManagedSession, SessionError> {
        enum Immediate {
            Session(SessionHandle),
            Create,
        }

        let immediate = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(SessionError::DriverClosed);
            }
            if inner.waiters.is_empty() {
                if let Some(handle) = inner.idle.pop_front() {
                    inner.num_in_use += 1;
                    Some(Immediate::Session(handle))
                } else if inner.num_opened < self.config.max_concurrent_transactions {
                    inner.num_opened += 1;
                    inner.num_in_use += 1;
                    Some(Immediate::Create)
                } else {
                    None
                }
            } else {
                None
            }
        };

        match immediate {
            Some(Immediate::Session(handle)) => return Ok(self.wrap(handle)),
            Some(Immediate::Create) => {
                return match self.create_session().await {
                    Ok(handle) => Ok(self.wrap(handle)),
                    Err(e) => {
                        self.release_permit();
                        Err(e)
                    }
                };
            }
            None => {}
        }

        let (tx, rx) = oneshot::channel();
        self.inner.lock().waiters.push_back(tx);

        match tokio::time::timeout(self.config.session_get_timeout, rx).await {
            Ok(Ok(Grant::Session(handle))) => Ok(self.wrap(handle)),
            Ok(Ok(Grant::CreatePermit)) => match self.create_session().await {
                Ok(handle) => Ok(self.wrap(handle)),
                Err(e) => {
                    self.release_permit();
                    Err(e)
                }
            },
            Ok(Err(_canceled)) => Err(SessionError::DriverClosed),
            Err(_elapsed) => Err(SessionError::NoSessionAvailable),
        }
    }

    /// Creates a session outside the idle FIFO entirely. Used by the
    /// execute-loop's mandatory first-attempt retry after a session turns
    /// out to be dead: that retry must not re-queue behind other waiters.
    pub async fn acquire_fresh(self: &Arc<Self>) -> Result<ManagedSession, SessionError> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(SessionError::DriverClosed);
            }
            inner.num_opened += 1;
            inner.num_in_use += 1;
        }
        match self.create_session().await {
            Ok(handle) => Ok(self.wrap(handle)),
            Err(e) => {
                self.release_permit();
                Err(e)
            }
        }
    }

    fn wrap(self: &Arc<Self>, handle: SessionHandle) -> ManagedSession {
        ManagedSession {
            pool: self.clone(),
            handle: Some(handle),
        }
    }

    /// Returns a healthy session to the pool. Wakes the longest-waiting
    /// acquirer, if any, before the session becomes available to a
    /// brand-new `acquire` call.
    fn release(&self, mut handle: SessionHandle) {
        handle.touch();
        let mut inner = self.inner.lock();
        inner.num_in_use = inner.num_in_use.saturating_sub(1);

        if inner.closed {
            drop(inner);
            self.spawn_end_session(handle);
            return;
        }

        while let Some(tx) = inner.waiters.pop_front() {
            inner.num_in_use += 1;
            match tx.send(Grant::Session(handle)) {
                Ok(()) => return,
                Err(Grant::Session(returned)) => {
                    // The waiter's receiver was already dropped (timed out
                    // or cancelled); try the next one.
                    inner.num_in_use -= 1;
                    handle = returned;
                    continue;
                }
                Err(Grant::CreatePermit) => unreachable!("release only ever sends Grant::Session"),
            }
        }
        inner.idle.push_back(handle);
    }

    /// A session believed dead is simply dropped — `end_session` is
    /// deliberately not called — and its permit is released. If a
    /// waiter is parked, it is woken with a bare create-permit grant so
    /// pool capacity does not stall behind the replacement.
    fn discard(&self, token: &str) {
        debug!(session = %token, "discarding dead session");
        let mut inner = self.inner.lock();
        inner.num_opened = inner.num_opened.saturating_sub(1);
        inner.num_in_use = inner.num_in_use.saturating_sub(1);

        while let Some(tx) = inner.waiters.pop_front() {
            inner.num_opened += 1;
            inner.num_in_use += 1;
            match tx.send(Grant::CreatePermit) {
                Ok(()) => return,
                Err(_) => {
                    inner.num_opened -= 1;
                    inner.num_in_use -= 1;
                    continue;
                }
            }
        }
    }

    fn spawn_end_session(self: &Arc<Self>, handle: SessionHandle) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.end_session(&handle.token).await {
                warn!(session = %handle.token, error = %e, "failed to end session");
            }
        });
    }

    /// Drops idle sessions unused past `idle_timeout`, and shrinks the idle
    /// FIFO back to `max_idle` if replenishment overshot it. There is no
    /// ping RPC on `LedgerTransport`, so staleness here is judged purely by
    /// how long a session has sat idle; a session that's actually dead is
    /// still caught on its next use by the execute-loop's mandatory
    /// first-attempt retry.
    pub async fn health_check(&self) {
        let stale = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let mut keep = VecDeque::new();
            let mut stale = Vec::new();
            while let Some(handle) = inner.idle.pop_front() {
                if now.duration_since(handle.last_active) > self.config.idle_timeout
                    || keep.len() as u32 >= self.config.max_idle
                {
                    stale.push(handle);
                } else {
                    keep.push_back(handle);
                }
            }
            inner.num_opened = inner.num_opened.saturating_sub(stale.len() as u32);
            inner.idle = keep;
            stale
        };
        for handle in stale {
            if let Err(e) = self.transport.end_session(&handle.token).await {
                warn!(session = %handle.token, error = %e, "failed to end stale session");
            }
        }
    }

    /// Marks the pool closed, drains the idle FIFO, and ends every idle
    /// session. Further `acquire` calls fail with `DriverClosed`.
    /// Sessions still checked out at the time of `close` are ended as they
    /// are individually released (see `release`).
    pub async fn close(&self) {
        let idle = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            std::mem::take(&mut inner.idle)
        };
        for handle in idle {
            if let Err(e) = self.transport.end_session(&handle.token).await {
                warn!(session = %handle.token, error = %e, "failed to end session during close");
            }
        }
    }

    /// `(num_opened, num_in_use)`, for the background replenishment task
    /// and for tests.
    pub fn stats(&self) -> (u32, u32) {
        let inner = self.inner.lock();
        (inner.num_opened, inner.num_in_use)
    }
}

/// RAII guard around an acquired session. `Drop` releases it back to the
/// pool if still healthy, or discards it if [`ManagedSession::mark_invalid`]
/// was called — satisfying P1 regardless of how the holder's task exits
/// (normal return, early `?`, or panic unwind).
pub struct ManagedSession {
    pool: Arc<SessionPool>,
    handle: Option<SessionHandle>,
}

impl ManagedSession {
    pub fn token(&self) -> &str {
        self.handle
            .as_ref()
            .expect("session handle present for the lifetime of ManagedSession")
            .token()
    }

    /// Marks the session as dead. On drop it will be discarded rather than
    /// returned to the pool.
    pub fn mark_invalid(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            handle.valid = false;
        }
    }

    pub fn is_valid(&self) -> bool {
        self.handle.as_ref().map(|h| h.valid).unwrap_or(false)
    }
}

impl Drop for ManagedSession {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.valid {
                self.pool.release(handle);
            } else {
                let token = handle.token.clone();
                self.pool.discard(&token);
            }
        }
    }
}

/// Owns the session pool's background tasks: periodic idle replenishment
/// and health-check sweeps. Dropping or calling [`SessionManager::close`]
/// cancels both via a shared `CancellationToken`.
pub struct SessionManager {
    pool: Arc<SessionPool>,
    cancel: CancellationToken,
}

impl SessionManager {
    pub fn new(pool: Arc<SessionPool>) -> Self {
        let cancel = CancellationToken::new();
        let manager = SessionManager {
            pool: pool.clone(),
            cancel: cancel.clone(),
        };
        manager.spawn_replenish_task();
        manager.spawn_health_check_task();
        manager
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    fn spawn_replenish_task(&self) {
        let pool = self.pool.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
                let (opened, in_use) = pool.stats();
                let idle = opened.saturating_sub(in_use);
                let config = pool.config();
                if idle < config.min_idle && opened < config.max_concurrent_transactions {
                    match pool.acquire_fresh().await {
                        // Dropping immediately returns the fresh session to
                        // the idle FIFO via `ManagedSession::drop`.
                        Ok(session) => drop(session),
                        Err(e) => warn!(error = %e, "failed to replenish idle session"),
                    }
                }
            }
        });
    }

    fn spawn_health_check_task(&self) {
        let pool = self.pool.clone();
        let cancel = self.cancel.clone();
        let interval = pool.config().health_check_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                pool.health_check().await;
            }
        });
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        CommitResponse, ExecuteStatementResponse, FetchPageResponse, StartSessionResponse,
        StartTransactionResponse, TransportError,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeTransport {
        next_id: AtomicU64,
        ended: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        fn new() -> Self {
            FakeTransport {
                next_id: AtomicU64::new(0),
                ended: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LedgerTransport for FakeTransport {
        async fn start_session(&self, _ledger_name: &str) -> Result<StartSessionResponse, TransportError> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(StartSessionResponse {
                session_token: format!("session-{id}"),
            })
        }

        async fn start_transaction(
            &self,
            _session_token: &str,
        ) -> Result<StartTransactionResponse, TransportError> {
            unimplemented!()
        }

        async fn execute_statement(
            &self,
            _session_token: &str,
            _transaction_id: &str,
            _statement: &str,
            _parameters: &[crate::transport::EncodedValue],
        ) -> Result<ExecuteStatementResponse, TransportError> {
            unimplemented!()
        }

        async fn fetch_page(
            &self,
            _session_token: &str,
            _transaction_id: &str,
            _page_token: &str,
        ) -> Result<FetchPageResponse, TransportError> {
            unimplemented!()
        }

        async fn commit_transaction(
            &self,
            _session_token: &str,
            _transaction_id: &str,
            _commit_digest: [u8; 32],
        ) -> Result<CommitResponse, TransportError> {
            unimplemented!()
        }

        async fn abort_transaction(
            &self,
            _session_token: &str,
            _transaction_id: &str,
        ) -> Result<(), TransportError> {
            unimplemented!()
        }

        async fn end_session(&self, session_token: &str) -> Result<(), TransportError> {
            self.ended.lock().push(session_token.to_string());
            Ok(())
        }
    }

    fn test_pool(max: u32) -> Arc<SessionPool> {
        let transport: Arc<dyn LedgerTransport> = Arc::new(FakeTransport::new());
        SessionPool::new(
            transport,
            "test-ledger",
            SessionConfig {
                max_concurrent_transactions: max,
                min_idle: 0,
                max_idle: 10,
                idle_timeout: Duration::from_secs(3600),
                session_get_timeout: Duration::from_millis(50),
                health_check_interval: Duration::from_secs(3600),
            },
        )
    }

    #[tokio::test]
    async fn acquire_creates_and_release_pools_session() {
        let pool = test_pool(2);
        let token = {
            let session = pool.acquire().await.unwrap();
            session.token().to_string()
        };
        assert_eq!(pool.stats(), (1, 0));

        let again = pool.acquire().await.unwrap();
        assert_eq!(again.token(), token, "idle session should be reused");
    }

    #[tokio::test]
    async fn acquire_times_out_at_capacity() {
        let pool = test_pool(1);
        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, SessionError::NoSessionAvailable));
    }

    #[tokio::test]
    async fn invalid_session_is_discarded_not_ended() {
        let pool = test_pool(1);
        {
            let mut session = pool.acquire().await.unwrap();
            session.mark_invalid();
        }
        assert_eq!(pool.stats(), (0, 0));
        // A fresh acquire must be able to create a brand new session since
        // capacity was correctly released.
        let _session = pool.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn close_drains_idle_sessions() {
        let pool = test_pool(2);
        {
            let _session = pool.acquire().await.unwrap();
        }
        assert_eq!(pool.stats(), (1, 0));
        pool.close().await;
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, SessionError::DriverClosed));
    }
}
