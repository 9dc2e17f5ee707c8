//! Result iteration and paging: a lazy cursor over one or more server
//! pages, with an optional bounded-buffer prefetcher that overlaps page
//! fetches with consumer iteration.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::codec::{Value, ValueCodec};
use crate::error::DriverError;
use crate::transport::{LedgerTransport, Page, Stats};

/// How often the read-ahead worker re-checks whether the consumer has
/// closed the result while its send is blocked on a full queue.
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ResultError {
    #[error("result was already iterated")]
    AlreadyIterated,
    #[error("iteration exhausted")]
    IterationExhausted,
    #[error("result's owning transaction is no longer active")]
    ResultParentInactive,
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Monotonic IO/timing accumulator for one `Result`, summed across every
/// page fetched on its behalf — not a snapshot of the most recent page.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultStats {
    consumed_ios: u64,
    processing_time: Duration,
}

impl ResultStats {
    fn absorb(&mut self, stats: &Stats) {
        self.consumed_ios += stats.io_count;
        self.processing_time += stats.processing;
    }

    pub fn consumed_ios(&self) -> u64 {
        self.consumed_ios
    }

    pub fn processing_time(&self) -> Duration {
        self.processing_time
    }
}

/// Fetches pages one at a time from the transport. Holds just enough
/// identity (session token, transaction id) to make an independent
/// `fetch_page` call; it never needs mutable access to the `Transaction`
/// itself.
#[derive(Clone)]
struct PageSource {
    transport: Arc<dyn LedgerTransport>,
    session_token: String,
    transaction_id: String,
}

impl PageSource {
    async fn fetch(&self, page_token: &str) -> Result<(Page, Option<Stats>), DriverError> {
        let resp = self
            .transport
            .fetch_page(&self.session_token, &self.transaction_id, page_token)
            .await?;
        Ok((resp.page, resp.stats))
    }
}

enum WorkerMsg {
    Page(Page, Option<Stats>),
    Err(DriverError),
}

/// The bounded hand-off between the read-ahead worker and the consumer.
/// Capacity `N` bounds how many pages may sit buffered at once (the
/// `pending pages ≤ N` property). A fetch error bypasses that bound
/// entirely: it clears whatever pages are already queued and is pushed to
/// the front, so the consumer's next `recv` observes the error rather
/// than draining stale pages ahead of it.
struct ReadAheadQueue {
    queue: Mutex<VecDeque<WorkerMsg>>,
    /// Signalled by the producer after pushing; the consumer waits on it.
    item_ready: Notify,
    /// Signalled by the consumer after popping; the producer waits on it
    /// when the queue is at capacity.
    space_ready: Notify,
    done: AtomicBool,
    capacity: usize,
}

impl ReadAheadQueue {
    fn new(capacity: usize) -> Self {
        ReadAheadQueue {
            queue: Mutex::new(VecDeque::new()),
            item_ready: Notify::new(),
            space_ready: Notify::new(),
            done: AtomicBool::new(false),
            capacity,
        }
    }

    /// Waits for a free slot (polling `cancel` every [`WORKER_POLL_INTERVAL`]
    /// while blocked, per §4.4) and pushes one fetched page. Returns `false`
    /// if `cancel` fired before a slot opened up.
    async fn push_page(&self, page: Page, stats: Option<Stats>, cancel: &CancellationToken) -> bool {
        loop {
            {
                let mut queue = self.queue.lock();
                if queue.len() < self.capacity {
                    queue.push_back(WorkerMsg::Page(page, stats));
                    drop(queue);
                    self.item_ready.notify_one();
                    return true;
                }
            }
            if cancel.is_cancelled() {
                return false;
            }
            tokio::select! {
                _ = self.space_ready.notified() => {}
                _ = tokio::time::sleep(WORKER_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return false,
            }
        }
    }

    /// Clears any pages already buffered and enqueues `err` at the head,
    /// then marks the queue done — the worker always exits right after
    /// calling this, so no further pages can follow the error.
    fn push_error(&self, err: DriverError) {
        let mut queue = self.queue.lock();
        queue.clear();
        queue.push_front(WorkerMsg::Err(err));
        drop(queue);
        self.done.store(true, Ordering::Release);
        self.item_ready.notify_one();
    }

    fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
        self.item_ready.notify_one();
    }

    /// Dequeues the next message, waiting for the producer if the queue is
    /// momentarily empty; returns `None` once the producer is done and the
    /// queue has been fully drained.
    async fn recv(&self) -> Option<WorkerMsg> {
        loop {
            {
                let mut queue = self.queue.lock();
                if let Some(msg) = queue.pop_front() {
                    drop(queue);
                    self.space_ready.notify_one();
                    return Some(msg);
                }
                if self.done.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.item_ready.notified().await;
        }
    }
}

/// Runs on a dedicated `tokio` task while a streaming result has
/// `read_ahead >= 2`. Fetches pages ahead of consumption into a
/// [`ReadAheadQueue`] so the caller's processing overlaps the next server
/// round-trip.
struct ReadAheadWorker {
    queue: Arc<ReadAheadQueue>,
    cancel: CancellationToken,
}

impl ReadAheadWorker {
    fn spawn(source: PageSource, first_next_token: Option<String>, depth: usize) -> Self {
        let queue = Arc::new(ReadAheadQueue::new(depth));
        let cancel = CancellationToken::new();
        let worker_queue = queue.clone();
        let worker_cancel = cancel.clone();

        tokio::spawn(async move {
            let mut next_token = first_next_token;
            loop {
                let Some(token) = next_token.take() else {
                    worker_queue.mark_done();
                    return;
                };
                if worker_cancel.is_cancelled() {
                    return;
                }
                match source.fetch(&token).await {
                    Ok((page, stats)) => {
                        trace!(page_token = %token, values = page.values.len(), "read-ahead fetched page");
                        next_token = page.next_page_token.clone();
                        if !worker_queue.push_page(page, stats, &worker_cancel).await {
                            // Consumer closed the result while we were
                            // waiting for a free slot.
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "read-ahead worker hit a fetch error, surfacing to consumer");
                        worker_queue.push_error(e);
                        return;
                    }
                }
            }
        });

        ReadAheadWorker { queue, cancel }
    }

    async fn recv(&self) -> Option<WorkerMsg> {
        self.queue.recv().await
    }
}

impl Drop for ReadAheadWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Source {
    Sync {
        fetcher: PageSource,
        next_page_token: Option<String>,
    },
    ReadAhead(ReadAheadWorker),
}

/// Streaming cursor over a (possibly multi-page) result. May be iterated
/// exactly once; [`StreamingResult::buffer`] materializes the remainder
/// into a `Vec` for repeat iteration.
pub struct StreamingResult {
    codec: Arc<dyn ValueCodec>,
    current: VecDeque<Value>,
    exhausted: bool,
    source: Source,
    iterated: AtomicBool,
    stats: ResultStats,
    parent_closed: Arc<AtomicBool>,
}

impl StreamingResult {
    pub(crate) fn new(
        transport: Arc<dyn LedgerTransport>,
        session_token: String,
        transaction_id: String,
        codec: Arc<dyn ValueCodec>,
        first_page: Page,
        first_stats: Option<Stats>,
        read_ahead: usize,
        parent_closed: Arc<AtomicBool>,
    ) -> Result<Self, DriverError> {
        let current = Self::decode_page(&codec, &first_page.values)?;
        let mut stats = ResultStats::default();
        if let Some(s) = &first_stats {
            stats.absorb(s);
        }

        let fetcher = PageSource {
            transport,
            session_token,
            transaction_id,
        };

        let source = if read_ahead >= 2 && first_page.next_page_token.is_some() {
            Source::ReadAhead(ReadAheadWorker::spawn(
                fetcher,
                first_page.next_page_token,
                read_ahead,
            ))
        } else {
            Source::Sync {
                fetcher,
                next_page_token: first_page.next_page_token,
            }
        };

        Ok(StreamingResult {
            codec,
            current,
            exhausted: false,
            source,
            iterated: AtomicBool::new(false),
            stats,
            parent_closed,
        })
    }

    fn decode_page(codec: &Arc<dyn ValueCodec>, values: &[crate::transport::EncodedValue]) -> Result<VecDeque<Value>, DriverError> {
        values
            .iter()
            .map(|v| codec.decode(v).map_err(DriverError::from))
            .collect()
    }

    fn check_active(&self) -> Result<(), ResultError> {
        if self.parent_closed.load(Ordering::Acquire) {
            return Err(ResultError::ResultParentInactive);
        }
        Ok(())
    }

    /// Takes ownership of the iteration cursor. Fails with `AlreadyIterated`
    /// if called a second time.
    pub fn into_iterator(self) -> Result<ResultIterator, ResultError> {
        if self.iterated.swap(true, Ordering::SeqCst) {
            return Err(ResultError::AlreadyIterated);
        }
        Ok(ResultIterator { inner: self })
    }

    /// Drains the remainder of the result into a `Vec`, consuming it. Used
    /// both by callers who want a buffered snapshot up front and implicitly
    /// by the execute-loop when a closure returns a streaming result
    /// directly.
    pub async fn buffer(mut self) -> Result<Vec<Value>, ResultError> {
        let mut out = Vec::new();
        loop {
            match self.next().await {
                Ok(Some(v)) => out.push(v),
                Ok(None) => return Ok(out),
                Err(ResultError::IterationExhausted) => return Ok(out),
                Err(e) => return Err(e),
            }
        }
    }

    pub fn stats(&self) -> ResultStats {
        self.stats
    }

    async fn next(&mut self) -> Result<Option<Value>, ResultError> {
        self.check_active()?;
        if let Some(value) = self.current.pop_front() {
            return Ok(Some(value));
        }
        if self.exhausted {
            return Ok(None);
        }

        match &mut self.source {
            Source::Sync {
                fetcher,
                next_page_token,
            } => {
                let Some(token) = next_page_token.clone() else {
                    self.exhausted = true;
                    return Ok(None);
                };
                let (page, stats) = fetcher.fetch(&token).await?;
                if let Some(s) = &stats {
                    self.stats.absorb(s);
                }
                *next_page_token = page.next_page_token.clone();
                self.current = Self::decode_page(&self.codec, &page.values)?;
                if self.current.is_empty() && next_page_token.is_none() {
                    self.exhausted = true;
                    return Ok(None);
                }
                Ok(self.current.pop_front())
            }
            Source::ReadAhead(worker) => match worker.recv().await {
                Some(WorkerMsg::Page(page, stats)) => {
                    if let Some(s) = &stats {
                        self.stats.absorb(s);
                    }
                    let had_next_token = page.next_page_token.is_some();
                    self.current = Self::decode_page(&self.codec, &page.values)?;
                    if self.current.is_empty() && !had_next_token {
                        self.exhausted = true;
                        return Ok(None);
                    }
                    Ok(self.current.pop_front())
                }
                Some(WorkerMsg::Err(e)) => {
                    self.exhausted = true;
                    Err(ResultError::Driver(e))
                }
                None => {
                    self.exhausted = true;
                    Ok(None)
                }
            },
        }
    }
}

/// The iterator handed out by [`StreamingResult::into_iterator`]. `next`
/// fails with `IterationExhausted` when called past the end.
pub struct ResultIterator {
    inner: StreamingResult,
}

impl ResultIterator {
    pub async fn next(&mut self) -> Result<Value, ResultError> {
        match self.inner.next().await? {
            Some(v) => Ok(v),
            None => Err(ResultError::IterationExhausted),
        }
    }

    pub fn has_next(&self) -> bool {
        !self.inner.current.is_empty() || !self.inner.exhausted
    }

    pub fn stats(&self) -> ResultStats {
        self.inner.stats()
    }
}

/// The two-variant sum type a statement execution yields: either a fully
/// materialized snapshot, or a lazy cursor still attached to its
/// transaction.
pub enum LedgerResult {
    Buffered(Vec<Value>),
    Streaming(StreamingResult),
}

impl LedgerResult {
    pub fn is_empty(&self) -> bool {
        match self {
            LedgerResult::Buffered(values) => values.is_empty(),
            LedgerResult::Streaming(s) => s.current.is_empty() && s.exhausted,
        }
    }

    /// Materializes a streaming result in place; a no-op for an
    /// already-buffered one. Buffering then iterating yields the same
    /// sequence as iterating the original.
    pub async fn buffer(self) -> Result<Vec<Value>, ResultError> {
        match self {
            LedgerResult::Buffered(values) => Ok(values),
            LedgerResult::Streaming(s) => s.buffer().await,
        }
    }

    pub fn get_consumed_ios(&self) -> u64 {
        match self {
            LedgerResult::Buffered(_) => 0,
            LedgerResult::Streaming(s) => s.stats().consumed_ios(),
        }
    }

    pub fn get_timing_information(&self) -> Duration {
        match self {
            LedgerResult::Buffered(_) => Duration::ZERO,
            LedgerResult::Streaming(s) => s.stats().processing_time(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        CommitResponse, EncodedValue, ExecuteStatementResponse, FetchPageResponse, StartSessionResponse,
        StartTransactionResponse, TransportError,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct PagedTransport {
        pages: Mutex<VecDeque<Page>>,
    }

    fn val(i: i64) -> EncodedValue {
        let codec = crate::codec::DefaultValueCodec;
        codec.encode(&Value::Int(i)).unwrap()
    }

    #[async_trait]
    impl LedgerTransport for PagedTransport {
        async fn start_session(&self, _ledger_name: &str) -> Result<StartSessionResponse, TransportError> {
            unimplemented!()
        }
        async fn start_transaction(&self, _session_token: &str) -> Result<StartTransactionResponse, TransportError> {
            unimplemented!()
        }
        async fn execute_statement(
            &self,
            _session_token: &str,
            _transaction_id: &str,
            _statement: &str,
            _parameters: &[EncodedValue],
        ) -> Result<ExecuteStatementResponse, TransportError> {
            unimplemented!()
        }
        async fn fetch_page(
            &self,
            _session_token: &str,
            _transaction_id: &str,
            _page_token: &str,
        ) -> Result<FetchPageResponse, TransportError> {
            let page = self.pages.lock().unwrap().pop_front().unwrap();
            Ok(FetchPageResponse { page, stats: None })
        }
        async fn commit_transaction(
            &self,
            _session_token: &str,
            _transaction_id: &str,
            _commit_digest: [u8; 32],
        ) -> Result<CommitResponse, TransportError> {
            unimplemented!()
        }
        async fn abort_transaction(&self, _session_token: &str, _transaction_id: &str) -> Result<(), TransportError> {
            unimplemented!()
        }
        async fn end_session(&self, _session_token: &str) -> Result<(), TransportError> {
            unimplemented!()
        }
    }

    fn three_page_transport() -> Arc<dyn LedgerTransport> {
        Arc::new(PagedTransport {
            pages: Mutex::new(VecDeque::from(vec![
                Page {
                    values: vec![val(3), val(4)],
                    next_page_token: Some("p3".into()),
                },
                Page {
                    values: vec![val(5)],
                    next_page_token: None,
                },
            ])),
        })
    }

    #[tokio::test]
    async fn sync_pagination_yields_values_in_order() {
        let transport = three_page_transport();
        let first_page = Page {
            values: vec![val(1), val(2)],
            next_page_token: Some("p2".into()),
        };
        let result = StreamingResult::new(
            transport,
            "sess".into(),
            "txn".into(),
            Arc::new(crate::codec::DefaultValueCodec),
            first_page,
            None,
            0,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        let values = result.buffer().await.unwrap();
        assert_eq!(
            values,
            vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4), Value::Int(5)]
        );
    }

    #[tokio::test]
    async fn read_ahead_yields_same_order_as_sync() {
        let transport = three_page_transport();
        let first_page = Page {
            values: vec![val(1), val(2)],
            next_page_token: Some("p2".into()),
        };
        let result = StreamingResult::new(
            transport,
            "sess".into(),
            "txn".into(),
            Arc::new(crate::codec::DefaultValueCodec),
            first_page,
            None,
            2,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        let values = result.buffer().await.unwrap();
        assert_eq!(
            values,
            vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4), Value::Int(5)]
        );
    }

    #[tokio::test]
    async fn second_iterator_attempt_fails() {
        let transport = three_page_transport();
        let first_page = Page {
            values: vec![val(1)],
            next_page_token: None,
        };
        let result = StreamingResult::new(
            transport,
            "sess".into(),
            "txn".into(),
            Arc::new(crate::codec::DefaultValueCodec),
            first_page,
            None,
            0,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        // Can't call into_iterator twice on the same value, so prove the
        // guard flips by calling it once and inspecting the flag directly.
        assert!(!result.iterated.load(Ordering::SeqCst));
        let _iter = result.into_iterator().unwrap();
    }

    #[tokio::test]
    async fn closed_parent_invalidates_iteration() {
        let transport = three_page_transport();
        let first_page = Page {
            values: vec![val(1)],
            next_page_token: Some("p2".into()),
        };
        let parent_closed = Arc::new(AtomicBool::new(false));
        let result = StreamingResult::new(
            transport,
            "sess".into(),
            "txn".into(),
            Arc::new(crate::codec::DefaultValueCodec),
            first_page,
            None,
            0,
            parent_closed.clone(),
        )
        .unwrap();
        let mut iter = result.into_iterator().unwrap();
        parent_closed.store(true, Ordering::Release);
        let err = iter.next().await.unwrap_err();
        assert!(matches!(err, ResultError::ResultParentInactive));
    }

    #[tokio::test]
    async fn queue_error_clears_pending_pages_and_is_observed_first() {
        let queue = ReadAheadQueue::new(4);
        let cancel = CancellationToken::new();

        // Two pages sit buffered, unconsumed.
        assert!(
            queue
                .push_page(
                    Page {
                        values: vec![val(1)],
                        next_page_token: Some("p2".into())
                    },
                    None,
                    &cancel
                )
                .await
        );
        assert!(
            queue
                .push_page(
                    Page {
                        values: vec![val(2)],
                        next_page_token: Some("p3".into())
                    },
                    None,
                    &cancel
                )
                .await
        );

        queue.push_error(DriverError::new(crate::error::DriverErrorKind::TransientTransport, "boom"));

        match queue.recv().await {
            Some(WorkerMsg::Err(e)) => assert_eq!(e.kind, crate::error::DriverErrorKind::TransientTransport),
            _ => panic!("expected the error to be observed before either buffered page"),
        }
        assert!(
            queue.recv().await.is_none(),
            "queue must be drained and marked done once the error has been delivered"
        );
    }
}
