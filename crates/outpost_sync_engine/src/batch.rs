//! Paged push and pull over a [`SyncTransport`].

use crate::config::{LimiterConfig, RetryConfig};
use crate::error::{SyncError, SyncResult};
use crate::limiter::DynamicLimiter;
use crate::transport::SyncTransport;
use outpost_protocol::{ChangeRecord, Cursor, PullRequest, PushRequest};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What a paged transfer did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// Pages sent or received.
    pub pages: usize,
    /// Records sent or received.
    pub records: usize,
    /// Page attempts that failed and were retried.
    pub retries: u32,
    /// Page size after the last adjustment.
    pub final_limit: u32,
}

/// Moves change records in adaptively sized pages.
///
/// Transient transport errors are retried with backoff, re-sending the same
/// page. Cancellation is checked between pages.
#[derive(Debug, Clone)]
pub struct BatchTransferCoordinator {
    limiter: LimiterConfig,
    retry: RetryConfig,
    cancelled: Arc<AtomicBool>,
}

impl BatchTransferCoordinator {
    /// Creates a coordinator with its own cancellation flag.
    pub fn new(limiter: LimiterConfig, retry: RetryConfig) -> Self {
        Self {
            limiter,
            retry,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares a cancellation flag with the caller.
    pub fn with_cancel_flag(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = cancelled;
        self
    }

    /// Requests cancellation at the next page boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs `op` until it succeeds, fails permanently or runs out of
    /// attempts. Returns the result and the duration of the successful
    /// attempt.
    fn with_retry<R>(
        &self,
        what: &'static str,
        report: &mut TransferReport,
        mut op: impl FnMut() -> SyncResult<R>,
    ) -> SyncResult<(R, Duration)> {
        let mut attempt = 0u32;
        loop {
            let started = Instant::now();
            match op() {
                Ok(value) => return Ok((value, started.elapsed())),
                Err(e) if e.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    attempt += 1;
                    report.retries += 1;
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "page transfer failed, retrying"
                    );
                    std::thread::sleep(delay);
                    self.check_cancelled()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sends every pending change exactly once, in order.
    ///
    /// The transport is called at least once, with an empty page if there is
    /// nothing to send.
    pub fn push_all<T: SyncTransport + ?Sized>(
        &self,
        transport: &T,
        session_id: &str,
        pending: &[ChangeRecord],
    ) -> SyncResult<TransferReport> {
        let mut limiter = DynamicLimiter::new(self.limiter.clone());
        let mut report = TransferReport::default();
        let mut offset = 0usize;

        loop {
            self.check_cancelled()?;
            let limit = limiter.current_limit() as usize;
            let end = pending.len().min(offset + limit);
            let request = PushRequest {
                session_id: session_id.to_string(),
                changes: pending[offset..end].to_vec(),
            };

            let (ack, elapsed) = self.with_retry("push", &mut report, || transport.push(&request))?;
            if ack.accepted as usize != request.changes.len() {
                return Err(SyncError::Protocol(format!(
                    "central accepted {} of {} pushed changes",
                    ack.accepted,
                    request.changes.len()
                )));
            }

            report.pages += 1;
            report.records += request.changes.len();
            debug!(
                session_id,
                page = report.pages,
                records = request.changes.len(),
                limit,
                elapsed_ms = elapsed.as_millis() as u64,
                "pushed page"
            );

            offset = end;
            if offset >= pending.len() {
                break;
            }
            limiter.next_limit(elapsed);
        }

        report.final_limit = limiter.current_limit();
        Ok(report)
    }

    /// Fetches pages starting after `since` until a short page arrives,
    /// handing each page to `on_page`.
    ///
    /// Returns the report and the cursor after the last received record.
    pub fn pull_all<T: SyncTransport + ?Sized>(
        &self,
        transport: &T,
        session_id: &str,
        since: Cursor,
        mut on_page: impl FnMut(Vec<ChangeRecord>) -> SyncResult<()>,
    ) -> SyncResult<(TransferReport, Cursor)> {
        let mut limiter = DynamicLimiter::new(self.limiter.clone());
        let mut report = TransferReport::default();
        let mut cursor = since;

        loop {
            self.check_cancelled()?;
            let limit = limiter.current_limit();
            let request = PullRequest {
                session_id: session_id.to_string(),
                since: cursor.clone(),
                limit,
            };

            let (page, elapsed) = self.with_retry("pull", &mut report, || transport.pull(&request))?;
            if page.records.len() > limit as usize {
                return Err(SyncError::Protocol(format!(
                    "asked for {limit} records, received {}",
                    page.records.len()
                )));
            }
            let last = page.is_last(limit);
            if !last && page.cursor == cursor {
                return Err(SyncError::Protocol("pull cursor did not advance".into()));
            }

            report.pages += 1;
            report.records += page.records.len();
            debug!(
                session_id,
                page = report.pages,
                records = page.records.len(),
                limit,
                elapsed_ms = elapsed.as_millis() as u64,
                "pulled page"
            );

            cursor = page.cursor;
            on_page(page.records)?;
            if last {
                break;
            }
            limiter.next_limit(elapsed);
        }

        report.final_limit = limiter.current_limit();
        Ok((report, cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use outpost_protocol::{Direction, RecordData, SyncTick};
    use proptest::prelude::*;

    fn changes(n: usize) -> Vec<ChangeRecord> {
        (0..n)
            .map(|i| {
                ChangeRecord::new(
                    Direction::Outgoing,
                    "patients",
                    format!("p{i:05}"),
                    RecordData::new(),
                    SyncTick::new(i as i64 / 3 + 1),
                )
            })
            .collect()
    }

    fn coordinator(initial: u32, max: u32) -> BatchTransferCoordinator {
        BatchTransferCoordinator::new(LimiterConfig::new(initial, 1, max), RetryConfig::no_retry())
    }

    #[test]
    fn empty_push_still_calls_transport() {
        let transport = MockTransport::new();
        let report = coordinator(100, 1000).push_all(&transport, "s", &[]).unwrap();
        assert_eq!(report.pages, 1);
        assert_eq!(transport.pushed_pages(), vec![Vec::<ChangeRecord>::new()]);
    }

    #[test]
    fn push_250_with_limit_100() {
        let transport = MockTransport::new();
        let pending = changes(250);
        let report = coordinator(100, 1000).push_all(&transport, "s", &pending).unwrap();

        let pages = transport.pushed_pages();
        assert!(pages.len() >= 3, "{} pages", pages.len());
        assert_eq!(pages[0].len(), 100);
        assert_eq!(report.records, 250);
        assert_eq!(pages.concat(), pending);
    }

    #[test]
    fn transient_failures_resend_the_same_page() {
        let transport = MockTransport::new();
        transport.fail_next(2);
        let retry = RetryConfig::new(3).with_initial_delay(Duration::from_millis(1));
        let coordinator = BatchTransferCoordinator::new(LimiterConfig::new(10, 1, 10), retry);

        let pending = changes(25);
        let report = coordinator.push_all(&transport, "s", &pending).unwrap();
        assert_eq!(report.retries, 2);
        assert_eq!(transport.pushed_pages().concat(), pending);
    }

    #[test]
    fn retries_give_up() {
        let transport = MockTransport::new();
        transport.fail_next(5);
        let retry = RetryConfig::new(2).with_initial_delay(Duration::from_millis(1));
        let coordinator = BatchTransferCoordinator::new(LimiterConfig::new(10, 1, 10), retry);
        let err = coordinator.push_all(&transport, "s", &changes(3)).unwrap_err();
        assert!(err.is_retryable());
        assert!(transport.pushed_pages().is_empty());
    }

    #[test]
    fn cancelled_before_first_page() {
        let transport = MockTransport::new();
        let coordinator = coordinator(10, 10);
        coordinator.cancel();
        assert!(matches!(
            coordinator.push_all(&transport, "s", &changes(3)),
            Err(SyncError::Cancelled)
        ));
    }

    #[test]
    fn slow_pages_shrink_the_limit() {
        let transport = MockTransport::new();
        transport.set_delay_per_record(Duration::from_millis(1));
        let limiter = LimiterConfig::new(20, 5, 100)
            .with_optimal_time_per_page(Duration::from_millis(5));
        let coordinator = BatchTransferCoordinator::new(limiter, RetryConfig::no_retry());

        let report = coordinator.push_all(&transport, "s", &changes(60)).unwrap();
        let sizes: Vec<_> = transport.pushed_pages().iter().map(Vec::len).collect();
        assert_eq!(sizes[0], 20);
        assert!(sizes[1] < 20, "{sizes:?}");
        assert!(report.final_limit < 20);
    }

    #[test]
    fn pull_stops_on_short_page() {
        let transport = MockTransport::new();
        let source: Vec<_> = changes(25)
            .into_iter()
            .map(|c| c.with_direction(Direction::Incoming))
            .collect();
        transport.set_pull_source(source.clone(), SyncTick::new(9));

        let mut received = Vec::new();
        let (report, cursor) = coordinator(10, 10)
            .pull_all(&transport, "s", Cursor::default(), |page| {
                received.extend(page);
                Ok(())
            })
            .unwrap();

        assert_eq!(received, source);
        assert_eq!(report.pages, 3);
        assert_eq!(cursor, Cursor::after_record(&source[24]));
    }

    #[test]
    fn pull_of_exact_multiple_ends_with_empty_page() {
        let transport = MockTransport::new();
        transport.set_pull_source(changes(20), SyncTick::new(9));
        let (report, _) = coordinator(10, 10)
            .pull_all(&transport, "s", Cursor::default(), |_| Ok(()))
            .unwrap();
        assert_eq!(report.pages, 3);
        assert_eq!(report.records, 20);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn every_pending_change_is_sent_once(
            n in 0usize..600,
            initial in 1u32..200,
            extra in 0u32..500,
            change in 0.05f64..1.0,
        ) {
            let transport = MockTransport::new();
            let pending = changes(n);
            let limiter = LimiterConfig::new(initial, 1, initial + extra)
                .with_max_change_per_page(change);
            let coordinator = BatchTransferCoordinator::new(limiter, RetryConfig::no_retry());

            coordinator.push_all(&transport, "s", &pending).unwrap();

            let pages = transport.pushed_pages();
            prop_assert!(!pages.is_empty());
            if n > initial as usize {
                prop_assert!(pages.len() >= 2);
            }
            prop_assert_eq!(pages.concat(), pending);
        }
    }
}
