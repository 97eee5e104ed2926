//! Summary cycle scheduler.
//!
//! One task owns the timing: it waits for the regular tick, an out-of-band
//! trigger or cancellation, and runs cycles strictly one after another:
//! drain the buffer, summarize, format, broadcast.

use std::{
    collections::BTreeSet,
    fmt,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    broadcast::Broadcaster,
    buffer::MessageBuffer,
    config::Config,
    domain::{SubscriberId, Summary},
    formatting::{format_summary_html, SummaryFormat},
    summarizer::{SummarizerAdapter, SummaryOutcome},
    Error, Result,
};

const TRIGGER_QUEUE_SIZE: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleTrigger {
    Scheduled,
    Manual,
    Startup,
}

impl fmt::Display for CycleTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CycleTrigger::Scheduled => "scheduled",
            CycleTrigger::Manual => "manual",
            CycleTrigger::Startup => "startup",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing arrived since the previous drain.
    Skipped,
    Delivered,
    SummarizationFailed(String),
}

#[derive(Clone, Debug)]
pub struct CycleResult {
    pub trigger: CycleTrigger,
    pub outcome: CycleOutcome,
    pub summary: Option<Summary>,
    pub batch_size: usize,
    pub delivered_count: usize,
    pub failed_ids: BTreeSet<SubscriberId>,
    pub deactivated_ids: BTreeSet<SubscriberId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CycleResult {
    fn new(trigger: CycleTrigger, outcome: CycleOutcome, started_at: DateTime<Utc>) -> Self {
        Self {
            trigger,
            outcome,
            summary: None,
            batch_size: 0,
            delivered_count: 0,
            failed_ids: BTreeSet::new(),
            deactivated_ids: BTreeSet::new(),
            started_at,
            finished_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerPhase {
    Idle,
    Waiting { next_tick: DateTime<Utc> },
    Running { trigger: CycleTrigger },
    Stopped,
}

#[derive(Clone, Debug)]
pub struct SchedulerStatus {
    pub phase: SchedulerPhase,
    pub interval: Duration,
    /// Regular deadline; kept while a manual cycle runs.
    pub next_tick: Option<DateTime<Utc>>,
    pub last_cycle: Option<CycleResult>,
}

struct TriggerRequest {
    trigger: CycleTrigger,
    reply: oneshot::Sender<CycleResult>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    buffer: Arc<MessageBuffer>,
    summarizer: Arc<SummarizerAdapter>,
    broadcaster: Arc<Broadcaster>,
    format: SummaryFormat,
    interval: Duration,
    trigger_tx: mpsc::Sender<TriggerRequest>,
    trigger_rx: StdMutex<Option<mpsc::Receiver<TriggerRequest>>>,
    state: tokio::sync::Mutex<SchedulerState>,
}

struct SchedulerState {
    phase: SchedulerPhase,
    next_tick: Option<DateTime<Utc>>,
    last_cycle: Option<CycleResult>,
}

impl Scheduler {
    pub fn new(
        cfg: &Config,
        buffer: Arc<MessageBuffer>,
        summarizer: Arc<SummarizerAdapter>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        let format = SummaryFormat {
            max_key_points: cfg.max_key_points,
            offset: cfg.display_offset,
            max_len: broadcaster.messenger().capabilities().max_message_len,
        };
        Self::with_parts(
            buffer,
            summarizer,
            broadcaster,
            format,
            cfg.effective_interval(),
        )
    }

    pub fn with_parts(
        buffer: Arc<MessageBuffer>,
        summarizer: Arc<SummarizerAdapter>,
        broadcaster: Arc<Broadcaster>,
        format: SummaryFormat,
        interval: Duration,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_QUEUE_SIZE);
        Self {
            inner: Arc::new(SchedulerInner {
                buffer,
                summarizer,
                broadcaster,
                format,
                interval,
                trigger_tx,
                trigger_rx: StdMutex::new(Some(trigger_rx)),
                state: tokio::sync::Mutex::new(SchedulerState {
                    phase: SchedulerPhase::Idle,
                    next_tick: None,
                    last_cycle: None,
                }),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Spawn the scheduler loop. The first regular tick is one interval from now.
    pub fn start(&self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let rx = self
            .inner
            .trigger_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::Busy("scheduler already started".to_string()))?;

        let deadline = Instant::now() + self.inner.interval;
        tracing::info!(
            interval_secs = self.inner.interval.as_secs(),
            "scheduler started"
        );

        let scheduler = self.clone();
        Ok(tokio::spawn(async move {
            scheduler.run(rx, deadline, cancel).await;
        }))
    }

    /// Run one cycle out of band and wait for its result.
    pub async fn trigger_now(&self) -> Result<CycleResult> {
        self.trigger(CycleTrigger::Manual).await
    }

    pub async fn trigger(&self, trigger: CycleTrigger) -> Result<CycleResult> {
        if self.inner.state.lock().await.phase == SchedulerPhase::Stopped {
            return Err(Error::Stopped);
        }

        let (reply, rx) = oneshot::channel();
        self.inner
            .trigger_tx
            .try_send(TriggerRequest { trigger, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    Error::Busy("too many cycles already queued".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => Error::Stopped,
            })?;

        tracing::debug!(%trigger, "cycle trigger queued");
        rx.await.map_err(|_| Error::Stopped)
    }

    pub async fn status(&self) -> SchedulerStatus {
        let st = self.inner.state.lock().await;
        SchedulerStatus {
            phase: st.phase,
            interval: self.inner.interval,
            next_tick: st.next_tick,
            last_cycle: st.last_cycle.clone(),
        }
    }

    async fn run(
        self,
        mut rx: mpsc::Receiver<TriggerRequest>,
        mut deadline: Instant,
        cancel: CancellationToken,
    ) {
        let interval = self.inner.interval;
        let mut next_tick = wall_clock(deadline);
        loop {
            self.set_waiting(next_tick).await;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep_until(deadline) => {
                    self.execute(CycleTrigger::Scheduled).await;
                    deadline = next_deadline(deadline, interval, Instant::now());
                    next_tick = wall_clock(deadline);
                }
                Some(req) = rx.recv() => {
                    let result = self.execute(req.trigger).await;
                    if req.reply.send(result).is_err() {
                        tracing::debug!("trigger caller went away before the cycle finished");
                    }
                }
            }
        }

        // Queued triggers see a closed reply channel and get `Stopped`.
        rx.close();
        let mut rejected = 0usize;
        while rx.try_recv().is_ok() {
            rejected += 1;
        }

        let mut st = self.inner.state.lock().await;
        st.phase = SchedulerPhase::Stopped;
        st.next_tick = None;
        tracing::info!(rejected, "scheduler stopped");
    }

    async fn set_waiting(&self, next_tick: DateTime<Utc>) {
        let mut st = self.inner.state.lock().await;
        st.phase = SchedulerPhase::Waiting { next_tick };
        st.next_tick = Some(next_tick);
    }

    async fn execute(&self, trigger: CycleTrigger) -> CycleResult {
        self.inner.state.lock().await.phase = SchedulerPhase::Running { trigger };
        let result = self.run_cycle(trigger).await;
        self.inner.state.lock().await.last_cycle = Some(result.clone());
        result
    }

    /// One full cycle. Never fails: every problem ends up in the result's outcome.
    pub async fn run_cycle(&self, trigger: CycleTrigger) -> CycleResult {
        let started_at = Utc::now();
        let batch = self.inner.buffer.drain();
        tracing::info!(
            %trigger,
            batch_size = batch.len(),
            truncated = batch.truncated,
            "cycle started"
        );

        let summary = match self.inner.summarizer.summarize(&batch).await {
            SummaryOutcome::NoActivity => {
                tracing::info!(%trigger, "no new messages, skipping broadcast");
                return CycleResult::new(trigger, CycleOutcome::Skipped, started_at);
            }
            SummaryOutcome::Failed(reason) => {
                tracing::error!(%trigger, batch_size = batch.len(), %reason, "summarization failed, skipping broadcast");
                let mut result = CycleResult::new(
                    trigger,
                    CycleOutcome::SummarizationFailed(reason),
                    started_at,
                );
                result.batch_size = batch.len();
                return result;
            }
            SummaryOutcome::Fallback(summary) => {
                tracing::warn!("model reply was not structured, sending fallback summary");
                summary
            }
            SummaryOutcome::Parsed(summary) => summary,
        };

        let html = format_summary_html(&summary, &self.inner.format);
        let report = self.inner.broadcaster.broadcast(&html).await;

        let result = CycleResult {
            trigger,
            outcome: CycleOutcome::Delivered,
            summary: Some(summary),
            batch_size: batch.len(),
            delivered_count: report.delivered,
            failed_ids: report.failed_ids,
            deactivated_ids: report.deactivated_ids,
            started_at,
            finished_at: Utc::now(),
        };
        tracing::info!(
            %trigger,
            batch_size = result.batch_size,
            delivered = result.delivered_count,
            failed = result.failed_ids.len(),
            "cycle finished"
        );
        result
    }
}

fn wall_clock(deadline: Instant) -> DateTime<Utc> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    Utc::now() + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Keep the regular cadence; ticks missed during a long cycle are skipped.
fn next_deadline(previous: Instant, interval: Duration, now: Instant) -> Instant {
    let next = previous + interval;
    if next <= now {
        now + interval
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RawMessage;
    use crate::subscribers::{Profile, SubscriberStore};
    use crate::summarizer::testing::{FakeCompletion, Reply};
    use crate::summarizer::{RetryPolicy, SummarizerSettings};
    use crate::testing::FakeMessenger;
    use chrono::FixedOffset;

    const VALID: &str = r#"{"summary":"Stocks up","key_points":["a","b"],"sentiment":"bullish","potentially_impacted_stocks":["AAPL"]}"#;

    struct Harness {
        _dir: tempfile::TempDir,
        buffer: Arc<MessageBuffer>,
        completion: Arc<FakeCompletion>,
        messenger: Arc<FakeMessenger>,
        scheduler: Scheduler,
    }

    async fn harness(completion: FakeCompletion, interval: Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SubscriberStore::open(dir.path().join("subs.json")).unwrap());
        for id in [10, 20] {
            store
                .subscribe(&SubscriberId::from(id), Profile::default())
                .await
                .unwrap();
        }

        let buffer = Arc::new(MessageBuffer::new(200));
        let completion = Arc::new(completion);
        let messenger = Arc::new(FakeMessenger::default());
        let summarizer = Arc::new(SummarizerAdapter::new(
            completion.clone(),
            SummarizerSettings {
                timeout: Duration::from_secs(30),
                retry: RetryPolicy {
                    max_retries: 1,
                    initial_backoff: Duration::from_secs(2),
                },
                max_prompt_chars: 15_000,
                temperature: 0.2,
                max_tokens: 1000,
            },
        ));
        let broadcaster = Arc::new(Broadcaster::new(store, messenger.clone()));
        let format = SummaryFormat {
            max_key_points: 3,
            offset: FixedOffset::east_opt(8 * 3600).unwrap(),
            max_len: 4096,
        };
        let scheduler =
            Scheduler::with_parts(buffer.clone(), summarizer, broadcaster, format, interval);

        Harness {
            _dir: dir,
            buffer,
            completion,
            messenger,
            scheduler,
        }
    }

    fn feed(buffer: &MessageBuffer, n: usize) {
        for i in 0..n {
            buffer.append(RawMessage::new(format!("1:{i}"), format!("news {i}")));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_buffer_skips_without_calls() {
        let h = harness(FakeCompletion::text(VALID), Duration::from_secs(60)).await;
        let result = h.scheduler.run_cycle(CycleTrigger::Manual).await;

        assert_eq!(result.outcome, CycleOutcome::Skipped);
        assert_eq!(h.completion.calls(), 0);
        assert!(h.messenger.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delivered_cycle_reaches_every_subscriber() {
        let h = harness(FakeCompletion::text(VALID), Duration::from_secs(60)).await;
        feed(&h.buffer, 3);

        let result = h.scheduler.run_cycle(CycleTrigger::Manual).await;

        assert_eq!(result.outcome, CycleOutcome::Delivered);
        assert_eq!(result.batch_size, 3);
        assert_eq!(result.delivered_count, 2);
        let sent = h.messenger.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].1.contains("Stocks up"));
        assert!(sent[0].1.contains("from 3 messages"));
        assert!(h.buffer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_exhaust_retry_and_skip_broadcast() {
        let h = harness(FakeCompletion::new(vec![Reply::Hang]), Duration::from_secs(60)).await;
        feed(&h.buffer, 3);

        let result = h.scheduler.run_cycle(CycleTrigger::Manual).await;

        assert!(matches!(result.outcome, CycleOutcome::SummarizationFailed(_)));
        assert_eq!(result.batch_size, 3);
        assert_eq!(h.completion.calls(), 2);
        assert!(h.messenger.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn regular_tick_runs_a_scheduled_cycle() {
        let h = harness(FakeCompletion::text(VALID), Duration::from_secs(60)).await;
        let cancel = CancellationToken::new();
        let handle = h.scheduler.start(cancel.clone()).unwrap();
        feed(&h.buffer, 2);

        tokio::time::sleep(Duration::from_secs(61)).await;

        let status = h.scheduler.status().await;
        let last = status.last_cycle.unwrap();
        assert_eq!(last.trigger, CycleTrigger::Scheduled);
        assert_eq!(last.outcome, CycleOutcome::Delivered);
        assert!(matches!(status.phase, SchedulerPhase::Waiting { .. }));
        assert_eq!(h.messenger.sent().len(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn manual_trigger_keeps_the_regular_deadline() {
        let h = harness(FakeCompletion::text(VALID), Duration::from_secs(60)).await;
        let cancel = CancellationToken::new();
        let handle = h.scheduler.start(cancel.clone()).unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        let before = h.scheduler.status().await.next_tick.unwrap();
        let manual = h.scheduler.trigger_now().await.unwrap();
        assert_eq!(manual.trigger, CycleTrigger::Manual);
        assert_eq!(manual.outcome, CycleOutcome::Skipped);
        assert_eq!(h.scheduler.status().await.next_tick.unwrap(), before);

        // The first 60s deadline still fires; a reset one would be at 90s.
        tokio::time::sleep(Duration::from_secs(31)).await;
        let last = h.scheduler.status().await.last_cycle.unwrap();
        assert_eq!(last.trigger, CycleTrigger::Scheduled);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_loop_and_rejects_triggers() {
        let h = harness(FakeCompletion::text(VALID), Duration::from_secs(60)).await;
        let cancel = CancellationToken::new();
        let handle = h.scheduler.start(cancel.clone()).unwrap();
        assert!(matches!(h.scheduler.start(cancel.clone()), Err(Error::Busy(_))));

        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(h.scheduler.status().await.phase, SchedulerPhase::Stopped);
        assert!(matches!(h.scheduler.trigger_now().await, Err(Error::Stopped)));
        assert_eq!(h.completion.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_lets_the_running_cycle_finish() {
        let completion = FakeCompletion::new(vec![
            Reply::Fail("upstream 502".to_string()),
            Reply::Text("Markets drifted sideways on light volume.".to_string()),
        ]);
        let h = harness(completion, Duration::from_secs(600)).await;
        let cancel = CancellationToken::new();
        let handle = h.scheduler.start(cancel.clone()).unwrap();
        feed(&h.buffer, 2);

        let scheduler = h.scheduler.clone();
        let manual = tokio::spawn(async move { scheduler.trigger_now().await });

        // First attempt failed; the cycle now sits in the 2s retry backoff.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            h.scheduler.status().await.phase,
            SchedulerPhase::Running {
                trigger: CycleTrigger::Manual
            }
        );
        cancel.cancel();

        let result = manual.await.unwrap().unwrap();
        assert_eq!(result.outcome, CycleOutcome::Delivered);
        assert_eq!(result.delivered_count, 2);
        let summary = result.summary.unwrap();
        assert_eq!(summary.headline, "Markets drifted sideways on light volume.");
        assert!(summary.bullets.is_empty());
        assert_eq!(h.completion.calls(), 2);
        assert_eq!(h.messenger.sent().len(), 2);

        handle.await.unwrap();
        assert_eq!(h.scheduler.status().await.phase, SchedulerPhase::Stopped);
    }

    #[test]
    fn missed_ticks_are_skipped() {
        let t0 = Instant::now();
        let i = Duration::from_secs(10);
        assert_eq!(next_deadline(t0, i, t0 + Duration::from_secs(3)), t0 + i);
        let late = t0 + Duration::from_secs(25);
        assert_eq!(next_deadline(t0, i, late), late + i);
    }
}
