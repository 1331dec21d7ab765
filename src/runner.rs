use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

use crate::error::Result;
use crate::record::Record;
use crate::retry::RetryPolicy;
use crate::stage::Stage;

/// Work items carry the identity their results are merged under.
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for Record {
    fn key(&self) -> &str {
        self.link()
    }
}

impl Keyed for String {
    fn key(&self) -> &str {
        self
    }
}

/// What one unit of work produced.
#[derive(Debug)]
pub enum UnitOutcome<U> {
    Done(U),
    /// Nothing to do for this item yet; it stays eligible.
    Skipped,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StageSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub interrupted: bool,
}

/// Jittered delay between consecutive dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    min: Duration,
    max: Duration,
}

impl Pacing {
    pub fn none() -> Self {
        Pacing {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    pub fn between(min: Duration, max: Duration) -> Self {
        Pacing {
            min,
            max: max.max(min),
        }
    }

    /// Uniform in `[min, max]`.
    pub fn next_delay(&self) -> Duration {
        let spread = self.max - self.min;
        self.min + spread.mul_f64(fastrand::f64())
    }
}

/// Runs one stage's unit of work over a set of items with a bounded worker
/// pool. Workers own their item and report back over a channel; the caller's
/// batch callback is the only place results touch shared state.
pub struct StageRunner {
    stage: Stage,
    concurrency: usize,
    batch_size: usize,
    retry: RetryPolicy,
    pacing: Pacing,
    cancel: CancellationToken,
    show_progress: bool,
}

impl StageRunner {
    pub fn new(stage: Stage, cancel: CancellationToken) -> Self {
        StageRunner {
            stage,
            concurrency: 1,
            batch_size: 10,
            retry: RetryPolicy::default(),
            pacing: Pacing::none(),
            cancel,
            show_progress: false,
        }
    }

    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Process every item through `unit`, handing successful results to
    /// `on_batch` every `batch_size` completions and once more at the end.
    ///
    /// Cancellation stops new dispatches; units already running finish and
    /// their results are still delivered. Undispatched items count as
    /// skipped. An error from `on_batch` aborts the stage.
    pub async fn run<I, U, F, Fut, S>(
        &self,
        items: Vec<I>,
        unit: F,
        mut on_batch: S,
    ) -> Result<StageSummary>
    where
        I: Keyed + Clone + Send + Sync + 'static,
        U: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<UnitOutcome<U>>> + Send + 'static,
        S: FnMut(Vec<(String, U)>) -> Result<()>,
    {
        let total = items.len();
        let pb = self.progress_bar(total);
        let (tx, mut rx) =
            mpsc::channel::<(String, Result<UnitOutcome<U>>)>(self.concurrency * 2);

        let dispatcher = tokio::spawn(
            dispatch(
                items,
                Arc::new(unit),
                Arc::new(Semaphore::new(self.concurrency)),
                tx,
                self.retry,
                self.pacing,
                self.cancel.clone(),
                self.stage,
            )
            .in_current_span(),
        );

        let mut summary = StageSummary::default();
        let mut pending: Vec<(String, U)> = Vec::new();
        let mut completed = 0usize;

        while let Some((key, result)) = rx.recv().await {
            match result {
                Ok(UnitOutcome::Done(output)) => {
                    summary.succeeded += 1;
                    pending.push((key, output));
                }
                Ok(UnitOutcome::Skipped) => {
                    summary.skipped += 1;
                    debug!(link = %key, stage = self.stage.name(), "skipped");
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(
                        link = %key,
                        stage = self.stage.name(),
                        kind = e.kind(),
                        "record failed: {}",
                        e
                    );
                }
            }
            completed += 1;
            pb.inc(1);

            if completed % self.batch_size == 0 {
                if let Err(e) = on_batch(std::mem::take(&mut pending)) {
                    self.cancel.cancel();
                    pb.abandon();
                    return Err(e);
                }
            }
        }

        let dispatched = match dispatcher.await {
            Ok(n) => n,
            Err(e) => {
                error!(stage = self.stage.name(), "dispatcher stopped: {}", e);
                completed
            }
        };
        summary.skipped += total.saturating_sub(dispatched);
        summary.interrupted = self.cancel.is_cancelled();

        on_batch(pending)?;
        pb.finish_and_clear();

        info!(
            stage = self.stage.name(),
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            interrupted = summary.interrupted,
            "{} finished: {} ok, {} failed, {} skipped",
            self.stage,
            summary.succeeded,
            summary.failed,
            summary.skipped
        );
        Ok(summary)
    }

    fn progress_bar(&self, total: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total as u64);
        let template = "[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta}) {msg}";
        if let Ok(style) = ProgressStyle::default_bar().template(template) {
            pb.set_style(style.progress_chars("=> "));
        }
        pb.set_message(self.stage.name());
        pb
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch<I, U, F, Fut>(
    items: Vec<I>,
    unit: Arc<F>,
    semaphore: Arc<Semaphore>,
    tx: mpsc::Sender<(String, Result<UnitOutcome<U>>)>,
    retry: RetryPolicy,
    pacing: Pacing,
    cancel: CancellationToken,
    stage: Stage,
) -> usize
where
    I: Keyed + Clone + Send + Sync + 'static,
    U: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<UnitOutcome<U>>> + Send + 'static,
{
    let mut dispatched = 0;
    for item in items {
        if cancel.is_cancelled() {
            break;
        }
        if dispatched > 0 {
            let delay = pacing.next_delay();
            if !delay.is_zero() {
                debug!("Sleeping for {:.2} seconds", delay.as_secs_f64());
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        if cancel.is_cancelled() {
            break;
        }

        let unit = Arc::clone(&unit);
        let tx = tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(
            async move {
                let _permit = permit;
                let key = item.key().to_string();
                let label = format!("{} {}", stage.name(), key);
                let result = retry.run(&label, &cancel, || (*unit)(item.clone())).await;
                let _ = tx.send((key, result)).await;
            }
            .in_current_span(),
        );
        dispatched += 1;
    }
    dispatched
}
