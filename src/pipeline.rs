use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use crate::config::Settings;
use crate::error::{PipelineError, Result};
use crate::fetch::Fetcher;
use crate::interrupt::Interrupts;
use crate::normalize::FilterReport;
use crate::reader::FieldReader;
use crate::runner::StageSummary;
use crate::stage::Stage;
use crate::stages::{self, StageContext};
use crate::store::RecordStore;

/// What to run this time.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub base_url: String,
    /// Ascending, de-duplicated.
    pub stages: Vec<Stage>,
    pub resume: bool,
    /// Cap on planned search pages. Applies to stage 1 only.
    pub max_pages: Option<usize>,
    pub show_progress: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Finished(StageSummary),
    Filtered(FilterReport),
    /// The stage stopped on a non-fatal error; later stages still ran.
    Failed(String),
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunReport {
    pub stages: Vec<(Stage, StageOutcome)>,
}

impl RunReport {
    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stages.iter().find(|(s, _)| *s == stage).map(|(_, o)| o)
    }
}

/// Sequences the requested stages over one record store.
pub struct Pipeline {
    settings: Arc<Settings>,
    fetcher: Arc<dyn Fetcher>,
    reader: Arc<dyn FieldReader>,
    interrupts: Interrupts,
}

impl Pipeline {
    pub fn new(
        settings: Settings,
        fetcher: Arc<dyn Fetcher>,
        reader: Arc<dyn FieldReader>,
        interrupts: Interrupts,
    ) -> Self {
        Pipeline {
            settings: Arc::new(settings),
            fetcher,
            reader,
            interrupts,
        }
    }

    /// Run every requested stage in order. Record failures, stage errors
    /// and interrupts do not stop the run; only a corrupt store or bad
    /// configuration does, and those surface before any stage starts.
    pub async fn run(&self, opts: &RunOptions) -> Result<RunReport> {
        self.prepare_dirs()?;
        let mut store = RecordStore::open(self.settings.store_path())?;
        info!(records = store.len(), "Loaded record store {:?}", store.path());

        let ctx = StageContext::new(
            Arc::clone(&self.settings),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.reader),
            opts.resume,
            opts.show_progress,
        );

        let mut report = RunReport::default();
        for &stage in &opts.stages {
            let cancel = self.interrupts.stage_token();
            let span = info_span!("stage", stage = stage.name());
            info!(parent: &span, "Running {}", stage);

            let result = self
                .run_stage(&ctx, stage, opts, &mut store, cancel)
                .instrument(span.clone())
                .await;

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(parent: &span, kind = e.kind(), "{} failed: {}", stage, e);
                    StageOutcome::Failed(e.to_string())
                }
            };
            if let StageOutcome::Finished(summary) = &outcome {
                if summary.interrupted {
                    info!(parent: &span, "{} interrupted, moving to next stage", stage);
                }
            }
            report.stages.push((stage, outcome));
        }
        Ok(report)
    }

    async fn run_stage(
        &self,
        ctx: &StageContext,
        stage: Stage,
        opts: &RunOptions,
        store: &mut RecordStore,
        cancel: CancellationToken,
    ) -> Result<StageOutcome> {
        let outcome = match stage {
            Stage::Collect => StageOutcome::Finished(
                stages::collect::run(ctx, &opts.base_url, opts.max_pages, cancel).await?,
            ),
            Stage::ExtractLinks => {
                StageOutcome::Finished(stages::links::run(ctx, store, cancel).await?)
            }
            Stage::FetchDetails => {
                StageOutcome::Finished(stages::details::run(ctx, store, cancel).await?)
            }
            Stage::ExtractFields => {
                StageOutcome::Finished(stages::fields::run(ctx, store, cancel).await?)
            }
            Stage::Filter => StageOutcome::Filtered(stages::filter::run(ctx, store)?),
        };
        Ok(outcome)
    }

    fn prepare_dirs(&self) -> Result<()> {
        for dir in [
            self.settings.cards_dir(),
            self.settings.listings_dir(),
            self.settings.output_dir.clone(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
        }
        Ok(())
    }
}
