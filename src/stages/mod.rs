//! Units of work for the five pipeline stages. Each stage module exposes a
//! `run` that gathers its items, drives them through a [`StageRunner`] and
//! merges results into the record store at batch boundaries.

pub mod collect;
pub mod details;
pub mod fields;
pub mod filter;
pub mod links;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::extract::ExtractionEngine;
use crate::fetch::Fetcher;
use crate::reader::FieldReader;
use crate::runner::StageRunner;
use crate::stage::Stage;

/// Collaborators shared by every stage of one run.
#[derive(Clone)]
pub struct StageContext {
    pub settings: Arc<Settings>,
    pub fetcher: Arc<dyn Fetcher>,
    pub reader: Arc<dyn FieldReader>,
    pub engine: ExtractionEngine,
    /// Skip work already recorded as done.
    pub resume: bool,
    pub show_progress: bool,
}

impl StageContext {
    pub fn new(
        settings: Arc<Settings>,
        fetcher: Arc<dyn Fetcher>,
        reader: Arc<dyn FieldReader>,
        resume: bool,
        show_progress: bool,
    ) -> Self {
        StageContext {
            settings,
            fetcher,
            engine: ExtractionEngine::new(Arc::clone(&reader)),
            reader,
            resume,
            show_progress,
        }
    }

    /// Runner sized from the settings for `stage`. Pacing is left to the
    /// fetching stages.
    pub fn runner(&self, stage: Stage, cancel: CancellationToken) -> StageRunner {
        StageRunner::new(stage, cancel)
            .with_concurrency(self.settings.workers.get(stage))
            .with_batch_size(self.settings.batch.get(stage))
            .with_retry(self.settings.retry_policy())
            .with_progress(self.show_progress)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;
    use std::sync::Arc;

    use super::StageContext;
    use crate::config::Settings;
    use crate::fetch::Fetcher;
    use crate::reader::ListingReader;

    /// Fast settings rooted in `root`: no pacing, no retry delay.
    pub fn settings(root: &Path) -> Settings {
        let mut s = Settings {
            data_dir: root.join("data"),
            output_dir: root.join("output"),
            ..Settings::default()
        };
        s.retry.delay_secs = 0.0;
        s.pacing.page_min_secs = 0.0;
        s.pacing.page_max_secs = 0.0;
        s.pacing.listing_min_secs = 0.0;
        s.pacing.listing_max_secs = 0.0;
        s
    }

    pub fn context(settings: Settings, fetcher: Arc<dyn Fetcher>, resume: bool) -> StageContext {
        std::fs::create_dir_all(settings.cards_dir()).unwrap();
        std::fs::create_dir_all(settings.listings_dir()).unwrap();
        std::fs::create_dir_all(&settings.output_dir).unwrap();
        StageContext::new(Arc::new(settings), fetcher, Arc::new(ListingReader), resume, false)
    }

    pub fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}", name)).unwrap()
    }
}
