use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::normalize::FilterPolicy;
use crate::retry::RetryPolicy;
use crate::runner::Pacing;
use crate::stage::Stage;

/// Looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "harvest";
pub const ENV_PREFIX: &str = "HARVEST";

const STORE_FILE: &str = "craigslist_links.csv";
const FILTERED_FILE: &str = "filtered_phone_numbers.csv";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    pub user_agent: String,
    pub fetch_timeout_secs: u64,
    /// Prefix for root-relative card links.
    pub link_base: String,
    /// Results per search page.
    pub page_size: usize,
    /// Pages planned when the result count cannot be read.
    pub default_total_pages: usize,
    pub retry: RetrySettings,
    pub pacing: PacingSettings,
    pub workers: StageCounts,
    pub batch: StageCounts,
    pub filter: FilterPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            data_dir: PathBuf::from("data"),
            output_dir: PathBuf::from("output"),
            log_file: None,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36"
                .to_string(),
            fetch_timeout_secs: 30,
            link_base: "https://craigslist.org".to_string(),
            page_size: 120,
            default_total_pages: 10,
            retry: RetrySettings::default(),
            pacing: PacingSettings::default(),
            workers: StageCounts {
                collect: 3,
                links: 4,
                details: 2,
                fields: 4,
            },
            batch: StageCounts {
                collect: 1,
                links: 10,
                details: 5,
                fields: 10,
            },
            filter: FilterPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub attempts: u32,
    pub delay_secs: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            attempts: 3,
            delay_secs: 5.0,
        }
    }
}

/// Jitter bounds, in seconds, between consecutive page and listing fetches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingSettings {
    pub page_min_secs: f64,
    pub page_max_secs: f64,
    pub listing_min_secs: f64,
    pub listing_max_secs: f64,
}

impl Default for PacingSettings {
    fn default() -> Self {
        PacingSettings {
            page_min_secs: 5.0,
            page_max_secs: 10.0,
            listing_min_secs: 3.0,
            listing_max_secs: 7.0,
        }
    }
}

/// One value per pooled stage. The filter stage always runs on one thread.
/// Partial tables are merged over [`Settings::default`] before decoding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageCounts {
    pub collect: usize,
    pub links: usize,
    pub details: usize,
    pub fields: usize,
}

impl StageCounts {
    pub fn get(&self, stage: Stage) -> usize {
        match stage {
            Stage::Collect => self.collect,
            Stage::ExtractLinks => self.links,
            Stage::FetchDetails => self.details,
            Stage::ExtractFields => self.fields,
            Stage::Filter => 1,
        }
    }

    pub fn set(&mut self, stage: Stage, value: usize) {
        match stage {
            Stage::Collect => self.collect = value,
            Stage::ExtractLinks => self.links = value,
            Stage::FetchDetails => self.details = value,
            Stage::ExtractFields => self.fields = value,
            Stage::Filter => {}
        }
    }
}

impl Settings {
    /// Defaults, then the TOML file (`path`, or `harvest.toml` if present),
    /// then `HARVEST__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Settings> {
        Self::load_with_env(path, ENV_PREFIX)
    }

    fn load_with_env(path: Option<&Path>, env_prefix: &str) -> Result<Settings> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let defaults = Config::try_from(&Settings::default())
            .map_err(|e| PipelineError::Configuration(e.to_string()))?;
        let settings: Settings = Config::builder()
            .add_source(defaults)
            .add_source(file)
            .add_source(
                Environment::with_prefix(env_prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<Settings>())
            .map_err(|e| PipelineError::Configuration(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(PipelineError::Configuration(msg));
        if self.retry.attempts == 0 {
            return invalid("retry.attempts must be at least 1".into());
        }
        if self.retry.delay_secs < 0.0 {
            return invalid("retry.delay_secs must not be negative".into());
        }
        if self.page_size == 0 {
            return invalid("page_size must be at least 1".into());
        }
        if self.default_total_pages == 0 {
            return invalid("default_total_pages must be at least 1".into());
        }
        for stage in [
            Stage::Collect,
            Stage::ExtractLinks,
            Stage::FetchDetails,
            Stage::ExtractFields,
        ] {
            if self.workers.get(stage) == 0 {
                return invalid(format!("workers for {} must be at least 1", stage));
            }
            if self.batch.get(stage) == 0 {
                return invalid(format!("batch size for {} must be at least 1", stage));
            }
        }
        let p = &self.pacing;
        for (name, min, max) in [
            ("page", p.page_min_secs, p.page_max_secs),
            ("listing", p.listing_min_secs, p.listing_max_secs),
        ] {
            if min < 0.0 || min > max {
                return invalid(format!(
                    "pacing.{name}_min_secs ({min}) must be between 0 and pacing.{name}_max_secs ({max})"
                ));
            }
        }
        Ok(())
    }

    /// Run every pool single-threaded.
    pub fn serial(&mut self) {
        self.workers = StageCounts {
            collect: 1,
            links: 1,
            details: 1,
            fields: 1,
        };
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.attempts,
            Duration::from_secs_f64(self.retry.delay_secs),
        )
    }

    pub fn page_pacing(&self) -> Pacing {
        Pacing::between(
            Duration::from_secs_f64(self.pacing.page_min_secs),
            Duration::from_secs_f64(self.pacing.page_max_secs),
        )
    }

    pub fn listing_pacing(&self) -> Pacing {
        Pacing::between(
            Duration::from_secs_f64(self.pacing.listing_min_secs),
            Duration::from_secs_f64(self.pacing.listing_max_secs),
        )
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Search result cards written by stage 1.
    pub fn cards_dir(&self) -> PathBuf {
        self.data_dir.join("cards")
    }

    /// Listing documents written by stage 3.
    pub fn listings_dir(&self) -> PathBuf {
        self.data_dir.join("listings")
    }

    pub fn store_path(&self) -> PathBuf {
        self.output_dir.join(STORE_FILE)
    }

    pub fn filtered_path(&self) -> PathBuf {
        self.output_dir.join(FILTERED_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let s = Settings::default();
        s.validate().unwrap();
        assert_eq!(s.workers.get(Stage::FetchDetails), 2);
        assert_eq!(s.batch.get(Stage::ExtractLinks), 10);
        assert_eq!(s.workers.get(Stage::Filter), 1);
        assert_eq!(s.store_path(), PathBuf::from("output/craigslist_links.csv"));
        assert_eq!(s.listings_dir(), PathBuf::from("data/listings"));
        assert!(s.filter.phone_required);
        assert!(!s.filter.dedup_by_phone);
    }

    #[test]
    fn file_then_env_layers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvest.toml");
        std::fs::write(
            &path,
            "data_dir = \"/tmp/cl\"\n[retry]\nattempts = 5\n[workers]\ndetails = 6\n[filter]\ndedup_by_phone = true\n",
        )
        .unwrap();
        std::env::set_var("HARVEST_LAYER_TEST__WORKERS__DETAILS", "8");

        let s = Settings::load_with_env(Some(&path), "HARVEST_LAYER_TEST").unwrap();
        assert_eq!(s.data_dir, PathBuf::from("/tmp/cl"));
        assert_eq!(s.retry.attempts, 5);
        assert_eq!(s.retry.delay_secs, 5.0);
        assert_eq!(s.workers.details, 8);
        assert_eq!(s.workers.fields, 4);
        assert!(s.filter.dedup_by_phone);
        assert!(s.filter.phone_required);
    }

    #[test]
    fn missing_explicit_file_is_a_configuration_error() {
        let missing = Path::new("/nonexistent/harvest.toml");
        let err = Settings::load_with_env(Some(missing), "HARVEST_MISSING_TEST").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn invalid_values_rejected() {
        let mut s = Settings::default();
        s.retry.attempts = 0;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.batch.details = 0;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.pacing.listing_min_secs = 9.0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn serial_forces_single_workers() {
        let mut s = Settings::default();
        s.workers.set(Stage::ExtractFields, 12);
        s.serial();
        assert!(Stage::ALL.iter().all(|&st| s.workers.get(st) == 1));
    }
}
