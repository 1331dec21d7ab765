use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::normalize::normalize_phone;
use crate::record::{Record, RecordUpdate};
use crate::stage::Stage;

pub const LINK_COLUMN: &str = "link";
const BASE_COLUMNS: [&str; 9] = [
    LINK_COLUMN,
    "collected",
    "scraped",
    "processed",
    "phone_number",
    "title",
    "price",
    "location",
    "post_date",
];
const ATTR_PREFIX: &str = "attr_";
/// Placeholder for an attribute a record does not have.
const MISSING: &str = "N/A";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    pub applied: usize,
    pub changed: usize,
    pub unmatched: usize,
}

/// The pipeline's record table, checkpointed as a CSV file.
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    records: Vec<Record>,
    index: HashMap<String, Vec<usize>>,
}

impl RecordStore {
    pub fn from_records(path: impl Into<PathBuf>, records: Vec<Record>) -> Self {
        let mut store = RecordStore {
            path: path.into(),
            records,
            index: HashMap::new(),
        };
        store.reindex();
        store
    }

    /// Load the table at `path`, creating an empty checkpoint if none exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            return Self::load(path);
        }
        info!("Creating empty record store at {:?}", path);
        let store = Self::from_records(path, Vec::new());
        store.save()?;
        Ok(store)
    }

    /// Tolerant load: only a missing `link` column is an error. Unknown
    /// columns are ignored and malformed cells fall back to defaults.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&path)
            .map_err(|e| corrupt_or_csv(&path, e))?;

        let headers: Vec<String> = reader
            .byte_headers()
            .map_err(|e| corrupt_or_csv(&path, e))?
            .iter()
            .map(|h| canonical_header(&String::from_utf8_lossy(h)))
            .collect();
        let column = |name: &str| headers.iter().position(|h| h == name);

        let link_idx = column(LINK_COLUMN).ok_or_else(|| PipelineError::StoreCorruption {
            path: path.clone(),
            reason: format!("missing `{}` column", LINK_COLUMN),
        })?;
        let collected_idx = column("collected");
        let scraped_idx = column("scraped");
        let processed_idx = column("processed");
        let phone_idx = column("phone_number");
        let title_idx = column("title");
        let price_idx = column("price");
        let location_idx = column("location");
        let post_date_idx = column("post_date");
        let attr_cols: Vec<(usize, String)> = headers
            .iter()
            .enumerate()
            .filter_map(|(i, h)| h.strip_prefix(ATTR_PREFIX).map(|k| (i, k.to_string())))
            .filter(|(_, k)| !k.is_empty())
            .collect();

        let mut records = Vec::new();
        for (line, row) in reader.byte_records().enumerate() {
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    warn!(line = line + 2, "skipping unreadable row in {:?}: {}", path, e);
                    continue;
                }
            };
            // bad bytes in one cell must not cost the whole record
            let cells: Vec<String> = row
                .iter()
                .map(|c| String::from_utf8_lossy(c).into_owned())
                .collect();
            let cell = |idx: Option<usize>| idx.and_then(|i| cells.get(i)).map_or("", |c| c.trim());

            let Some(mut record) = Record::new(cell(Some(link_idx))) else {
                warn!(line = line + 2, "skipping row without a link in {:?}", path);
                continue;
            };
            record.collected = parse_bool(cell(collected_idx));
            record.detailed = parse_bool(cell(scraped_idx));
            record.extracted = parse_bool(cell(processed_idx));
            let phone = cell(phone_idx);
            if !phone.is_empty() {
                record.phone = Some(normalize_phone(phone));
            }
            record.fields.title = text_cell(cell(title_idx));
            record.fields.price = text_cell(cell(price_idx));
            record.fields.location = text_cell(cell(location_idx));
            record.fields.post_date = text_cell(cell(post_date_idx));
            for (idx, key) in &attr_cols {
                if let Some(value) = text_cell(cell(Some(*idx))) {
                    record.fields.attributes.insert(key.clone(), value);
                }
            }
            records.push(record);
        }

        info!("Loaded {} records from {:?}", records.len(), path);
        Ok(Self::from_records(path, records))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Checkpoint to the store's own path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&self.path)
    }

    /// Deterministic: unchanged records always serialize to the same bytes.
    /// Written beside the target and renamed over it.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("csv.tmp");
        let attr_keys = attribute_keys(self.records.iter());
        {
            let mut writer = csv::Writer::from_path(&tmp)?;
            writer.write_record(table_header(&attr_keys))?;
            for record in &self.records {
                writer.write_record(record_cells(record, &attr_keys))?;
            }
            writer.flush().map_err(|e| PipelineError::io(&tmp, e))?;
        }
        fs::rename(&tmp, path).map_err(|e| PipelineError::io(path, e))?;
        debug!("Checkpointed {} records to {:?}", self.records.len(), path);
        Ok(())
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, link: &str) -> Option<&Record> {
        self.index
            .get(link)
            .and_then(|idxs| idxs.first())
            .map(|&i| &self.records[i])
    }

    /// Apply updates by identity. Unknown identities are logged and skipped.
    pub fn merge<I>(&mut self, delta: I) -> MergeStats
    where
        I: IntoIterator<Item = (String, RecordUpdate)>,
    {
        let mut stats = MergeStats::default();
        for (link, update) in delta {
            let Some(idxs) = self.index.get(&link) else {
                warn!(link = %link, "update for unknown record ignored");
                stats.unmatched += 1;
                continue;
            };
            for &i in idxs {
                stats.applied += 1;
                if self.records[i].apply(&update) {
                    stats.changed += 1;
                }
            }
        }
        stats
    }

    /// Add a newly discovered link. Existing records are left as they are
    /// except for gaining the `collected` flag. Returns true for new links.
    pub fn insert_discovered(&mut self, link: &str) -> bool {
        let Some(mut record) = Record::new(link) else {
            return false;
        };
        if let Some(idxs) = self.index.get(record.link()) {
            for &i in idxs {
                self.records[i].collected = true;
            }
            return false;
        }
        record.collected = true;
        self.index
            .insert(record.link().to_string(), vec![self.records.len()]);
        self.records.push(record);
        true
    }

    /// Records a stage should visit. With `resume`, records already flagged
    /// for the stage are skipped regardless of their content.
    pub fn eligible_for(&self, stage: Stage, resume: bool) -> Vec<Record> {
        match stage.flag() {
            Some(flag) if resume => self
                .records
                .iter()
                .filter(|r| !r.flag(flag))
                .cloned()
                .collect(),
            _ => self.records.clone(),
        }
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (i, record) in self.records.iter().enumerate() {
            self.index
                .entry(record.link().to_string())
                .or_default()
                .push(i);
        }
    }
}

/// Sorted attribute keys across a record set.
pub fn attribute_keys<'a>(records: impl Iterator<Item = &'a Record>) -> Vec<String> {
    records
        .flat_map(|r| r.fields.attributes.keys().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn table_header(attr_keys: &[String]) -> Vec<String> {
    BASE_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(attr_keys.iter().map(|k| format!("{}{}", ATTR_PREFIX, k)))
        .collect()
}

pub fn record_cells(record: &Record, attr_keys: &[String]) -> Vec<String> {
    let text = |v: &Option<String>| v.clone().unwrap_or_default();
    let mut cells = vec![
        record.link().to_string(),
        record.collected.to_string(),
        record.detailed.to_string(),
        record.extracted.to_string(),
        record
            .phone
            .as_ref()
            .map(|p| p.as_cell().to_string())
            .unwrap_or_default(),
        text(&record.fields.title),
        text(&record.fields.price),
        text(&record.fields.location),
        text(&record.fields.post_date),
    ];
    for key in attr_keys {
        cells.push(
            record
                .fields
                .attributes
                .get(key)
                .cloned()
                .unwrap_or_else(|| MISSING.to_string()),
        );
    }
    cells
}

/// `Phone Number` and `phone_number` name the same column.
fn canonical_header(header: &str) -> String {
    header.trim().to_lowercase().replace(' ', "_")
}

fn parse_bool(cell: &str) -> bool {
    matches!(
        cell.to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "y" | "t"
    )
}

fn text_cell(cell: &str) -> Option<String> {
    if cell.is_empty() || cell.eq_ignore_ascii_case(MISSING) {
        None
    } else {
        Some(cell.to_string())
    }
}

fn corrupt_or_csv(path: &Path, e: csv::Error) -> PipelineError {
    if e.is_io_error() {
        PipelineError::Csv(e)
    } else {
        PipelineError::StoreCorruption {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    }
}
