use tracing::info;

use super::StageContext;
use crate::error::Result;
use crate::normalize::{normalize_and_filter, write_filtered, FilterReport};
use crate::store::RecordStore;

/// Stage 5: normalize, dedup and filter the whole store into the output
/// table. The store itself is not modified.
pub fn run(ctx: &StageContext, store: &RecordStore) -> Result<FilterReport> {
    let path = ctx.settings.filtered_path();
    let (rows, report) = normalize_and_filter(store.records().to_vec(), &ctx.settings.filter);
    write_filtered(&path, &rows)?;
    info!(
        original = report.original,
        retained = report.retained,
        removed = report.original - report.retained,
        "Saved {} filtered records to {:?}",
        rows.len(),
        path
    );
    Ok(report)
}
