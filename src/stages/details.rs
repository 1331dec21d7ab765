use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::StageContext;
use crate::error::{PipelineError, Result};
use crate::extract::{annotate, side_channel, ExtractionEngine};
use crate::fetch::Fetcher;
use crate::record::{Phone, Record, RecordUpdate, StatusFlag};
use crate::runner::{StageSummary, UnitOutcome};
use crate::stage::Stage;
use crate::store::RecordStore;
use crate::utils::document_name;

/// Stage 3: fetch each listing, run the reveal action, and save the page
/// with any phone found written into its side-channel annotation.
pub async fn run(
    ctx: &StageContext,
    store: &mut RecordStore,
    cancel: CancellationToken,
) -> Result<StageSummary> {
    let records = store.eligible_for(Stage::FetchDetails, ctx.resume);
    info!("Found {} listings to fetch", records.len());

    let fetcher = Arc::clone(&ctx.fetcher);
    let engine = ctx.engine.clone();
    let dir = ctx.settings.listings_dir();
    let resume = ctx.resume;

    let summary = ctx
        .runner(Stage::FetchDetails, cancel)
        .with_pacing(ctx.settings.listing_pacing())
        .run(
            records,
            move |record: Record| {
                let fetcher = Arc::clone(&fetcher);
                let engine = engine.clone();
                let dir = dir.clone();
                async move { fetch_listing(fetcher.as_ref(), &engine, &dir, resume, record).await }
            },
            |batch| {
                let stats = store.merge(batch);
                info!(
                    updated = stats.changed,
                    "Saved batch of {} listings",
                    stats.applied
                );
                store.save()
            },
        )
        .await?;
    Ok(summary)
}

async fn fetch_listing(
    fetcher: &dyn Fetcher,
    engine: &ExtractionEngine,
    dir: &Path,
    resume: bool,
    record: Record,
) -> Result<UnitOutcome<RecordUpdate>> {
    let link = record.link();
    let path = dir.join(document_name(link));
    let detailed = RecordUpdate::mark(StatusFlag::Detailed);

    if resume && tokio::fs::try_exists(&path).await.unwrap_or(false) {
        info!(link, "Listing already fetched, skipping");
        let carried = match tokio::fs::read(&path).await {
            Ok(bytes) => side_channel(&String::from_utf8_lossy(&bytes)),
            Err(e) => {
                warn!(link, "cannot reread {:?}: {}", path, e);
                None
            }
        };
        return Ok(UnitOutcome::Done(detailed.with_phone(carried.map(Phone::Canonical))));
    }

    let page = fetcher.fetch(link).await.into_result(link)?;
    let revealed = fetcher.perform_reveal_action(link, page).await;
    let resolution = engine.resolve_phone(&revealed);

    let phone = resolution.phone.canonical().cloned();
    let document = match &phone {
        Some(p) => {
            info!(link, tier = ?resolution.tier, "Extracted phone number: {}", p);
            annotate(&revealed, p)
        }
        None => {
            warn!(link, "Could not extract phone number");
            revealed
        }
    };
    tokio::fs::write(&path, document)
        .await
        .map_err(|e| PipelineError::io(&path, e))?;
    info!(link, "Saved listing to {:?}", path);

    Ok(UnitOutcome::Done(detailed.with_phone(phone.map(Phone::Canonical))))
}
