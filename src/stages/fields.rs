use std::io::ErrorKind;
use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::StageContext;
use crate::error::{PipelineError, Result};
use crate::extract::{merge_phone, ExtractionEngine};
use crate::record::{Record, RecordUpdate, StatusFlag};
use crate::runner::{StageSummary, UnitOutcome};
use crate::stage::Stage;
use crate::store::RecordStore;
use crate::utils::document_name;

/// Stage 4: parse each saved listing into fields and a resolved phone.
pub async fn run(
    ctx: &StageContext,
    store: &mut RecordStore,
    cancel: CancellationToken,
) -> Result<StageSummary> {
    let records = store.eligible_for(Stage::ExtractFields, ctx.resume);
    info!("Found {} listings to process", records.len());

    let engine = ctx.engine.clone();
    let dir = ctx.settings.listings_dir();

    let summary = ctx
        .runner(Stage::ExtractFields, cancel)
        .run(
            records,
            move |record: Record| {
                let engine = engine.clone();
                let dir = dir.clone();
                async move { extract_listing(engine, &dir, record).await }
            },
            |batch| {
                let stats = store.merge(batch);
                debug!(updated = stats.changed, "merged {} extractions", stats.applied);
                store.save()
            },
        )
        .await?;

    let with_phone = store
        .records()
        .iter()
        .filter(|r| r.phone.as_ref().is_some_and(|p| p.is_canonical()))
        .count();
    info!(
        "Saved {} records to {:?}, {} with phone numbers",
        store.len(),
        store.path(),
        with_phone
    );
    Ok(summary)
}

async fn extract_listing(
    engine: ExtractionEngine,
    dir: &Path,
    record: Record,
) -> Result<UnitOutcome<RecordUpdate>> {
    let name = document_name(record.link());
    let path = dir.join(&name);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(link = record.link(), "No HTML file found for listing");
            return Ok(UnitOutcome::Skipped);
        }
        Err(e) => return Err(PipelineError::io(&path, e)),
    };

    let parsed_name = name.clone();
    let extraction = tokio::task::spawn_blocking(move || engine.extract_bytes(&parsed_name, &bytes))
        .await
        .map_err(|e| PipelineError::ContentParse {
            source_name: name,
            reason: e.to_string(),
        })?;

    if extraction.errored {
        warn!(link = record.link(), "listing kept with error markers");
    } else if extraction.fields.is_empty() {
        debug!(link = record.link(), "no fields found in listing");
    }

    // A stored phone outranks the document only while it is still the one
    // the detail fetch captured; after extraction it is re-derived.
    let captured = if record.extracted {
        None
    } else {
        record.phone.as_ref()
    };
    let phone = merge_phone(captured, extraction.resolution.phone);
    Ok(UnitOutcome::Done(
        RecordUpdate::mark(StatusFlag::Extracted)
            .with_phone(Some(phone))
            .with_fields(extraction.fields),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::extract::annotate;
    use crate::fetch::fake::ScriptedFetcher;
    use crate::record::{CanonicalPhone, Phone};
    use crate::stages::testing::{context, fixture, settings};

    const CAMRY: &str = "https://losangeles.craigslist.org/oc/cto/d/anaheim-2015-toyota-camry-se/7712345001.html";
    const BROKEN: &str = "https://losangeles.craigslist.org/oc/cto/d/broken/7712345009.html";
    const MISSING: &str = "https://losangeles.craigslist.org/oc/cto/d/missing/7712345010.html";

    fn detailed(link: &str) -> Record {
        let mut r = Record::new(link).unwrap();
        r.collected = true;
        r.detailed = true;
        r
    }

    fn phone(s: &str) -> Phone {
        Phone::Canonical(CanonicalPhone::parse(s).unwrap())
    }

    #[tokio::test]
    async fn side_channel_outranks_contact_element() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(settings(dir.path()), Arc::new(ScriptedFetcher::new()), true);
        let revealed = CanonicalPhone::parse("(714) 760-4016").unwrap();
        let doc = annotate(&fixture("listing.html"), &revealed);
        std::fs::write(ctx.settings.listings_dir().join(document_name(CAMRY)), doc).unwrap();
        let mut store = RecordStore::from_records(ctx.settings.store_path(), vec![detailed(CAMRY)]);

        let summary = run(&ctx, &mut store, CancellationToken::new()).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        let record = store.get(CAMRY).unwrap();
        assert!(record.extracted);
        assert_eq!(record.phone, Some(phone("(714) 760-4016")));
        assert_eq!(record.fields.title.as_deref(), Some("2015 Toyota Camry SE"));
        assert_eq!(record.fields.location.as_deref(), Some("anaheim"));
        assert_eq!(record.fields.attributes.get("fuel").map(String::as_str), Some("gas"));
    }

    #[tokio::test]
    async fn earlier_phone_kept_over_document() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(settings(dir.path()), Arc::new(ScriptedFetcher::new()), true);
        let doc_path = ctx.settings.listings_dir().join(document_name(CAMRY));
        std::fs::write(doc_path, fixture("listing.html")).unwrap();
        let mut record = detailed(CAMRY);
        record.phone = Some(phone("(800) 555-1234"));
        let mut store = RecordStore::from_records(ctx.settings.store_path(), vec![record]);

        run(&ctx, &mut store, CancellationToken::new()).await.unwrap();
        assert_eq!(store.get(CAMRY).unwrap().phone, Some(phone("(800) 555-1234")));
    }

    #[tokio::test]
    async fn forced_reextraction_revises_its_own_phone() {
        let dir = tempfile::tempdir().unwrap();
        let path = |ctx: &StageContext| ctx.settings.listings_dir().join(document_name(CAMRY));

        let first = context(settings(dir.path()), Arc::new(ScriptedFetcher::new()), true);
        std::fs::write(path(&first), "<p>post id 7712345001, text 949.555.0111</p>").unwrap();
        let mut store =
            RecordStore::from_records(first.settings.store_path(), vec![detailed(CAMRY)]);
        run(&first, &mut store, CancellationToken::new()).await.unwrap();
        assert_eq!(store.get(CAMRY).unwrap().phone, Some(phone("(949) 555-0111")));

        let forced = context(settings(dir.path()), Arc::new(ScriptedFetcher::new()), false);
        std::fs::write(path(&forced), fixture("listing.html")).unwrap();
        run(&forced, &mut store, CancellationToken::new()).await.unwrap();
        assert_eq!(store.get(CAMRY).unwrap().phone, Some(phone("(213) 555-0199")));
    }

    #[tokio::test]
    async fn broken_and_missing_documents() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(settings(dir.path()), Arc::new(ScriptedFetcher::new()), true);
        let doc_path = ctx.settings.listings_dir().join(document_name(BROKEN));
        std::fs::write(doc_path, [0xff, 0xfe, 0x00]).unwrap();
        let mut store = RecordStore::from_records(
            ctx.settings.store_path(),
            vec![detailed(BROKEN), detailed(MISSING)],
        );

        let summary = run(&ctx, &mut store, CancellationToken::new()).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);

        let broken = store.get(BROKEN).unwrap();
        assert!(broken.extracted);
        assert_eq!(broken.fields.title.as_deref(), Some("ERROR"));
        assert_eq!(broken.phone, Some(Phone::Unresolved));

        let missing = store.get(MISSING).unwrap();
        assert!(!missing.extracted);
        assert_eq!(missing.phone, None);
    }
}
