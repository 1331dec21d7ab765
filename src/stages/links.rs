use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::StageContext;
use crate::error::{PipelineError, Result};
use crate::reader::FieldReader;
use crate::runner::{Keyed, StageSummary, UnitOutcome};
use crate::stage::Stage;
use crate::store::RecordStore;
use crate::utils::absolutize;

/// A saved search result card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardFile {
    pub name: String,
    pub path: PathBuf,
}

impl Keyed for CardFile {
    fn key(&self) -> &str {
        &self.name
    }
}

/// Card files in `dir`, sorted by name so discovery order is stable.
pub fn card_files(dir: &Path) -> Result<Vec<CardFile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(dir).map_err(|e| PipelineError::io(dir, e))?;
    let mut cards = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| PipelineError::io(dir, e))?.path();
        if path.extension().and_then(|x| x.to_str()) != Some("html") {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            cards.push(CardFile {
                name: name.to_string(),
                path: path.clone(),
            });
        }
    }
    cards.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(cards)
}

/// Stage 2: pull the listing link out of each card and add new links to
/// the store. Links already known are left untouched.
pub async fn run(
    ctx: &StageContext,
    store: &mut RecordStore,
    cancel: CancellationToken,
) -> Result<StageSummary> {
    let cards_dir = ctx.settings.cards_dir();
    let cards = card_files(&cards_dir)?;
    if cards.is_empty() {
        error!("No HTML files found in {:?}", cards_dir);
    } else {
        info!("Found {} HTML files to process", cards.len());
    }

    let reader = Arc::clone(&ctx.reader);
    let link_base = ctx.settings.link_base.clone();
    let mut added = 0usize;

    let summary = ctx
        .runner(Stage::ExtractLinks, cancel)
        .run(
            cards,
            move |card: CardFile| {
                let reader = Arc::clone(&reader);
                let link_base = link_base.clone();
                async move { card_link(reader.as_ref(), &link_base, card).await }
            },
            |mut batch| {
                // completion order varies with the pool; insertion order should not
                batch.sort_by(|a, b| a.0.cmp(&b.0));
                for (_, link) in batch {
                    if store.insert_discovered(&link) {
                        added += 1;
                    }
                }
                store.save()
            },
        )
        .await?;

    info!(added, total = store.len(), "Saved links to {:?}", store.path());
    Ok(summary)
}

async fn card_link(
    reader: &dyn FieldReader,
    link_base: &str,
    card: CardFile,
) -> Result<UnitOutcome<String>> {
    let content = tokio::fs::read_to_string(&card.path)
        .await
        .map_err(|e| PipelineError::io(&card.path, e))?;
    match reader.card_link(&content) {
        Some(href) => Ok(UnitOutcome::Done(absolutize(&href, link_base))),
        None => {
            warn!("No link found in {:?}", card.path);
            Ok(UnitOutcome::Skipped)
        }
    }
}
