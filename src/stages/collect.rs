use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::StageContext;
use crate::error::{PipelineError, Result};
use crate::fetch::Fetcher;
use crate::reader::FieldReader;
use crate::runner::{Keyed, StageSummary, UnitOutcome};
use crate::stage::Stage;
use crate::utils::{card_name, page_url};

/// One search results page to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTask {
    pub offset: usize,
    pub url: String,
}

impl Keyed for PageTask {
    fn key(&self) -> &str {
        &self.url
    }
}

/// Decide which result pages to visit from the count on the base search
/// page. An unreadable count falls back to the configured default.
pub async fn plan_pages(
    ctx: &StageContext,
    base_url: &str,
    max_pages: Option<usize>,
    cancel: &CancellationToken,
) -> Vec<PageTask> {
    let page_size = ctx.settings.page_size;
    let fallback = ctx.settings.default_total_pages;
    let fetcher = &ctx.fetcher;

    let fetched = ctx
        .settings
        .retry_policy()
        .run("plan pages", cancel, || async move {
            fetcher.fetch(base_url).await.into_result(base_url)
        })
        .await;

    let mut total_pages = match fetched {
        Ok(page) => match ctx.reader.total_count(&page) {
            Some(total) => {
                info!(total, "Search reports {} results", total);
                total.div_ceil(page_size)
            }
            None => {
                warn!("Could not parse total count, using default");
                fallback
            }
        },
        Err(e) => {
            warn!("Could not load base search page ({}), using default", e);
            fallback
        }
    };
    if let Some(max) = max_pages {
        total_pages = total_pages.min(max);
    }
    info!("Planning to scrape {} pages", total_pages);

    (0..total_pages)
        .map(|i| {
            let offset = i * page_size;
            PageTask {
                offset,
                url: page_url(base_url, offset),
            }
        })
        .collect()
}

/// Stage 1: save every listing card on every planned page as its own file.
pub async fn run(
    ctx: &StageContext,
    base_url: &str,
    max_pages: Option<usize>,
    cancel: CancellationToken,
) -> Result<StageSummary> {
    let pages = plan_pages(ctx, base_url, max_pages, &cancel).await;
    let cards_dir = ctx.settings.cards_dir();
    let fetcher = Arc::clone(&ctx.fetcher);
    let reader = Arc::clone(&ctx.reader);

    let mut cards = 0usize;
    let summary = ctx
        .runner(Stage::Collect, cancel)
        .with_pacing(ctx.settings.page_pacing())
        .run(
            pages,
            move |page: PageTask| {
                let fetcher = Arc::clone(&fetcher);
                let reader = Arc::clone(&reader);
                let dir = cards_dir.clone();
                async move { save_cards(fetcher.as_ref(), reader.as_ref(), &dir, page).await }
            },
            |batch| {
                cards += batch.iter().map(|(_, n)| n).sum::<usize>();
                Ok(())
            },
        )
        .await?;

    info!("Parallel scraping complete. Total listings: {}", cards);
    Ok(summary)
}

async fn save_cards(
    fetcher: &dyn Fetcher,
    reader: &dyn FieldReader,
    dir: &Path,
    page: PageTask,
) -> Result<UnitOutcome<usize>> {
    let content = fetcher.fetch(&page.url).await.into_result(&page.url)?;
    let cards = reader.listing_cards(&content);
    if cards.is_empty() {
        info!(offset = page.offset, "No listings found on page");
        return Ok(UnitOutcome::Done(0));
    }
    info!(offset = page.offset, "Found {} listings on page", cards.len());

    for (index, card) in cards.iter().enumerate() {
        let path = dir.join(card_name(card.pid.as_deref(), page.offset, index));
        tokio::fs::write(&path, &card.html)
            .await
            .map_err(|e| PipelineError::io(&path, e))?;
    }
    Ok(UnitOutcome::Done(cards.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::fake::ScriptedFetcher;
    use crate::stages::testing::{context, fixture, settings};

    const BASE: &str = "https://losangeles.craigslist.org/search/oc/cto#search=2~gallery~0";

    #[tokio::test]
    async fn pages_planned_from_total_count() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new().page(BASE, fixture("search.html")));
        let ctx = context(settings(dir.path()), fetcher, true);

        let pages = plan_pages(&ctx, BASE, None, &CancellationToken::new()).await;
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[2].offset, 240);
        assert_eq!(
            pages[1].url,
            "https://losangeles.craigslist.org/search/oc/cto?s=120#search=2~gallery~0"
        );

        let capped = plan_pages(&ctx, BASE, Some(2), &CancellationToken::new()).await;
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn unreadable_count_uses_default() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new().page(BASE, "<html><body></body></html>"));
        let ctx = context(settings(dir.path()), fetcher, true);
        let pages = plan_pages(&ctx, BASE, None, &CancellationToken::new()).await;
        assert_eq!(pages.len(), 10);

        // base page unreachable: still falls back, capped
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(settings(dir.path()), Arc::new(ScriptedFetcher::new()), true);
        let pages = plan_pages(&ctx, BASE, Some(4), &CancellationToken::new()).await;
        assert_eq!(pages.len(), 4);
    }

    #[tokio::test]
    async fn cards_written_per_listing() {
        let dir = tempfile::tempdir().unwrap();
        let first = page_url(BASE, 0);
        let fetcher = Arc::new(
            ScriptedFetcher::new()
                .page(BASE, fixture("search.html"))
                .page(&first, fixture("search.html")),
        );
        let ctx = context(settings(dir.path()), fetcher, true);

        let summary = run(&ctx, BASE, Some(1), CancellationToken::new()).await.unwrap();
        assert_eq!(summary.succeeded, 1);

        let cards = ctx.settings.cards_dir();
        assert!(cards.join("card_7712345001.html").exists());
        assert!(cards.join("card_7712345002.html").exists());
        assert!(cards.join("card_0_2.html").exists());
        let card = std::fs::read_to_string(cards.join("card_7712345002.html")).unwrap();
        assert!(card.contains("/oc/cto/d/irvine-2012-honda-civic/7712345002.html"));
    }
}
