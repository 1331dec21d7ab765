use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};

static TOTAL_COUNT: LazyLock<Selector> = LazyLock::new(|| sel(".totalcount"));
static GALLERY_CARD: LazyLock<Selector> = LazyLock::new(|| sel(".gallery-card"));
static RESULT_ROW: LazyLock<Selector> =
    LazyLock::new(|| sel(".result-row, .cl-static-search-result"));
static ANCHOR: LazyLock<Selector> = LazyLock::new(|| sel("a[href]"));
static CONTACT_PHONE: LazyLock<Selector> =
    LazyLock::new(|| sel(".reply-content-phone a[href^='tel:']"));
static REPLY_BUTTON: LazyLock<Selector> = LazyLock::new(|| sel(".reply-button"));
static TITLE: LazyLock<Selector> = LazyLock::new(|| sel("#titletextonly"));
static PRICE: LazyLock<Selector> = LazyLock::new(|| sel(".price"));
static LOCATION: LazyLock<Selector> = LazyLock::new(|| sel(".postingtitletext small"));
static MAP_ADDRESS: LazyLock<Selector> = LazyLock::new(|| sel(".mapaddress"));
static POSTED_AT: LazyLock<Selector> =
    LazyLock::new(|| sel("#display-date time[datetime], .postinginfo time[datetime]"));
static ANY_TIME: LazyLock<Selector> = LazyLock::new(|| sel("time[datetime]"));
static ATTR_GROUP: LazyLock<Selector> = LazyLock::new(|| sel(".attrgroup"));
static ATTR_PAIR: LazyLock<Selector> = LazyLock::new(|| sel(".attr"));
static ATTR_LABEL: LazyLock<Selector> = LazyLock::new(|| sel(".labl"));
static ATTR_VALUE: LazyLock<Selector> = LazyLock::new(|| sel(".valu"));
static SPAN: LazyLock<Selector> = LazyLock::new(|| sel("span"));

fn sel(css: &str) -> Selector {
    Selector::parse(css).unwrap()
}

/// One search result card, as an HTML fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingCard {
    pub pid: Option<String>,
    pub html: String,
}

/// Raw field values found in a detail page, before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentFields {
    pub title: Option<String>,
    pub price: Option<String>,
    pub location: Option<String>,
    pub posted_at: Option<String>,
    pub attributes: Vec<(String, String)>,
}

/// Markup-to-field selectors. Swappable so the pipeline does not depend on
/// one site's layout.
pub trait FieldReader: Send + Sync {
    /// Total result count advertised on a search page.
    fn total_count(&self, page: &str) -> Option<usize>;
    fn listing_cards(&self, page: &str) -> Vec<ListingCard>;
    /// Raw `href` of the card's first link.
    fn card_link(&self, card: &str) -> Option<String>;
    /// Text of the labeled contact-phone element, if the page has one.
    fn contact_phone(&self, document: &str) -> Option<String>;
    /// Target of the page's reply/contact affordance.
    fn reveal_link(&self, document: &str) -> Option<String>;
    fn fields(&self, document: &str) -> DocumentFields;
}

/// CSS-selector reader for classified-listing markup.
#[derive(Debug, Default, Clone, Copy)]
pub struct ListingReader;

impl FieldReader for ListingReader {
    fn total_count(&self, page: &str) -> Option<usize> {
        let html = Html::parse_document(page);
        let text = first_text(&html, &TOTAL_COUNT)?;
        text.replace(',', "").parse().ok()
    }

    fn listing_cards(&self, page: &str) -> Vec<ListingCard> {
        let html = Html::parse_document(page);
        let mut cards: Vec<ElementRef> = html.select(&GALLERY_CARD).collect();
        if cards.is_empty() {
            cards = html.select(&RESULT_ROW).collect();
        }
        cards
            .into_iter()
            .map(|el| ListingCard {
                pid: el
                    .value()
                    .attr("data-pid")
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string),
                html: el.html(),
            })
            .collect()
    }

    fn card_link(&self, card: &str) -> Option<String> {
        let html = Html::parse_fragment(card);
        html.select(&ANCHOR)
            .filter_map(|a| a.value().attr("href"))
            .map(str::trim)
            .find(|href| !href.is_empty())
            .map(str::to_string)
    }

    fn contact_phone(&self, document: &str) -> Option<String> {
        let html = Html::parse_document(document);
        first_text(&html, &CONTACT_PHONE)
    }

    fn reveal_link(&self, document: &str) -> Option<String> {
        let html = Html::parse_document(document);
        html.select(&REPLY_BUTTON).find_map(|el| {
            el.value()
                .attr("data-href")
                .or_else(|| el.value().attr("href"))
                .map(str::trim)
                .filter(|href| !href.is_empty() && !href.starts_with('#'))
                .map(str::to_string)
        })
    }

    fn fields(&self, document: &str) -> DocumentFields {
        let html = Html::parse_document(document);

        let location = first_text(&html, &LOCATION)
            .or_else(|| first_text(&html, &MAP_ADDRESS))
            .map(|l| l.trim_matches(|c: char| c == '(' || c == ')').trim().to_string())
            .filter(|l| !l.is_empty());

        let posted_at = html
            .select(&POSTED_AT)
            .chain(html.select(&ANY_TIME))
            .find_map(|el| el.value().attr("datetime"))
            .map(|d| d.trim().to_string());

        DocumentFields {
            title: first_text(&html, &TITLE),
            price: first_text(&html, &PRICE),
            location,
            posted_at,
            attributes: attributes(&html),
        }
    }
}

fn attributes(html: &Html) -> Vec<(String, String)> {
    let mut found = Vec::new();
    for group in html.select(&ATTR_GROUP) {
        let pairs: Vec<ElementRef> = group.select(&ATTR_PAIR).collect();
        if !pairs.is_empty() {
            for pair in pairs {
                let label = pair.select(&ATTR_LABEL).next().map(clean_text);
                let value = pair.select(&ATTR_VALUE).next().map(clean_text);
                if let (Some(label), Some(value)) = (label, value) {
                    found.push((label.trim_end_matches(':').trim().to_string(), value));
                }
            }
            continue;
        }
        // older layout: <span>odometer: <b>120000</b></span>
        for span in group.select(&SPAN) {
            let text = clean_text(span);
            if let Some((label, value)) = text.split_once(':') {
                let (label, value) = (label.trim(), value.trim());
                if !label.is_empty() && !value.is_empty() {
                    found.push((label.to_string(), value.to_string()));
                }
            }
        }
    }
    found
}

fn first_text(html: &Html, selector: &Selector) -> Option<String> {
    html.select(selector)
        .map(clean_text)
        .find(|t| !t.is_empty())
}

fn clean_text(el: ElementRef) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
