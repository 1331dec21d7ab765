use std::time::Duration;

use sha2::{Digest, Sha256};

/// Search page URL for a result offset: `s=<offset>` is appended to the
/// query and any `#fragment` is kept at the end.
pub fn page_url(base: &str, offset: usize) -> String {
    let (head, fragment) = match base.split_once('#') {
        Some((head, fragment)) => (head, Some(fragment)),
        None => (base, None),
    };
    let sep = if head.contains('?') { '&' } else { '?' };
    match fragment {
        Some(fragment) => format!("{}{}s={}#{}", head, sep, offset, fragment),
        None => format!("{}{}s={}", head, sep, offset),
    }
}

/// Turn a card href into an absolute link.
pub fn absolutize(href: &str, link_base: &str) -> String {
    let href = href.trim();
    if let Some(rest) = href.strip_prefix("//") {
        format!("https://{}", rest)
    } else if href.starts_with('/') {
        format!("{}{}", link_base.trim_end_matches('/'), href)
    } else {
        href.to_string()
    }
}

/// Stable file name for a listing's fetched document. The last path segment
/// keeps it readable; a digest of the whole link keeps it unique per record.
pub fn document_name(link: &str) -> String {
    let link = link.trim();
    let path = link.split(['?', '#']).next().unwrap_or(link);
    let tail = path.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    let tail = sanitize(tail.strip_suffix(".html").unwrap_or(tail));
    let digest = hex::encode(Sha256::digest(link.as_bytes()));
    if tail.is_empty() {
        format!("listing_{}.html", &digest[..16])
    } else {
        format!("listing_{}_{}.html", tail, &digest[..16])
    }
}

/// File name for a search result card.
pub fn card_name(pid: Option<&str>, offset: usize, index: usize) -> String {
    match pid.map(sanitize).filter(|p| !p.is_empty()) {
        Some(pid) => format!("card_{}.html", pid),
        None => format!("card_{}_{}.html", offset, index),
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

/// Run time for the closing summary: `4.2s`, `3m 07s`, `1h 02m 05s`.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (hours, minutes, seconds) = (total / 3600, total / 60 % 60, total % 60);
    match (hours, minutes) {
        (0, 0) => format!("{:.1}s", d.as_secs_f64()),
        (0, _) => format!("{}m {:02}s", minutes, seconds),
        _ => format!("{}h {:02}m {:02}s", hours, minutes, seconds),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_urls_keep_query_and_fragment() {
        assert_eq!(
            page_url("https://sfbay.craigslist.org/search/cta", 120),
            "https://sfbay.craigslist.org/search/cta?s=120"
        );
        assert_eq!(
            page_url("https://sfbay.craigslist.org/search/cta?purveyor=owner", 0),
            "https://sfbay.craigslist.org/search/cta?purveyor=owner&s=0"
        );
        assert_eq!(
            page_url("https://sfbay.craigslist.org/search/cta?purveyor=owner#search=2~gallery~0", 240),
            "https://sfbay.craigslist.org/search/cta?purveyor=owner&s=240#search=2~gallery~0"
        );
        assert_eq!(
            page_url("https://sfbay.craigslist.org/search/cta#search=1", 120),
            "https://sfbay.craigslist.org/search/cta?s=120#search=1"
        );
    }

    #[test]
    fn hrefs_become_absolute() {
        let base = "https://craigslist.org";
        assert_eq!(
            absolutize("//sfbay.craigslist.org/a/1.html", base),
            "https://sfbay.craigslist.org/a/1.html"
        );
        assert_eq!(absolutize("/oc/cto/2.html", base), "https://craigslist.org/oc/cto/2.html");
        assert_eq!(absolutize("https://x.org/3.html", base), "https://x.org/3.html");
    }

    #[test]
    fn document_names_are_stable_and_safe() {
        let camry = "https://orangecounty.craigslist.org/cto/d/anaheim-camry/7712345001.html";
        let name = document_name(camry);
        assert!(name.starts_with("listing_7712345001_"));
        assert!(name.ends_with(".html"));
        assert_eq!(name.len(), "listing_7712345001_.html".len() + 16);
        assert_eq!(document_name(camry), name);
        assert_eq!(document_name(&format!(" {} ", camry)), name);

        let root = document_name("https://x.org/");
        assert!(root.starts_with("listing_x_org_"));
        assert!(document_name("https://x.org/a/b?id=3")
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-.".contains(c)));
        assert_eq!(card_name(Some("7712345001"), 0, 0), "card_7712345001.html");
        assert_eq!(card_name(None, 120, 4), "card_120_4.html");
    }

    #[test]
    fn shared_tails_get_distinct_documents() {
        assert_ne!(
            document_name("https://x.org/item?id=1"),
            document_name("https://x.org/item?id=2")
        );
        assert_ne!(
            document_name("https://sfbay.craigslist.org/cto/d/a/7712345001.html"),
            document_name("https://losangeles.craigslist.org/cto/d/a/7712345001.html")
        );
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(Duration::from_millis(2500)), "2.5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 05s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 02m 05s");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h 00m 00s");
    }
}
