use std::sync::{Arc, LazyLock};

use chrono::DateTime;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::normalize::normalize_phone;
use crate::reader::FieldReader;
use crate::record::{CanonicalPhone, Fields, Phone};

static SIDE_CHANNEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<!-- PHONE_NUMBER: ([\d()\-.\s]+) -->").unwrap());
static STRICT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\d{3}\)\s\d{3}-\d{4}").unwrap());
static LENIENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}").unwrap());
static ATTR_KEY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Phone resolution strategies, highest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Annotation written into the document by the detail fetch.
    SideChannel,
    /// The labeled contact element.
    Structural,
    /// `(DDD) DDD-DDDD` anywhere in the document.
    StrictPattern,
    /// Loose 3-3-4 digit groups with at least one separator.
    LenientPattern,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub phone: Phone,
    /// Tier that produced the candidate, valid or not.
    pub tier: Option<Tier>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub fields: Fields,
    pub resolution: Resolution,
    /// Set when the document could not be read; fields carry error markers.
    pub errored: bool,
}

/// Write the side-channel annotation at the top of a fetched document.
pub fn annotate(document: &str, phone: &CanonicalPhone) -> String {
    format!("<!-- PHONE_NUMBER: {} -->\n{}", phone, document)
}

/// A phone captured by an earlier stage beats anything re-parsed later.
pub fn merge_phone(prior: Option<&Phone>, found: Phone) -> Phone {
    match prior {
        Some(p @ Phone::Canonical(_)) => p.clone(),
        _ => found,
    }
}

/// Validated side-channel value, if the document carries one.
pub fn side_channel(document: &str) -> Option<CanonicalPhone> {
    let raw = SIDE_CHANNEL_RE.captures(document)?.get(1)?.as_str().trim();
    let phone = CanonicalPhone::parse(raw);
    if phone.is_none() {
        warn!("Found phone number in comment but not valid format: {}", raw);
    }
    phone
}

/// Turns fetched documents into fields and a single resolved phone.
#[derive(Clone)]
pub struct ExtractionEngine {
    reader: Arc<dyn FieldReader>,
}

impl ExtractionEngine {
    pub fn new(reader: Arc<dyn FieldReader>) -> Self {
        ExtractionEngine { reader }
    }

    /// Walk the tiers in order. A side-channel value that fails validation
    /// is dropped and the walk continues; for every later tier the first
    /// candidate found decides the outcome.
    pub fn resolve_phone(&self, document: &str) -> Resolution {
        if let Some(phone) = side_channel(document) {
            return resolved(Phone::Canonical(phone), Tier::SideChannel);
        }

        if let Some(text) = self.reader.contact_phone(document) {
            return match CanonicalPhone::parse(&text) {
                Some(phone) => resolved(Phone::Canonical(phone), Tier::Structural),
                None => {
                    warn!("Found phone element but not valid format: {}", text);
                    resolved(Phone::Unresolved, Tier::Structural)
                }
            };
        }

        if let Some(m) = STRICT_RE.find(document) {
            return resolved(normalize_phone(m.as_str()), Tier::StrictPattern);
        }

        // bare ten-digit runs are usually post ids, not phones
        if let Some(m) = LENIENT_RE
            .find_iter(document)
            .find(|m| m.as_str().chars().any(|c| !c.is_ascii_digit()))
        {
            return resolved(normalize_phone(m.as_str()), Tier::LenientPattern);
        }

        Resolution {
            phone: Phone::Unresolved,
            tier: None,
        }
    }

    /// Fields and phone for a readable document.
    pub fn extract(&self, document: &str) -> Extraction {
        let raw = self.reader.fields(document);
        let fields = Fields {
            title: raw.title,
            price: raw.price,
            location: raw.location,
            post_date: raw.posted_at.map(|d| normalize_post_date(&d)),
            attributes: raw
                .attributes
                .into_iter()
                .filter_map(|(k, v)| attribute_key(&k).map(|k| (k, v)))
                .collect(),
        };
        let resolution = self.resolve_phone(document);
        if let Some(phone) = resolution.phone.canonical() {
            debug!(tier = ?resolution.tier, "Extracted phone number: {}", phone);
        }
        Extraction {
            fields,
            resolution,
            errored: false,
        }
    }

    /// Like [`ExtractionEngine::extract`] but starting from raw file bytes.
    /// Unreadable content becomes an errored extraction instead of an error,
    /// since fetching again will not repair a file already on disk.
    pub fn extract_bytes(&self, name: &str, bytes: &[u8]) -> Extraction {
        match decode_document(name, bytes) {
            Ok(document) => self.extract(document),
            Err(e) => {
                warn!(document = name, kind = e.kind(), "{}", e);
                Extraction {
                    fields: Fields::errored(),
                    resolution: Resolution {
                        phone: Phone::Unresolved,
                        tier: None,
                    },
                    errored: true,
                }
            }
        }
    }
}

fn resolved(phone: Phone, tier: Tier) -> Resolution {
    Resolution {
        phone,
        tier: Some(tier),
    }
}

fn decode_document<'a>(name: &str, bytes: &'a [u8]) -> Result<&'a str> {
    let text = std::str::from_utf8(bytes).map_err(|e| PipelineError::ContentParse {
        source_name: name.to_string(),
        reason: format!("not utf-8: {}", e),
    })?;
    if text.trim().is_empty() {
        return Err(PipelineError::ContentParse {
            source_name: name.to_string(),
            reason: "empty document".to_string(),
        });
    }
    Ok(text)
}

/// `YYYY-MM-DD HH:MM` when the timestamp parses, otherwise the raw value.
fn normalize_post_date(raw: &str) -> String {
    let raw = raw.trim();
    DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z")
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|_| raw.to_string())
}

/// `Title Status` -> `title_status`.
fn attribute_key(label: &str) -> Option<String> {
    let key = ATTR_KEY_RE
        .replace_all(&label.to_lowercase(), "_")
        .trim_matches('_')
        .to_string();
    (!key.is_empty()).then_some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::ListingReader;

    fn engine() -> ExtractionEngine {
        ExtractionEngine::new(Arc::new(ListingReader))
    }

    fn listing() -> String {
        std::fs::read_to_string("tests/fixtures/listing.html").unwrap()
    }

    fn phone(s: &str) -> Phone {
        Phone::Canonical(CanonicalPhone::parse(s).unwrap())
    }

    #[test]
    fn side_channel_beats_structural() {
        let doc = annotate(&listing(), &CanonicalPhone::parse("(714) 760-4016").unwrap());
        let r = engine().resolve_phone(&doc);
        assert_eq!(r.phone, phone("(714) 760-4016"));
        assert_eq!(r.tier, Some(Tier::SideChannel));
    }

    #[test]
    fn invalid_side_channel_falls_through() {
        let doc = format!("<!-- PHONE_NUMBER: 714.760.401 -->\n{}", listing());
        let r = engine().resolve_phone(&doc);
        assert_eq!(r.phone, phone("(213) 555-0199"));
        assert_eq!(r.tier, Some(Tier::Structural));
    }

    #[test]
    fn invalid_structural_candidate_preempts_later_tiers() {
        let doc = r#"<div class="reply-content-phone"><a href="tel:1">call 555-0199</a></div>
            <p>or (800) 555-1234</p>"#;
        let r = engine().resolve_phone(doc);
        assert_eq!(r.phone, Phone::Unresolved);
        assert_eq!(r.tier, Some(Tier::Structural));
    }

    #[test]
    fn strict_pattern_in_body() {
        let doc = "<p>text me at (949) 555-0100 or 949.555.0111</p>";
        let r = engine().resolve_phone(doc);
        assert_eq!(r.phone, phone("(949) 555-0100"));
        assert_eq!(r.tier, Some(Tier::StrictPattern));
    }

    #[test]
    fn lenient_pattern_skips_bare_digit_runs() {
        let doc = "<p>post id: 7712345001</p><p>call 949.555.0111 after 5</p>";
        let r = engine().resolve_phone(doc);
        assert_eq!(r.phone, phone("(949) 555-0111"));
        assert_eq!(r.tier, Some(Tier::LenientPattern));
    }

    #[test]
    fn nothing_found_is_unresolved() {
        let r = engine().resolve_phone("<p>post id: 7712345001</p>");
        assert_eq!(r.phone, Phone::Unresolved);
        assert_eq!(r.tier, None);
    }

    #[test]
    fn full_extraction_from_listing() {
        let x = engine().extract(&listing());
        assert!(!x.errored);
        assert_eq!(x.fields.title.as_deref(), Some("2015 Toyota Camry SE"));
        assert_eq!(x.fields.price.as_deref(), Some("$10,500"));
        assert_eq!(x.fields.post_date.as_deref(), Some("2024-03-01 12:34"));
        assert_eq!(x.fields.attributes.get("odometer").map(String::as_str), Some("120000"));
        assert_eq!(
            x.fields.attributes.get("title_status").map(String::as_str),
            Some("clean")
        );
        assert_eq!(
            x.fields.attributes.get("transmission").map(String::as_str),
            Some("automatic")
        );
        assert_eq!(x.resolution.phone, phone("(213) 555-0199"));
    }

    #[test]
    fn unreadable_bytes_become_error_markers() {
        let x = engine().extract_bytes("listing_1.html", &[0xff, 0xfe, 0x00]);
        assert!(x.errored);
        assert_eq!(x.fields.title.as_deref(), Some("ERROR"));
        assert_eq!(x.resolution.phone, Phone::Unresolved);

        assert!(engine().extract_bytes("blank.html", b"  \n ").errored);
    }

    #[test]
    fn earlier_capture_overrides_document() {
        let prior = phone("(714) 760-4016");
        assert_eq!(merge_phone(Some(&prior), phone("(213) 555-0199")), prior);
        assert_eq!(
            merge_phone(Some(&Phone::Unresolved), phone("(213) 555-0199")),
            phone("(213) 555-0199")
        );
        assert_eq!(merge_phone(None, Phone::Unresolved), Phone::Unresolved);
    }
}
