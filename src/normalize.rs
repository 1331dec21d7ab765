use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::record::{CanonicalPhone, Phone, Record};
use crate::store;

static PRICE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d(?:[\d,]*\d)?(?:\.\d+)?").unwrap());

/// Cell values that mean "no phone" no matter how they are spelled.
const INVALID_ENTRIES: &[&str] = &["N/A", "NA", "", "NULL", "ERROR", "NONE", "NAN"];

/// Canonicalize a raw phone cell. Accepts exactly 10 digits, or 11 with a
/// leading `1` country code; everything else is unresolved.
pub fn normalize_phone(raw: &str) -> Phone {
    let raw = raw.trim();
    if INVALID_ENTRIES.iter().any(|e| e.eq_ignore_ascii_case(raw)) {
        return Phone::Unresolved;
    }
    if let Some(p) = CanonicalPhone::parse(raw) {
        return Phone::Canonical(p);
    }

    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let national = match digits.len() {
        10 => Some(digits.as_str()),
        11 if digits.starts_with('1') => Some(&digits[1..]),
        _ => None,
    };
    match national.and_then(CanonicalPhone::from_digits) {
        Some(p) => {
            debug!(raw, phone = %p, "standardized phone number");
            Phone::Canonical(p)
        }
        None => {
            debug!(raw, digits = digits.len(), "not a phone number");
            Phone::Unresolved
        }
    }
}

/// First numeric token of a price string. `,` between digits is a thousands
/// separator.
pub fn parse_price(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if INVALID_ENTRIES.iter().any(|e| e.eq_ignore_ascii_case(raw)) {
        return None;
    }
    let token = PRICE_RE.find(raw)?.as_str().replace(',', "");
    token.parse::<f64>().ok()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterPolicy {
    /// Keep only records whose phone is canonical.
    pub phone_required: bool,
    /// After link dedup, keep only the first record per canonical phone.
    pub dedup_by_phone: bool,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        FilterPolicy {
            phone_required: true,
            dedup_by_phone: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FilteredRecord {
    pub record: Record,
    pub price_numeric: Option<f64>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FilterReport {
    pub original: usize,
    pub after_link_dedup: usize,
    pub after_phone_dedup: usize,
    pub retained: usize,
}

fn normalize_record(mut record: Record) -> FilteredRecord {
    let phone = match record.phone.take() {
        Some(Phone::Canonical(p)) => normalize_phone(p.as_str()),
        _ => Phone::Unresolved,
    };
    record.phone = Some(phone);
    let price_numeric = record.fields.price.as_deref().and_then(parse_price);
    FilteredRecord {
        record,
        price_numeric,
    }
}

/// Normalize every record, collapse duplicates and apply the phone filter.
/// An empty result is valid.
pub fn normalize_and_filter(
    records: Vec<Record>,
    policy: &FilterPolicy,
) -> (Vec<FilteredRecord>, FilterReport) {
    let mut report = FilterReport {
        original: records.len(),
        ..Default::default()
    };

    let normalized: Vec<FilteredRecord> = records.into_par_iter().map(normalize_record).collect();

    let mut seen_links = HashSet::new();
    let mut rows: Vec<FilteredRecord> = normalized
        .into_iter()
        .filter(|r| seen_links.insert(r.record.link().to_string()))
        .collect();
    report.after_link_dedup = rows.len();
    info!(
        "Removed duplicate links: {} -> {} records",
        report.original, report.after_link_dedup
    );

    if policy.dedup_by_phone {
        let mut seen_phones = HashSet::new();
        rows.retain(|r| match r.record.phone.as_ref().and_then(Phone::canonical) {
            Some(p) => seen_phones.insert(p.clone()),
            None => true,
        });
        info!(
            "Removed duplicate phones: {} -> {} records",
            report.after_link_dedup,
            rows.len()
        );
    }
    report.after_phone_dedup = rows.len();

    if policy.phone_required {
        rows.retain(|r| r.record.phone.as_ref().is_some_and(Phone::is_canonical));
        info!(
            "Filtered by valid phone number format: {} -> {} records",
            report.after_phone_dedup,
            rows.len()
        );
    }
    report.retained = rows.len();

    if rows.is_empty() {
        warn!("No records left after filtering");
    } else {
        let sample: Vec<&str> = rows
            .iter()
            .take(5)
            .filter_map(|r| r.record.phone.as_ref().map(Phone::as_cell))
            .collect();
        info!(?sample, "Sample phone numbers");
    }

    (rows, report)
}

/// Write the filtered table: record store columns plus `price_numeric`.
/// The header is written even when there are no rows.
pub fn write_filtered(path: &Path, rows: &[FilteredRecord]) -> Result<()> {
    let attr_keys = store::attribute_keys(rows.iter().map(|r| &r.record));
    let mut writer = csv::Writer::from_path(path)?;

    let mut header = store::table_header(&attr_keys);
    header.push("price_numeric".to_string());
    writer.write_record(&header)?;

    for row in rows {
        let mut cells = store::record_cells(&row.record, &attr_keys);
        cells.push(row.price_numeric.map(|p| p.to_string()).unwrap_or_default());
        writer.write_record(&cells)?;
    }
    writer.flush().map_err(|e| PipelineError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(link: &str, phone: &str) -> Record {
        let mut r = Record::new(link).unwrap();
        r.phone = Some(normalize_phone(phone));
        r
    }

    #[test]
    fn phone_variants_canonicalize() {
        for raw in ["7147604016", "714-760-4016", "1-714-760-4016", "(714) 760-4016"] {
            assert_eq!(normalize_phone(raw).as_cell(), "(714) 760-4016", "input {raw}");
        }
    }

    #[test]
    fn non_phones_are_unresolved() {
        for raw in ["12345", "N/A", "", "ERROR", "na", "nan", "27147604016"] {
            assert_eq!(normalize_phone(raw), Phone::Unresolved, "input {raw}");
        }
    }

    #[test]
    fn price_takes_first_number() {
        assert_eq!(parse_price("$10,000"), Some(10000.0));
        assert_eq!(parse_price("$4,500.50 obo"), Some(4500.5));
        assert_eq!(parse_price("12.5k"), Some(12.5));
        assert_eq!(parse_price("call me"), None);
        assert_eq!(parse_price("N/A"), None);
    }

    #[test]
    fn filter_keeps_only_canonical_and_unique_links() {
        let records = vec![
            record("https://a/1", "(714) 760-4016"),
            record("https://a/1", "(800) 555-1234"),
            record("https://a/2", "N/A"),
            record("https://a/3", "213.456.7890"),
        ];
        let (rows, report) = normalize_and_filter(records, &FilterPolicy::default());
        let links: Vec<&str> = rows.iter().map(|r| r.record.link()).collect();
        assert_eq!(links, vec!["https://a/1", "https://a/3"]);
        assert_eq!(rows[0].record.phone.as_ref().unwrap().as_cell(), "(714) 760-4016");
        assert_eq!(report.after_link_dedup, 3);
        assert_eq!(report.retained, 2);
    }

    #[test]
    fn ten_record_scenario_keeps_six() {
        let raw = [
            "(714) 760-4016",
            "7147604016",
            "714-760-4016",
            "N/A",
            "(800) 555-1234",
            "12345",
            "(213) 456-7890",
            "NA",
            "(310) 123-4567",
            "ERROR",
        ];
        let records = raw
            .iter()
            .enumerate()
            .map(|(i, p)| record(&format!("https://a/{}", i), p))
            .collect();
        let (rows, report) = normalize_and_filter(records, &FilterPolicy::default());

        assert_eq!(report.original, 10);
        assert_eq!(report.retained, 6);
        let got: Vec<(&str, &str)> = rows
            .iter()
            .map(|r| (r.record.link(), r.record.phone.as_ref().unwrap().as_cell()))
            .collect();
        assert_eq!(
            got,
            vec![
                ("https://a/0", "(714) 760-4016"),
                ("https://a/1", "(714) 760-4016"),
                ("https://a/2", "(714) 760-4016"),
                ("https://a/4", "(800) 555-1234"),
                ("https://a/6", "(213) 456-7890"),
                ("https://a/8", "(310) 123-4567"),
            ]
        );
    }

    #[test]
    fn phone_dedup_is_opt_in() {
        let records = vec![
            record("https://a/1", "(714) 760-4016"),
            record("https://a/2", "7147604016"),
            record("https://a/3", "N/A"),
            record("https://a/4", "N/A"),
        ];
        let policy = FilterPolicy {
            phone_required: false,
            dedup_by_phone: true,
        };
        let (rows, _) = normalize_and_filter(records.clone(), &policy);
        assert_eq!(rows.len(), 3);

        let (rows, _) = normalize_and_filter(records, &FilterPolicy::default());
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn missing_phone_becomes_unresolved() {
        let r = Record::new("https://a/1").unwrap();
        let policy = FilterPolicy {
            phone_required: false,
            dedup_by_phone: false,
        };
        let (rows, _) = normalize_and_filter(vec![r], &policy);
        assert_eq!(rows[0].record.phone, Some(Phone::Unresolved));
    }

    #[test]
    fn empty_result_still_has_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filtered.csv");
        let (rows, report) =
            normalize_and_filter(vec![record("https://a/1", "12345")], &FilterPolicy::default());
        assert_eq!(report.retained, 0);
        write_filtered(&path, &rows).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text.trim_end(),
            "link,collected,scraped,processed,phone_number,title,price,location,post_date,price_numeric"
        );
    }
}
