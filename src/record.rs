use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

static CANONICAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\(\d{3}\) \d{3}-\d{4}$").unwrap());

/// Rendered form of [`Phone::Unresolved`].
pub const UNRESOLVED: &str = "N/A";

/// A phone number in `(DDD) DDD-DDDD` form. Only constructible from input
/// that already satisfies the pattern or from exactly ten digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalPhone(String);

impl CanonicalPhone {
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        CANONICAL_RE
            .is_match(text)
            .then(|| CanonicalPhone(text.to_string()))
    }

    pub fn from_digits(digits: &str) -> Option<Self> {
        if digits.len() != 10 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(CanonicalPhone(format!(
            "({}) {}-{}",
            &digits[0..3],
            &digits[3..6],
            &digits[6..10]
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalPhone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolved phone state of a record. `None` on the record means nobody has
/// looked yet; `Unresolved` means a lookup ran and produced nothing usable,
/// whether the source lacked a number or carried a malformed one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phone {
    Canonical(CanonicalPhone),
    Unresolved,
}

impl Phone {
    pub fn canonical(&self) -> Option<&CanonicalPhone> {
        match self {
            Phone::Canonical(p) => Some(p),
            Phone::Unresolved => None,
        }
    }

    pub fn is_canonical(&self) -> bool {
        matches!(self, Phone::Canonical(_))
    }

    pub fn as_cell(&self) -> &str {
        match self {
            Phone::Canonical(p) => p.as_str(),
            Phone::Unresolved => UNRESOLVED,
        }
    }
}

impl fmt::Display for Phone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_cell())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFlag {
    Detailed,
    Extracted,
}

/// Listing fields read from a detail document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields {
    pub title: Option<String>,
    pub price: Option<String>,
    pub location: Option<String>,
    pub post_date: Option<String>,
    /// Keyed by snake_case attribute name, without the `attr_` column prefix.
    pub attributes: BTreeMap<String, String>,
}

impl Fields {
    /// Marker fields for a document that could not be parsed.
    pub fn errored() -> Self {
        Fields {
            title: Some("ERROR".to_string()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.price.is_none()
            && self.location.is_none()
            && self.post_date.is_none()
            && self.attributes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    link: String,
    pub collected: bool,
    pub detailed: bool,
    pub extracted: bool,
    pub phone: Option<Phone>,
    pub fields: Fields,
}

impl Record {
    /// Returns `None` for a blank link; identity is never empty.
    pub fn new(link: &str) -> Option<Self> {
        let link = link.trim();
        if link.is_empty() {
            return None;
        }
        Some(Record {
            link: link.to_string(),
            collected: false,
            detailed: false,
            extracted: false,
            phone: None,
            fields: Fields::default(),
        })
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn flag(&self, flag: StatusFlag) -> bool {
        match flag {
            StatusFlag::Detailed => self.detailed,
            StatusFlag::Extracted => self.extracted,
        }
    }

    /// Applies an update, returning whether anything changed.
    pub fn apply(&mut self, update: &RecordUpdate) -> bool {
        let before = self.clone();
        if let Some(v) = update.detailed {
            self.detailed = v;
        }
        if let Some(v) = update.extracted {
            self.extracted = v;
        }
        if let Some(phone) = &update.phone {
            self.phone = Some(phone.clone());
        }
        if let Some(fields) = &update.fields {
            self.fields = fields.clone();
        }
        *self != before
    }
}

/// Partial update produced by a unit of work and merged by identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    pub detailed: Option<bool>,
    pub extracted: Option<bool>,
    pub phone: Option<Phone>,
    pub fields: Option<Fields>,
}

impl RecordUpdate {
    pub fn mark(flag: StatusFlag) -> Self {
        let mut update = RecordUpdate::default();
        match flag {
            StatusFlag::Detailed => update.detailed = Some(true),
            StatusFlag::Extracted => update.extracted = Some(true),
        }
        update
    }

    pub fn with_phone(mut self, phone: Option<Phone>) -> Self {
        self.phone = phone;
        self
    }

    pub fn with_fields(mut self, fields: Fields) -> Self {
        self.fields = Some(fields);
        self
    }
}
