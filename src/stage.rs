use std::fmt;

use crate::error::{PipelineError, Result};
use crate::record::StatusFlag;

/// Pipeline steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Collect = 1,
    ExtractLinks = 2,
    FetchDetails = 3,
    ExtractFields = 4,
    Filter = 5,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Collect,
        Stage::ExtractLinks,
        Stage::FetchDetails,
        Stage::ExtractFields,
        Stage::Filter,
    ];

    pub fn from_number(n: u8) -> Result<Stage> {
        Stage::ALL
            .into_iter()
            .find(|s| s.number() == n)
            .ok_or_else(|| {
                PipelineError::Configuration(format!(
                    "invalid stage {}; must be between 1 and 5",
                    n
                ))
            })
    }

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Collect => "collect",
            Stage::ExtractLinks => "extract_links",
            Stage::FetchDetails => "fetch_details",
            Stage::ExtractFields => "extract_fields",
            Stage::Filter => "filter",
        }
    }

    /// Status flag that gates this stage on resume. Stages 1 and 2 work from
    /// files rather than records and ignore resume: known links are left
    /// as they are.
    pub fn flag(self) -> Option<StatusFlag> {
        match self {
            Stage::FetchDetails => Some(StatusFlag::Detailed),
            Stage::ExtractFields => Some(StatusFlag::Extracted),
            Stage::Collect | Stage::ExtractLinks | Stage::Filter => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {} ({})", self.number(), self.name())
    }
}

/// Validate a requested stage list. Order is always ascending and repeats
/// collapse; stages can be skipped but never reordered.
pub fn parse_stages(requested: &[u8]) -> Result<Vec<Stage>> {
    let mut stages = requested
        .iter()
        .map(|&n| Stage::from_number(n))
        .collect::<Result<Vec<_>>>()?;
    if stages.is_empty() {
        return Err(PipelineError::Configuration("no stages requested".into()));
    }
    stages.sort();
    stages.dedup();
    Ok(stages)
}
