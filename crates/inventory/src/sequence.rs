//! Document numbering scopes, formatted numbers, and gap analysis.
//!
//! Counters are per `(business, location, local calendar day)`. A consumed
//! number is never handed out again, but the document it was meant for may
//! never be committed, so numbering is allowed to have holes. `find_gaps`
//! turns those holes into an explicit, thresholded report.

use core::str::FromStr;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use stockflow_core::{BusinessId, DomainError, LocationId, ValueObject};

/// Counter scope: one business, one location, one local calendar day.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceScope {
    pub business_id: BusinessId,
    pub location_id: LocationId,
    pub date: NaiveDate,
}

impl SequenceScope {
    pub fn new(business_id: BusinessId, location_id: LocationId, date: NaiveDate) -> Self {
        Self {
            business_id,
            location_id,
            date,
        }
    }

    /// Scope for an instant, using the location's UTC offset to pick the day.
    pub fn at(
        business_id: BusinessId,
        location_id: LocationId,
        at: DateTime<Utc>,
        offset: FixedOffset,
    ) -> Self {
        Self::new(business_id, location_id, at.with_timezone(&offset).date_naive())
    }

    pub fn year(&self) -> i32 {
        self.date.year()
    }

    pub fn month(&self) -> u32 {
        self.date.month()
    }

    pub fn day(&self) -> u32 {
        self.date.day()
    }
}

impl ValueObject for SequenceScope {}

/// Which kind of document a number is issued for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Invoice,
    Transfer,
    Correction,
}

impl DocumentKind {
    pub fn prefix(self) -> &'static str {
        match self {
            DocumentKind::Invoice => "INV",
            DocumentKind::Transfer => "TRF",
            DocumentKind::Correction => "COR",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        [
            DocumentKind::Invoice,
            DocumentKind::Transfer,
            DocumentKind::Correction,
        ]
        .into_iter()
        .find(|k| k.prefix() == prefix)
    }
}

/// Human-readable document number, e.g. `TRF-MAIN-20261019-0007`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentNumber {
    pub kind: DocumentKind,
    pub location_code: String,
    pub date: NaiveDate,
    pub counter: u64,
}

impl DocumentNumber {
    pub fn new(
        kind: DocumentKind,
        location_code: &str,
        date: NaiveDate,
        counter: u64,
    ) -> Result<Self, DomainError> {
        let code = location_code.trim();
        if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(DomainError::validation(format!(
                "location code must be non-empty ASCII alphanumeric, got '{location_code}'"
            )));
        }
        if counter == 0 {
            return Err(DomainError::validation("sequence counters start at 1"));
        }
        Ok(Self {
            kind,
            location_code: code.to_ascii_uppercase(),
            date,
            counter,
        })
    }
}

impl core::fmt::Display for DocumentNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}-{}-{}-{:04}",
            self.kind.prefix(),
            self.location_code,
            self.date.format("%Y%m%d"),
            self.counter
        )
    }
}

impl FromStr for DocumentNumber {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DomainError::validation(format!("malformed document number '{s}'"));

        let mut parts = s.split('-');
        let (Some(prefix), Some(code), Some(date), Some(counter), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(invalid());
        };

        let kind = DocumentKind::from_prefix(prefix).ok_or_else(invalid)?;
        let date = NaiveDate::parse_from_str(date, "%Y%m%d").map_err(|_| invalid())?;
        let counter = counter.parse::<u64>().map_err(|_| invalid())?;
        DocumentNumber::new(kind, code, date, counter)
    }
}

/// Holes (and defects) in the numbers actually used within one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GapReport {
    pub scope: SequenceScope,
    /// Counter value at audit time: every number up to here was handed out.
    pub issued_through: u64,
    /// Handed out but never seen on a committed document.
    pub missing: Vec<u64>,
    /// Length of the longest run of consecutive missing numbers.
    pub largest_run: u64,
    /// Seen on more than one document. Always a defect.
    pub duplicates: Vec<u64>,
    /// Seen on a document but above the counter. Always a defect.
    pub beyond_counter: Vec<u64>,
    pub max_tolerated_gap: u64,
    pub exceeds_threshold: bool,
}

impl GapReport {
    /// True when there are no duplicate or out-of-range numbers (gaps are fine).
    pub fn is_sound(&self) -> bool {
        self.duplicates.is_empty() && self.beyond_counter.is_empty()
    }
}

/// Compare the numbers used by committed documents against the counter.
///
/// `exceeds_threshold` is set when more than `max_tolerated_gap` numbers are
/// missing from the scope.
pub fn find_gaps(
    scope: SequenceScope,
    issued_through: u64,
    used: &[u64],
    max_tolerated_gap: u64,
) -> GapReport {
    let mut sorted = used.to_vec();
    sorted.sort_unstable();

    let mut duplicates: Vec<u64> = sorted
        .windows(2)
        .filter(|w| w[0] == w[1])
        .map(|w| w[0])
        .collect();
    duplicates.dedup();
    sorted.dedup();

    let beyond_counter: Vec<u64> = sorted
        .iter()
        .copied()
        .filter(|n| *n == 0 || *n > issued_through)
        .collect();

    let mut missing = Vec::new();
    let mut largest_run = 0u64;
    let mut run = 0u64;
    for n in 1..=issued_through {
        if sorted.binary_search(&n).is_ok() {
            run = 0;
        } else {
            missing.push(n);
            run += 1;
            largest_run = largest_run.max(run);
        }
    }

    let exceeds_threshold = missing.len() as u64 > max_tolerated_gap;

    GapReport {
        scope,
        issued_through,
        missing,
        largest_run,
        duplicates,
        beyond_counter,
        max_tolerated_gap,
        exceeds_threshold,
    }
}
