//! Engine configuration.
//!
//! Everything has a working default; `from_env` overlays `STOCKFLOW_*`
//! variables on top of those defaults. Per-business overrides are set
//! programmatically (or deserialized) since they do not fit flat env vars.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use stockflow_auth::{DutyRule, Role};
use stockflow_core::{BusinessId, LocationId};
use stockflow_inventory::{CorrectionStatus, StockPolicy, TransferStatus};

use crate::retry::RetryPolicy;

/// Role that bypasses separation-of-duties rules unless configured otherwise.
pub const DEFAULT_SOD_EXEMPT_ROLE: &str = "inventory_supervisor";

/// Rules a business applies to its inventory documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusinessPolicy {
    /// Refuse postings that would take a dimension below zero.
    pub strict_non_negative: bool,
    /// Pairs of transfer statuses whose actors must differ.
    pub transfer_duties: Vec<DutyRule<TransferStatus>>,
    /// Pairs of correction statuses whose actors must differ.
    pub correction_duties: Vec<DutyRule<CorrectionStatus>>,
    pub sod_exempt_roles: Vec<Role>,
}

impl Default for BusinessPolicy {
    fn default() -> Self {
        Self {
            strict_non_negative: false,
            transfer_duties: vec![
                DutyRule::new(TransferStatus::Draft, TransferStatus::Approved),
                DutyRule::new(TransferStatus::Sent, TransferStatus::Completed),
            ],
            correction_duties: vec![DutyRule::new(
                CorrectionStatus::Pending,
                CorrectionStatus::Approved,
            )],
            sod_exempt_roles: vec![Role::from_static(DEFAULT_SOD_EXEMPT_ROLE)],
        }
    }
}

impl BusinessPolicy {
    pub fn stock_policy(&self) -> StockPolicy {
        StockPolicy {
            strict_non_negative: self.strict_non_negative,
        }
    }

    pub fn with_strict_non_negative(mut self, strict: bool) -> Self {
        self.strict_non_negative = strict;
        self
    }

    pub fn with_transfer_duties(mut self, duties: Vec<DutyRule<TransferStatus>>) -> Self {
        self.transfer_duties = duties;
        self
    }

    pub fn with_sod_exempt_roles(mut self, roles: Vec<Role>) -> Self {
        self.sod_exempt_roles = roles;
        self
    }
}

/// Document numbering settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// Missing numbers per scope above which an audit raises a warning.
    pub max_tolerated_gap: u64,
    pub default_utc_offset_minutes: i32,
    pub location_utc_offsets: HashMap<LocationId, i32>,
    /// Short code printed in document numbers (e.g. `MAIN`).
    pub location_codes: HashMap<LocationId, String>,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            max_tolerated_gap: 10,
            default_utc_offset_minutes: 0,
            location_utc_offsets: HashMap::new(),
            location_codes: HashMap::new(),
        }
    }
}

impl SequenceConfig {
    /// Offset used to find a location's calendar day.
    pub fn offset_for(&self, location_id: LocationId) -> FixedOffset {
        let minutes = self
            .location_utc_offsets
            .get(&location_id)
            .copied()
            .unwrap_or(self.default_utc_offset_minutes);
        FixedOffset::east_opt(minutes * 60).unwrap_or_else(|| Utc.fix())
    }

    /// Configured code, or the last eight hex digits of the location id.
    pub fn location_code(&self, location_id: LocationId) -> String {
        match self.location_codes.get(&location_id) {
            Some(code) => code.clone(),
            None => {
                let hex = location_id.as_uuid().simple().to_string();
                hex[hex.len() - 8..].to_ascii_uppercase()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    /// Entries fetched per round trip by ledger history iterators.
    pub history_page_size: usize,
    pub default_policy: BusinessPolicy,
    pub business_policies: HashMap<BusinessId, BusinessPolicy>,
    pub sequences: SequenceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            history_page_size: 256,
            default_policy: BusinessPolicy::default(),
            business_policies: HashMap::new(),
            sequences: SequenceConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn policy_for(&self, business_id: BusinessId) -> &BusinessPolicy {
        self.business_policies
            .get(&business_id)
            .unwrap_or(&self.default_policy)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_history_page_size(mut self, size: usize) -> Self {
        self.history_page_size = size.max(1);
        self
    }

    pub fn with_default_policy(mut self, policy: BusinessPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn with_business_policy(mut self, business_id: BusinessId, policy: BusinessPolicy) -> Self {
        self.business_policies.insert(business_id, policy);
        self
    }

    pub fn with_sequences(mut self, sequences: SequenceConfig) -> Self {
        self.sequences = sequences;
        self
    }

    pub fn with_location(
        mut self,
        location_id: LocationId,
        code: &str,
        utc_offset_minutes: i32,
    ) -> Self {
        self.sequences
            .location_codes
            .insert(location_id, code.to_ascii_uppercase());
        self.sequences
            .location_utc_offsets
            .insert(location_id, utc_offset_minutes);
        self
    }

    /// Defaults overlaid with `STOCKFLOW_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `from_env` with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        config.default_policy.strict_non_negative = parse_or(
            &lookup,
            "STOCKFLOW_STRICT_NON_NEGATIVE",
            config.default_policy.strict_non_negative,
        );
        config.retry.max_retries =
            parse_or(&lookup, "STOCKFLOW_RETRY_MAX_RETRIES", config.retry.max_retries);
        config.retry.base_delay = Duration::from_millis(parse_or(
            &lookup,
            "STOCKFLOW_RETRY_BASE_DELAY_MS",
            config.retry.base_delay.as_millis() as u64,
        ));
        config.retry.max_delay = Duration::from_millis(parse_or(
            &lookup,
            "STOCKFLOW_RETRY_MAX_DELAY_MS",
            config.retry.max_delay.as_millis() as u64,
        ));
        config.history_page_size =
            parse_or(&lookup, "STOCKFLOW_HISTORY_PAGE_SIZE", config.history_page_size).max(1);
        config.sequences.max_tolerated_gap = parse_or(
            &lookup,
            "STOCKFLOW_MAX_SEQUENCE_GAP",
            config.sequences.max_tolerated_gap,
        );

        let offset: i32 = parse_or(
            &lookup,
            "STOCKFLOW_DEFAULT_UTC_OFFSET_MINUTES",
            config.sequences.default_utc_offset_minutes,
        );
        if FixedOffset::east_opt(offset * 60).is_some() {
            config.sequences.default_utc_offset_minutes = offset;
        } else {
            warn!(offset, "STOCKFLOW_DEFAULT_UTC_OFFSET_MINUTES out of range, using UTC");
        }

        config
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> T
where
    T: FromStr + Copy + core::fmt::Debug,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, ?default, "ignoring unparseable setting");
                default
            }
        },
    }
}
