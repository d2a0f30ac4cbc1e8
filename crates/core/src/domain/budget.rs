// Budget Domain Model (monthly cost accounting for metered job classes)

use crate::domain::error::{DomainError, Result};
use chrono::{Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Accounting period key ("YYYY-MM", UTC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeriodKey {
    year: i32,
    month: u32,
}

impl PeriodKey {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) || !(1970..=9999).contains(&year) {
            return Err(DomainError::InvalidPeriodKey(format!("{year}-{month}")));
        }
        Ok(Self { year, month })
    }

    /// Period containing the given instant (epoch ms)
    pub fn from_millis(millis: i64) -> Self {
        // Out-of-range instants clamp to the epoch
        let dt = Utc.timestamp_millis_opt(millis).single().unwrap_or_default();
        Self {
            year: dt.year(),
            month: dt.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }
}

impl std::fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for PeriodKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || DomainError::InvalidPeriodKey(s.to_string());
        let (year, month) = s.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        Self::new(year, month).map_err(|_| invalid())
    }
}

impl Serialize for PeriodKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeriodKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Throttle state derived from cost / ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThrottleState {
    Normal,
    Reduce,
    Queue,
    HardStop,
}

impl ThrottleState {
    /// Pure function of cumulative cost over ceiling
    ///
    /// Integer math keeps the boundaries exact (75% of 50000 is REDUCE, not NORMAL).
    /// A non-positive ceiling means nothing may be spent.
    pub fn from_usage(cost_cents: i64, ceiling_cents: i64) -> Self {
        if ceiling_cents <= 0 {
            return ThrottleState::HardStop;
        }
        let scaled = i128::from(cost_cents.max(0)) * 100;
        let ceiling = i128::from(ceiling_cents);

        if scaled >= ceiling * 100 {
            ThrottleState::HardStop
        } else if scaled >= ceiling * 90 {
            ThrottleState::Queue
        } else if scaled >= ceiling * 75 {
            ThrottleState::Reduce
        } else {
            ThrottleState::Normal
        }
    }

    /// Whether claimed jobs may still execute
    pub fn allows_execution(&self) -> bool {
        matches!(self, ThrottleState::Normal | ThrottleState::Reduce)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThrottleState::Normal => "NORMAL",
            ThrottleState::Reduce => "REDUCE",
            ThrottleState::Queue => "QUEUE",
            ThrottleState::HardStop => "HARD_STOP",
        }
    }
}

impl std::fmt::Display for ThrottleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification thresholds (percent of ceiling)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Threshold {
    #[serde(rename = "75")]
    Percent75,
    #[serde(rename = "90")]
    Percent90,
    #[serde(rename = "100")]
    Percent100,
}

impl Threshold {
    pub const ALL: [Threshold; 3] = [
        Threshold::Percent75,
        Threshold::Percent90,
        Threshold::Percent100,
    ];

    pub fn percent(&self) -> i64 {
        match self {
            Threshold::Percent75 => 75,
            Threshold::Percent90 => 90,
            Threshold::Percent100 => 100,
        }
    }

    /// Bit in the persisted `notified_mask`
    pub fn bit(&self) -> i64 {
        match self {
            Threshold::Percent75 => 0b001,
            Threshold::Percent90 => 0b010,
            Threshold::Percent100 => 0b100,
        }
    }

    pub fn is_reached(&self, cost_cents: i64, ceiling_cents: i64) -> bool {
        if ceiling_cents <= 0 {
            return true;
        }
        i128::from(cost_cents) * 100 >= i128::from(ceiling_cents) * i128::from(self.percent())
    }

    /// Thresholds reached by the given usage
    pub fn reached(cost_cents: i64, ceiling_cents: i64) -> Vec<Threshold> {
        Self::ALL
            .into_iter()
            .filter(|t| t.is_reached(cost_cents, ceiling_cents))
            .collect()
    }
}

/// One accounting month for a metered provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetPeriod {
    pub period: PeriodKey,
    pub provider: String,
    pub request_count: i64,
    pub input_units: i64,
    pub output_units: i64,
    pub cost_cents: i64,
    pub ceiling_cents: i64,
    /// Thresholds already announced this period (bitset of `Threshold::bit`)
    pub notified_mask: i64,
    pub updated_at: i64, // epoch ms
}

impl BudgetPeriod {
    /// Fresh zero accumulator for a period
    pub fn new(period: PeriodKey, provider: impl Into<String>, ceiling_cents: i64, now: i64) -> Self {
        Self {
            period,
            provider: provider.into(),
            request_count: 0,
            input_units: 0,
            output_units: 0,
            cost_cents: 0,
            ceiling_cents,
            notified_mask: 0,
            updated_at: now,
        }
    }

    pub fn throttle_state(&self) -> ThrottleState {
        ThrottleState::from_usage(self.cost_cents, self.ceiling_cents)
    }

    pub fn percent_used(&self) -> f64 {
        if self.ceiling_cents <= 0 {
            return 100.0;
        }
        self.cost_cents as f64 * 100.0 / self.ceiling_cents as f64
    }

    pub fn was_notified(&self, threshold: Threshold) -> bool {
        self.notified_mask & threshold.bit() != 0
    }

    /// Reached thresholds that have not been announced yet
    pub fn pending_notifications(&self) -> Vec<Threshold> {
        Threshold::reached(self.cost_cents, self.ceiling_cents)
            .into_iter()
            .filter(|t| !self.was_notified(*t))
            .collect()
    }
}

/// Usage reported by one metered call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDelta {
    pub requests: i64,
    pub input_units: i64,
    pub output_units: i64,
    pub cost_cents: i64,
}

impl UsageDelta {
    pub fn single_call(input_units: i64, output_units: i64, cost_cents: i64) -> Self {
        Self {
            requests: 1,
            input_units,
            output_units,
            cost_cents,
        }
    }

    /// Accumulators are monotonic: no negative component is accepted
    pub fn validate(&self) -> Result<()> {
        if self.requests < 0 || self.input_units < 0 || self.output_units < 0 || self.cost_cents < 0 {
            return Err(DomainError::ValidationError(
                "usage deltas must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}
