// Budget Store Port (Interface)

use crate::domain::{BudgetPeriod, PeriodKey, Threshold, UsageDelta};
use crate::error::Result;
use async_trait::async_trait;

/// Persistence for per-(period, provider) budget accumulators
///
/// Exactly one record exists per (period, provider). Records are created
/// lazily with `default_ceiling_cents` unless a ceiling was set ahead of time.
#[async_trait]
pub trait BudgetStore: Send + Sync {
    /// Load the period record, creating a zero accumulator if missing
    async fn find_or_create(
        &self,
        period: PeriodKey,
        provider: &str,
        default_ceiling_cents: i64,
    ) -> Result<BudgetPeriod>;

    /// Atomically add `delta` to the period record and return the updated row
    async fn record_usage(
        &self,
        period: PeriodKey,
        provider: &str,
        default_ceiling_cents: i64,
        delta: &UsageDelta,
    ) -> Result<BudgetPeriod>;

    /// Set the ceiling of a period, creating the record if needed
    async fn set_ceiling(
        &self,
        period: PeriodKey,
        provider: &str,
        ceiling_cents: i64,
    ) -> Result<BudgetPeriod>;

    /// Mark `threshold` as announced; true only for the first caller per period
    async fn claim_notification(
        &self,
        period: PeriodKey,
        provider: &str,
        threshold: Threshold,
    ) -> Result<bool>;
}

pub mod mocks {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// HashMap-backed budget store
    #[derive(Default)]
    pub struct InMemoryBudgetStore {
        periods: Mutex<HashMap<(PeriodKey, String), BudgetPeriod>>,
    }

    impl InMemoryBudgetStore {
        pub fn new() -> Self {
            Self::default()
        }

        fn with_period<T>(
            &self,
            period: PeriodKey,
            provider: &str,
            default_ceiling_cents: i64,
            f: impl FnOnce(&mut BudgetPeriod) -> T,
        ) -> T {
            let mut periods = match self.periods.lock() {
                Ok(p) => p,
                Err(poisoned) => poisoned.into_inner(),
            };
            let entry = periods
                .entry((period, provider.to_string()))
                .or_insert_with(|| BudgetPeriod::new(period, provider, default_ceiling_cents, 0));
            f(entry)
        }
    }

    #[async_trait]
    impl BudgetStore for InMemoryBudgetStore {
        async fn find_or_create(
            &self,
            period: PeriodKey,
            provider: &str,
            default_ceiling_cents: i64,
        ) -> Result<BudgetPeriod> {
            Ok(self.with_period(period, provider, default_ceiling_cents, |p| p.clone()))
        }

        async fn record_usage(
            &self,
            period: PeriodKey,
            provider: &str,
            default_ceiling_cents: i64,
            delta: &UsageDelta,
        ) -> Result<BudgetPeriod> {
            Ok(self.with_period(period, provider, default_ceiling_cents, |p| {
                p.request_count += delta.requests;
                p.input_units += delta.input_units;
                p.output_units += delta.output_units;
                p.cost_cents += delta.cost_cents;
                p.clone()
            }))
        }

        async fn set_ceiling(
            &self,
            period: PeriodKey,
            provider: &str,
            ceiling_cents: i64,
        ) -> Result<BudgetPeriod> {
            Ok(self.with_period(period, provider, ceiling_cents, |p| {
                p.ceiling_cents = ceiling_cents;
                p.clone()
            }))
        }

        async fn claim_notification(
            &self,
            period: PeriodKey,
            provider: &str,
            threshold: Threshold,
        ) -> Result<bool> {
            Ok(self.with_period(period, provider, 0, |p| {
                if p.was_notified(threshold) {
                    false
                } else {
                    p.notified_mask |= threshold.bit();
                    true
                }
            }))
        }
    }
}
