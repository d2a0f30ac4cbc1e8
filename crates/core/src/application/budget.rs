// Budget governor: monthly cost accumulator and throttle state machine
use crate::domain::{
    BudgetAlert, BudgetPeriod, Notification, PeriodKey, ThrottleState, UsageDelta,
};
use crate::error::{AppError, Result};
use crate::port::telemetry::counters;
use crate::port::{BudgetStore, Notifier, TelemetrySink, TimeProvider};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Default monthly ceiling (500.00 in cents)
pub const DEFAULT_MONTHLY_CEILING_CENTS: i64 = 50_000;

/// Batch size while NORMAL
pub const DEFAULT_NORMAL_BATCH_SIZE: usize = 20;

/// Batch size while REDUCE
pub const DEFAULT_REDUCED_BATCH_SIZE: usize = 10;

/// Budget governor configuration
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    /// Provider label of the metered API
    pub provider: String,
    /// Ceiling used when a period record is created lazily
    pub monthly_ceiling_cents: i64,
    pub normal_batch_size: usize,
    pub reduced_batch_size: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            monthly_ceiling_cents: DEFAULT_MONTHLY_CEILING_CENTS,
            normal_batch_size: DEFAULT_NORMAL_BATCH_SIZE,
            reduced_batch_size: DEFAULT_REDUCED_BATCH_SIZE,
        }
    }
}

/// Read model for budget administration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetStatus {
    pub period: PeriodKey,
    pub provider: String,
    pub request_count: i64,
    pub input_units: i64,
    pub output_units: i64,
    pub cost_cents: i64,
    pub ceiling_cents: i64,
    pub percent_used: f64,
    pub state: ThrottleState,
    pub batch_size: usize,
}

/// Gates a queue class on its monthly spend
///
/// State is derived from the stored accumulator on every call and never
/// cached, so ceiling overrides and rollovers apply at the next recomputation.
/// All usage updates go through one mutex-serialized path.
pub struct BudgetGovernor {
    store: Arc<dyn BudgetStore>,
    notifier: Arc<dyn Notifier>,
    telemetry: Arc<dyn TelemetrySink>,
    time_provider: Arc<dyn TimeProvider>,
    config: BudgetConfig,
    update_lock: Mutex<()>,
}

impl BudgetGovernor {
    pub fn new(
        store: Arc<dyn BudgetStore>,
        notifier: Arc<dyn Notifier>,
        telemetry: Arc<dyn TelemetrySink>,
        time_provider: Arc<dyn TimeProvider>,
        config: BudgetConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            telemetry,
            time_provider,
            config,
            update_lock: Mutex::new(()),
        }
    }

    pub fn provider(&self) -> &str {
        &self.config.provider
    }

    /// Accounting period of "now"
    pub fn current_period(&self) -> PeriodKey {
        PeriodKey::from_millis(self.time_provider.now_millis())
    }

    /// Current period record (created with a zero accumulator on first access)
    pub async fn current(&self) -> Result<BudgetPeriod> {
        self.store
            .find_or_create(
                self.current_period(),
                &self.config.provider,
                self.config.monthly_ceiling_cents,
            )
            .await
    }

    pub async fn current_state(&self) -> Result<ThrottleState> {
        Ok(self.current().await?.throttle_state())
    }

    /// Jobs a budget-gated dispatcher may claim in its next batch
    pub async fn batch_size(&self) -> Result<usize> {
        Ok(self.batch_size_for(self.current_state().await?))
    }

    pub fn batch_size_for(&self, state: ThrottleState) -> usize {
        match state {
            ThrottleState::Normal => self.config.normal_batch_size,
            ThrottleState::Reduce => self.config.reduced_batch_size,
            ThrottleState::Queue | ThrottleState::HardStop => 0,
        }
    }

    /// Record one metered call against the current period
    ///
    /// # Arguments
    /// * `input_units` - Input usage units (e.g. prompt tokens)
    /// * `output_units` - Output usage units
    /// * `cost_cents` - Estimated cost of the call; must be non-negative
    pub async fn record_usage(
        &self,
        input_units: i64,
        output_units: i64,
        cost_cents: i64,
    ) -> Result<BudgetPeriod> {
        self.record(UsageDelta::single_call(input_units, output_units, cost_cents))
            .await
    }

    /// Apply an arbitrary usage delta to the current period
    pub async fn record(&self, delta: UsageDelta) -> Result<BudgetPeriod> {
        delta.validate()?;

        let _guard = self.update_lock.lock().await;
        let updated = self
            .store
            .record_usage(
                self.current_period(),
                &self.config.provider,
                self.config.monthly_ceiling_cents,
                &delta,
            )
            .await?;

        self.telemetry.increment(
            counters::BUDGET_COST_CENTS,
            &self.config.provider,
            delta.cost_cents.unsigned_abs(),
        );
        self.telemetry.increment(
            counters::BUDGET_REQUESTS,
            &self.config.provider,
            delta.requests.unsigned_abs(),
        );

        info!(
            period = %updated.period,
            provider = %updated.provider,
            cost_cents = updated.cost_cents,
            ceiling_cents = updated.ceiling_cents,
            state = %updated.throttle_state(),
            "Budget usage recorded"
        );

        self.announce_crossings(&updated).await?;
        Ok(updated)
    }

    /// Usage, ceiling and derived state of the current period
    pub async fn status(&self) -> Result<BudgetStatus> {
        let period = self.current().await?;
        Ok(self.to_status(period))
    }

    /// Override the ceiling of the current period (`None`) or a future one
    ///
    /// Past periods are closed and rejected.
    pub async fn set_ceiling(
        &self,
        period: Option<PeriodKey>,
        ceiling_cents: i64,
    ) -> Result<BudgetStatus> {
        if ceiling_cents < 0 {
            return Err(AppError::Validation(
                "ceiling must be non-negative".to_string(),
            ));
        }
        let current = self.current_period();
        let target = period.unwrap_or(current);
        if target < current {
            return Err(AppError::Validation(format!(
                "period {target} is closed (current period is {current})"
            )));
        }

        let _guard = self.update_lock.lock().await;
        let updated = self
            .store
            .set_ceiling(target, &self.config.provider, ceiling_cents)
            .await?;

        warn!(
            period = %target,
            provider = %self.config.provider,
            ceiling_cents = ceiling_cents,
            "Budget ceiling overridden"
        );

        if target == current {
            self.announce_crossings(&updated).await?;
        }
        Ok(self.to_status(updated))
    }

    /// Read model of `period` with the batch size this governor derives from it
    pub fn to_status(&self, period: BudgetPeriod) -> BudgetStatus {
        let state = period.throttle_state();
        BudgetStatus {
            percent_used: period.percent_used(),
            batch_size: self.batch_size_for(state),
            state,
            period: period.period,
            provider: period.provider,
            request_count: period.request_count,
            input_units: period.input_units,
            output_units: period.output_units,
            cost_cents: period.cost_cents,
            ceiling_cents: period.ceiling_cents,
        }
    }

    /// One alert per threshold per period; the store arbitrates who sends it
    async fn announce_crossings(&self, period: &BudgetPeriod) -> Result<()> {
        for threshold in period.pending_notifications() {
            let claimed = self
                .store
                .claim_notification(period.period, &period.provider, threshold)
                .await?;
            if !claimed {
                continue;
            }

            let alert = BudgetAlert {
                period: period.period,
                provider: period.provider.clone(),
                threshold,
                cost_cents: period.cost_cents,
                ceiling_cents: period.ceiling_cents,
                channel: BudgetAlert::channel_for(threshold),
            };
            if let Err(e) = self.notifier.send(Notification::BudgetAlert(alert)).await {
                error!(
                    period = %period.period,
                    threshold = threshold.percent(),
                    error = %e,
                    "Failed to deliver budget alert"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Channel, Threshold};
    use crate::port::budget_store::mocks::InMemoryBudgetStore;
    use crate::port::notifier::mocks::RecordingNotifier;
    use crate::port::telemetry::mocks::RecordingTelemetry;
    use crate::port::time_provider::mocks::ManualClock;

    // 2026-01-15T00:00:00Z
    const JAN_15: i64 = 1_768_435_200_000;
    // 2026-02-01T00:00:00Z
    const FEB_1: i64 = 1_769_904_000_000;

    struct Fixture {
        governor: BudgetGovernor,
        notifier: Arc<RecordingNotifier>,
        clock: Arc<ManualClock>,
        telemetry: Arc<RecordingTelemetry>,
    }

    fn fixture() -> Fixture {
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(ManualClock::new(JAN_15));
        let telemetry = Arc::new(RecordingTelemetry::new());
        let governor = BudgetGovernor::new(
            Arc::new(InMemoryBudgetStore::new()),
            notifier.clone(),
            telemetry.clone(),
            clock.clone(),
            BudgetConfig::default(),
        );
        Fixture {
            governor,
            notifier,
            clock,
            telemetry,
        }
    }

    #[tokio::test]
    async fn test_state_progression_and_batch_sizes() {
        let f = fixture();
        assert_eq!(f.governor.current_state().await.unwrap(), ThrottleState::Normal);
        assert_eq!(f.governor.batch_size().await.unwrap(), 20);

        f.governor.record_usage(1000, 200, 37_500).await.unwrap();
        assert_eq!(f.governor.current_state().await.unwrap(), ThrottleState::Reduce);
        assert_eq!(f.governor.batch_size().await.unwrap(), 10);
        assert_eq!(f.notifier.budget_alerts().len(), 1);

        f.governor.record_usage(500, 100, 7_500).await.unwrap();
        assert_eq!(f.governor.current_state().await.unwrap(), ThrottleState::Queue);
        assert_eq!(f.governor.batch_size().await.unwrap(), 0);

        f.governor.record_usage(500, 100, 5_000).await.unwrap();
        assert_eq!(f.governor.current_state().await.unwrap(), ThrottleState::HardStop);
        assert_eq!(f.governor.batch_size().await.unwrap(), 0);

        let alerts = f.notifier.budget_alerts();
        let thresholds: Vec<Threshold> = alerts.iter().map(|a| a.threshold).collect();
        assert_eq!(
            thresholds,
            vec![Threshold::Percent75, Threshold::Percent90, Threshold::Percent100]
        );
        assert_eq!(alerts[0].channel, Channel::Chat);
        assert_eq!(alerts[2].channel, Channel::Pager);

        let snapshot = f.telemetry.snapshot();
        assert_eq!(snapshot.counter(counters::BUDGET_COST_CENTS), 50_000);
        assert_eq!(snapshot.counter(counters::BUDGET_REQUESTS), 3);
    }

    #[tokio::test]
    async fn test_threshold_notifies_once_per_period() {
        let f = fixture();
        f.governor.record_usage(0, 0, 38_000).await.unwrap();
        f.governor.record_usage(0, 0, 100).await.unwrap();

        // Ceiling raised above usage then lowered again: 75% is re-crossed
        f.governor.set_ceiling(None, 100_000).await.unwrap();
        f.governor.set_ceiling(None, 50_000).await.unwrap();

        let alerts = f.notifier.budget_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].threshold, Threshold::Percent75);
    }

    #[tokio::test]
    async fn test_jump_past_several_thresholds_sends_each_once() {
        let f = fixture();
        f.governor.record_usage(0, 0, 60_000).await.unwrap();
        assert_eq!(f.notifier.budget_alerts().len(), 3);
    }

    #[tokio::test]
    async fn test_rollover_starts_from_zero() {
        let f = fixture();
        f.governor.record_usage(0, 0, 49_000).await.unwrap();
        assert_eq!(f.governor.current_state().await.unwrap(), ThrottleState::Queue);

        f.clock.set(FEB_1);
        let status = f.governor.status().await.unwrap();
        assert_eq!(status.period.to_string(), "2026-02");
        assert_eq!(status.cost_cents, 0);
        assert_eq!(status.state, ThrottleState::Normal);

        let updated = f.governor.record_usage(0, 0, 100).await.unwrap();
        assert_eq!(updated.cost_cents, 100);
    }

    #[tokio::test]
    async fn test_negative_cost_rejected() {
        let f = fixture();
        let err = f.governor.record_usage(1, 1, -5).await.unwrap_err();
        assert!(matches!(err, AppError::Domain(_)));
        assert_eq!(f.governor.status().await.unwrap().cost_cents, 0);
    }

    #[tokio::test]
    async fn test_ceiling_override_rules() {
        let f = fixture();
        f.governor.record_usage(0, 0, 10_000).await.unwrap();

        let past = PeriodKey::new(2025, 12).unwrap();
        let err = f.governor.set_ceiling(Some(past), 1).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        // Future period does not touch the current state
        let next = f.governor.current_period().next();
        let future = f.governor.set_ceiling(Some(next), 10_000).await.unwrap();
        assert_eq!(future.ceiling_cents, 10_000);
        assert_eq!(f.governor.current_state().await.unwrap(), ThrottleState::Normal);

        // Current period override takes effect at the next recomputation
        let status = f.governor.set_ceiling(None, 12_000).await.unwrap();
        assert_eq!(status.state, ThrottleState::Reduce);
        assert_eq!(f.governor.current_state().await.unwrap(), ThrottleState::Reduce);

        // Ceiling set ahead of time applies after rollover
        f.clock.set(FEB_1);
        assert_eq!(f.governor.status().await.unwrap().ceiling_cents, 10_000);
    }

    #[tokio::test]
    async fn test_concurrent_usage_is_serialized() {
        let f = Arc::new(fixture());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let f = Arc::clone(&f);
            handles.push(tokio::spawn(async move {
                f.governor.record_usage(10, 10, 2_000).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let status = f.governor.status().await.unwrap();
        assert_eq!(status.cost_cents, 40_000);
        assert_eq!(status.request_count, 20);
        assert_eq!(f.notifier.budget_alerts().len(), 1);
    }
}
