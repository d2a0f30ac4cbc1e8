// Notifier Port (escalations and budget alerts)

use crate::domain::Notification;
use crate::error::Result;
use async_trait::async_trait;
use tracing::{info, warn};

/// Delivery of routed notifications (pager, chat, email digest)
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<()>;
}

/// Writes notifications to the log (default transport)
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: Notification) -> Result<()> {
        match &notification {
            Notification::Escalation(e) => {
                warn!(
                    channel = %e.policy.channel,
                    sla = %e.policy.sla,
                    job_id = %e.job_id,
                    job_type = %e.job_type,
                    queue = %e.queue,
                    attempts = e.attempts,
                    error = %e.final_error,
                    "Job escalated"
                );
            }
            Notification::BudgetAlert(a) => {
                info!(
                    channel = %a.channel,
                    period = %a.period,
                    provider = %a.provider,
                    threshold = a.threshold.percent(),
                    cost_cents = a.cost_cents,
                    ceiling_cents = a.ceiling_cents,
                    "Budget threshold crossed"
                );
            }
        }
        Ok(())
    }
}

pub mod mocks {
    use super::*;
    use crate::domain::{BudgetAlert, Escalation};
    use std::sync::Mutex;

    /// Keeps every notification in memory
    #[derive(Default)]
    pub struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn all(&self) -> Vec<Notification> {
            self.sent.lock().map(|s| s.clone()).unwrap_or_default()
        }

        pub fn escalations(&self) -> Vec<Escalation> {
            self.all()
                .into_iter()
                .filter_map(|n| match n {
                    Notification::Escalation(e) => Some(e),
                    _ => None,
                })
                .collect()
        }

        pub fn budget_alerts(&self) -> Vec<BudgetAlert> {
            self.all()
                .into_iter()
                .filter_map(|n| match n {
                    Notification::BudgetAlert(a) => Some(a),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, notification: Notification) -> Result<()> {
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(notification);
            }
            Ok(())
        }
    }
}
