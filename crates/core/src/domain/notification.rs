// Notification Domain Model (routing decisions only; transport lives behind the Notifier port)

use crate::domain::budget::{PeriodKey, Threshold};
use crate::domain::job::{JobId, JobType};
use crate::domain::queue::Queue;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delivery channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Pager,
    Chat,
    EmailDigest,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Pager => "pager",
            Channel::Chat => "chat",
            Channel::EmailDigest => "email_digest",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response SLA attached to a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "secs", rename_all = "snake_case")]
pub enum Sla {
    Within(u64),
    NextBusinessDay,
}

impl Sla {
    pub fn within(duration: Duration) -> Self {
        Sla::Within(duration.as_secs())
    }
}

impl std::fmt::Display for Sla {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sla::Within(secs) if secs % 3600 == 0 => write!(f, "{}h", secs / 3600),
            Sla::Within(secs) => write!(f, "{}m", secs / 60),
            Sla::NextBusinessDay => f.write_str("next business day"),
        }
    }
}

/// Escalation policy of a queue family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub channel: Channel,
    pub sla: Sla,
}

/// A job exhausted its retry budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub job_id: JobId,
    pub job_type: JobType,
    pub queue: Queue,
    pub attempts: i32,
    pub final_error: String,
    pub policy: EscalationPolicy,
}

/// A budget period crossed a threshold for the first time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetAlert {
    pub period: PeriodKey,
    pub provider: String,
    pub threshold: Threshold,
    pub cost_cents: i64,
    pub ceiling_cents: i64,
    pub channel: Channel,
}

impl BudgetAlert {
    /// Exhausted budgets page; early warnings go to chat
    pub fn channel_for(threshold: Threshold) -> Channel {
        match threshold {
            Threshold::Percent100 => Channel::Pager,
            Threshold::Percent75 | Threshold::Percent90 => Channel::Chat,
        }
    }
}

/// Anything handed to the Notifier port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Escalation(Escalation),
    BudgetAlert(BudgetAlert),
}

impl Notification {
    pub fn channel(&self) -> Channel {
        match self {
            Notification::Escalation(e) => e.policy.channel,
            Notification::BudgetAlert(a) => a.channel,
        }
    }
}
