// Escalation routing: queue -> (channel, SLA) for jobs that exhausted their retries
use crate::domain::{Channel, Escalation, EscalationPolicy, Job, Notification, Queue, Sla};
use crate::error::Result;
use crate::port::Notifier;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Static routing table of each queue family
pub fn default_policy(queue: Queue) -> EscalationPolicy {
    match queue {
        Queue::Urgent => EscalationPolicy {
            channel: Channel::Pager,
            sla: Sla::within(Duration::from_secs(15 * 60)),
        },
        Queue::MarketData => EscalationPolicy {
            channel: Channel::Pager,
            sla: Sla::within(Duration::from_secs(60 * 60)),
        },
        Queue::Default | Queue::Feeds | Queue::AiTagging => EscalationPolicy {
            channel: Channel::Chat,
            sla: Sla::within(Duration::from_secs(4 * 60 * 60)),
        },
        Queue::Screenshots | Queue::Background => EscalationPolicy {
            channel: Channel::EmailDigest,
            sla: Sla::NextBusinessDay,
        },
    }
}

/// Routes exhaustion events to the notifier
///
/// Whoever moved the job to FAILED (the dispatcher, or the lock reaper for a
/// job whose last attempt died with its worker) calls `escalate` right after,
/// so a job never escalates twice.
pub struct EscalationRouter {
    notifier: Arc<dyn Notifier>,
    overrides: HashMap<Queue, EscalationPolicy>,
}

impl EscalationRouter {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            overrides: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, queue: Queue, policy: EscalationPolicy) -> Self {
        self.overrides.insert(queue, policy);
        self
    }

    pub fn policy_for(&self, queue: Queue) -> EscalationPolicy {
        self.overrides
            .get(&queue)
            .copied()
            .unwrap_or_else(|| default_policy(queue))
    }

    /// Notify the queue's channel that `job` failed for good
    ///
    /// # Arguments
    /// * `job` - The job as claimed (attempts not yet counting the final run)
    /// * `final_error` - Error of the last attempt
    pub async fn escalate(&self, job: &Job, final_error: &str) -> Result<Escalation> {
        let escalation = Escalation {
            job_id: job.id,
            job_type: job.job_type.clone(),
            queue: job.queue,
            attempts: job.current_attempt().min(job.max_attempts),
            final_error: final_error.to_string(),
            policy: self.policy_for(job.queue),
        };

        if let Err(e) = self
            .notifier
            .send(Notification::Escalation(escalation.clone()))
            .await
        {
            error!(
                job_id = %job.id,
                queue = %job.queue,
                channel = %escalation.policy.channel,
                error = %e,
                "Failed to deliver escalation"
            );
            return Err(e);
        }
        Ok(escalation)
    }
}
