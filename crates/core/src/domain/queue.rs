// Queue Domain Model

use crate::domain::error::DomainError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Queue family (fixed enumeration)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Queue {
    Urgent,
    Default,
    Feeds,
    AiTagging,
    MarketData,
    Screenshots,
    Background,
}

impl Queue {
    pub const ALL: [Queue; 7] = [
        Queue::Urgent,
        Queue::Default,
        Queue::Feeds,
        Queue::AiTagging,
        Queue::MarketData,
        Queue::Screenshots,
        Queue::Background,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Queue::Urgent => "urgent",
            Queue::Default => "default",
            Queue::Feeds => "feeds",
            Queue::AiTagging => "ai_tagging",
            Queue::MarketData => "market_data",
            Queue::Screenshots => "screenshots",
            Queue::Background => "background",
        }
    }
}

impl std::fmt::Display for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Queue {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Queue::ALL
            .iter()
            .copied()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| DomainError::UnknownQueue(s.to_string()))
    }
}

/// Queue configuration (per queue family)
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub queue: Queue,
    /// Maximum concurrent handler invocations per dispatcher
    pub workers: usize,
    pub poll_interval: Duration,
    /// Jobs claimed per batch when the queue is not budget-gated
    pub batch_size: usize,
    /// Permit pool capacity for resource-sensitive queues
    pub gate_capacity: Option<usize>,
    /// Whether the budget governor throttles this queue
    pub budget_gated: bool,
}

impl QueueConfig {
    /// Documented defaults for each queue family
    pub fn defaults_for(queue: Queue) -> Self {
        let (workers, poll_secs, gate_capacity, budget_gated) = match queue {
            Queue::Urgent => (4, 5, None, false),
            Queue::Default => (4, 10, None, false),
            Queue::Feeds => (8, 30, None, false),
            Queue::AiTagging => (2, 60, None, true),
            Queue::MarketData => (2, 15, None, false),
            Queue::Screenshots => (3, 20, Some(3), false),
            Queue::Background => (2, 60, None, false),
        };

        Self {
            queue,
            workers,
            poll_interval: Duration::from_secs(poll_secs),
            batch_size: workers * 5,
            gate_capacity,
            budget_gated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_names_parse_back() {
        for queue in Queue::ALL {
            assert_eq!(queue.as_str().parse::<Queue>().unwrap(), queue);
        }
        assert!("nope".parse::<Queue>().is_err());
    }

    #[test]
    fn test_defaults_match_queue_table() {
        let shots = QueueConfig::defaults_for(Queue::Screenshots);
        assert_eq!(shots.workers, 3);
        assert_eq!(shots.gate_capacity, Some(3));
        assert_eq!(shots.poll_interval, Duration::from_secs(20));

        let ai = QueueConfig::defaults_for(Queue::AiTagging);
        assert!(ai.budget_gated);
        assert_eq!(ai.poll_interval, Duration::from_secs(60));

        assert_eq!(QueueConfig::defaults_for(Queue::Urgent).poll_interval.as_secs(), 5);
    }
}
