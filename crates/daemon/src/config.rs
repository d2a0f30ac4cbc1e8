//! Daemon configuration
//!
//! Layered with the `config` crate: optional TOML file (`CONVEYOR_CONFIG`,
//! default `conveyor.toml`), then `CONVEYOR__*` environment variables
//! (`CONVEYOR__BUDGET__MONTHLY_CEILING_CENTS=50000`).

use anyhow::{bail, Context, Result};
use ::config::{Config, Environment, File, FileFormat};
use conveyor_core::application::budget::{
    BudgetConfig, DEFAULT_MONTHLY_CEILING_CENTS, DEFAULT_NORMAL_BATCH_SIZE,
    DEFAULT_REDUCED_BATCH_SIZE,
};
use conveyor_core::application::dispatcher::constants::{
    DEFAULT_REAPER_INTERVAL, DEFAULT_SHUTDOWN_GRACE, DEFAULT_STALE_LOCK_TIMEOUT,
};
use conveyor_core::application::registry::{DEFAULT_BASE_DELAY, DEFAULT_HANDLER_TIMEOUT};
use conveyor_core::application::DispatcherConfig;
use conveyor_core::domain::{Queue, QueueConfig, DEFAULT_MAX_ATTEMPTS};
use conveyor_core::port::IdProvider;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const CONFIG_PATH_ENV: &str = "CONVEYOR_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "conveyor.toml";
const ENV_PREFIX: &str = "CONVEYOR";
const ENV_SEPARATOR: &str = "__";

const DEFAULT_DATABASE_PATH: &str = "~/.conveyor/jobs.db";
const DEFAULT_RPC_HOST: &str = "127.0.0.1";
const DEFAULT_RPC_PORT: u16 = 9640;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// SQLite path or `sqlite:` URL; `~` is expanded
    pub database_url: String,
    /// Lock owner of this process; generated when absent
    pub worker_id: Option<String>,
    pub rpc_host: String,
    pub rpc_port: u16,
    pub stale_lock_timeout_secs: u64,
    pub reaper_interval_secs: u64,
    pub shutdown_grace_secs: u64,
    pub fail_fast_on_permanent: bool,
    pub budget: BudgetSection,
    /// Per-queue overrides keyed by queue name
    pub queues: HashMap<String, QueueOverride>,
    pub handlers: Vec<HandlerConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_PATH.to_string(),
            worker_id: None,
            rpc_host: DEFAULT_RPC_HOST.to_string(),
            rpc_port: DEFAULT_RPC_PORT,
            stale_lock_timeout_secs: DEFAULT_STALE_LOCK_TIMEOUT.as_secs(),
            reaper_interval_secs: DEFAULT_REAPER_INTERVAL.as_secs(),
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE.as_secs(),
            fail_fast_on_permanent: false,
            budget: BudgetSection::default(),
            queues: HashMap::new(),
            handlers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    pub provider: String,
    pub monthly_ceiling_cents: i64,
    pub normal_batch_size: usize,
    pub reduced_batch_size: usize,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            provider: BudgetConfig::default().provider,
            monthly_ceiling_cents: DEFAULT_MONTHLY_CEILING_CENTS,
            normal_batch_size: DEFAULT_NORMAL_BATCH_SIZE,
            reduced_batch_size: DEFAULT_REDUCED_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueOverride {
    pub workers: Option<usize>,
    pub poll_interval_secs: Option<u64>,
    pub batch_size: Option<usize>,
    pub gate_capacity: Option<usize>,
}

/// One job type served by an external command
#[derive(Debug, Clone, Deserialize)]
pub struct HandlerConfig {
    pub job_type: String,
    pub queue: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment passed to the child; the adapter's default list when absent
    #[serde(default)]
    pub env_allowlist: Option<Vec<String>>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

fn default_max_attempts() -> i32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_secs() -> u64 {
    DEFAULT_BASE_DELAY.as_secs()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_HANDLER_TIMEOUT.as_secs()
}

impl DaemonConfig {
    /// Load from `CONVEYOR_CONFIG` (or `conveyor.toml`) and the environment
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let explicit = std::env::var(CONFIG_PATH_ENV).is_ok();

        let config = Config::builder()
            .add_source(File::with_name(&path).required(explicit))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration ({})", path))?;

        config
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Parse a TOML document (no environment layer)
    pub fn from_toml(toml: &str) -> Result<Self> {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .context("Failed to parse configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Database URL with `~` expanded; the parent directory is created for file paths
    pub fn database_url(&self) -> Result<String> {
        let expanded = shellexpand::tilde(&self.database_url).into_owned();

        let path = expanded
            .strip_prefix("sqlite://")
            .or_else(|| expanded.strip_prefix("sqlite:"))
            .unwrap_or(&expanded);
        if !path.contains(":memory:") {
            if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }

        Ok(expanded)
    }

    /// `hostname-pid-<id>` unless configured
    pub fn worker_id(&self, ids: &dyn IdProvider) -> String {
        match &self.worker_id {
            Some(id) => id.clone(),
            None => {
                let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "conveyor".to_string());
                let id = ids.generate_id();
                let short = id.split('-').next().unwrap_or(&id);
                format!("{}-{}-{}", host, std::process::id(), short)
            }
        }
    }

    pub fn stale_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_lock_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn dispatcher_config(&self, worker_id: &str) -> DispatcherConfig {
        let mut config = DispatcherConfig::new(worker_id);
        config.shutdown_grace = self.shutdown_grace();
        config.fail_fast_on_permanent = self.fail_fast_on_permanent;
        config
    }

    pub fn budget_config(&self) -> BudgetConfig {
        BudgetConfig {
            provider: self.budget.provider.clone(),
            monthly_ceiling_cents: self.budget.monthly_ceiling_cents,
            normal_batch_size: self.budget.normal_batch_size,
            reduced_batch_size: self.budget.reduced_batch_size,
        }
    }

    /// Queue defaults with the configured overrides applied
    pub fn queue_config(&self, queue: Queue) -> QueueConfig {
        let mut config = QueueConfig::defaults_for(queue);
        if let Some(o) = self.queues.get(queue.as_str()) {
            if let Some(workers) = o.workers {
                config.workers = workers;
                config.batch_size = workers * 5;
            }
            if let Some(secs) = o.poll_interval_secs {
                config.poll_interval = Duration::from_secs(secs);
            }
            if let Some(batch_size) = o.batch_size {
                config.batch_size = batch_size;
            }
            if o.gate_capacity.is_some() {
                config.gate_capacity = o.gate_capacity;
            }
        }
        config
    }

    /// Reject settings the daemon cannot run with
    ///
    /// # Arguments
    /// * `longest_handler_timeout` - Upper bound of any registered handler run
    pub fn validate(&self, longest_handler_timeout: Duration) -> Result<()> {
        if self.stale_lock_timeout() < longest_handler_timeout {
            bail!(
                "stale_lock_timeout_secs ({}) is shorter than the longest handler timeout ({}s); \
                 running jobs would be reclaimed while still executing",
                self.stale_lock_timeout_secs,
                longest_handler_timeout.as_secs()
            );
        }
        if self.reaper_interval_secs == 0 {
            bail!("reaper_interval_secs must be positive");
        }
        if self.budget.reduced_batch_size > self.budget.normal_batch_size {
            bail!("budget.reduced_batch_size must not exceed budget.normal_batch_size");
        }

        for (name, o) in &self.queues {
            name.parse::<Queue>()
                .with_context(|| format!("queues.{}: unknown queue", name))?;
            if o.workers == Some(0) || o.batch_size == Some(0) {
                bail!("queues.{}: workers and batch_size must be positive", name);
            }
            if o.poll_interval_secs == Some(0) {
                bail!("queues.{}: poll_interval_secs must be positive", name);
            }
        }

        for handler in &self.handlers {
            handler
                .queue
                .parse::<Queue>()
                .with_context(|| format!("handler {}: unknown queue", handler.job_type))?;
            if handler.timeout_secs == 0 {
                bail!("handler {}: timeout_secs must be positive", handler.job_type);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};
    use conveyor_core::port::id_provider::mocks::SequentialIds;

    const SAMPLE: &str = r#"
        database_url = "sqlite::memory:"
        stale_lock_timeout_secs = 600

        [budget]
        monthly_ceiling_cents = 20000

        [queues.feeds]
        workers = 2
        poll_interval_secs = 5

        [[handlers]]
        job_type = "feeds.fetch"
        queue = "feeds"
        command = "/usr/local/bin/fetch-feed"
        args = ["--quiet"]
        timeout_secs = 120
    "#;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.rpc_port, 9640);
        assert_eq!(config.stale_lock_timeout(), Duration::from_secs(900));
        assert_eq!(config.budget.monthly_ceiling_cents, 50_000);
        assert!(!config.fail_fast_on_permanent);
        assert_ok!(config.validate(DEFAULT_HANDLER_TIMEOUT));
    }

    #[test]
    fn test_parse_toml() {
        let config = DaemonConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.budget.monthly_ceiling_cents, 20_000);
        assert_eq!(config.budget.normal_batch_size, 20);
        assert_eq!(config.handlers.len(), 1);

        let handler = &config.handlers[0];
        assert_eq!(handler.max_attempts, 5);
        assert_eq!(handler.base_delay_secs, 30);
        assert_eq!(handler.args, vec!["--quiet".to_string()]);
        assert_ok!(config.validate(Duration::from_secs(125)));
    }

    #[test]
    fn test_queue_overrides() {
        let config = DaemonConfig::from_toml(SAMPLE).unwrap();

        let feeds = config.queue_config(Queue::Feeds);
        assert_eq!(feeds.workers, 2);
        assert_eq!(feeds.batch_size, 10);
        assert_eq!(feeds.poll_interval, Duration::from_secs(5));

        let shots = config.queue_config(Queue::Screenshots);
        assert_eq!(shots.gate_capacity, Some(3));
    }

    #[test]
    fn test_stale_timeout_must_cover_handlers() {
        let config = DaemonConfig::from_toml(SAMPLE).unwrap();
        let err = config.validate(Duration::from_secs(601)).unwrap_err();
        assert!(err.to_string().contains("stale_lock_timeout_secs"));
    }

    #[test]
    fn test_unknown_queue_rejected() {
        let config = DaemonConfig::from_toml(
            r#"
            [[handlers]]
            job_type = "x"
            queue = "nightly"
            command = "true"
            "#,
        )
        .unwrap();
        assert_err!(config.validate(Duration::ZERO));
    }

    #[test]
    fn test_worker_id() {
        let ids = SequentialIds::new("w");
        let generated = DaemonConfig::default().worker_id(&ids);
        assert!(generated.contains(&std::process::id().to_string()));

        let config = DaemonConfig {
            worker_id: Some("box-7".to_string()),
            ..DaemonConfig::default()
        };
        assert_eq!(config.worker_id(&ids), "box-7");
    }

    #[test]
    fn test_memory_url_untouched() {
        let config = DaemonConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.database_url().unwrap(), "sqlite::memory:");
    }
}
