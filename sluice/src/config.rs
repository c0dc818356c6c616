use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipesError;
use crate::extension::{ExtensionDescriptor, ExtensionKind};
use crate::retry::StoreRetryConfig;
use crate::state::LOCAL_PLUGIN_ID;

/// Where a worker slot runs its items.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum IsolationMode {
    /// A tokio task in the supervisor's process. Timeouts abort the task, but
    /// a processor that blocks a runtime thread or aborts the process cannot
    /// be contained.
    #[default]
    InProcess,
    /// A dedicated worker executable per slot, killed on timeout or crash.
    ChildProcess(ChildProcessConfig),
}

/// Settings for [`IsolationMode::ChildProcess`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChildProcessConfig {
    /// Worker executable speaking the line protocol on stdin/stdout.
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// How long a fresh child may take to announce itself ready.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// Recycle the child after this many items.
    #[serde(default = "default_max_items_per_process")]
    pub max_items_per_process: u64,
    /// How long a child may take to exit after a shutdown request.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_startup_timeout_ms() -> u64 {
    60_000
}

fn default_max_items_per_process() -> u64 {
    10_000
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

impl ChildProcessConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            startup_timeout_ms: default_startup_timeout_ms(),
            max_items_per_process: default_max_items_per_process(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_startup_timeout(mut self, ms: u64) -> Self {
        self.startup_timeout_ms = ms;
        self
    }

    pub fn with_max_items_per_process(mut self, max: u64) -> Self {
        self.max_items_per_process = max;
        self
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Background deletion of idle extension registrations.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExpiryConfig {
    pub max_idle_ms: u64,
    pub sweep_interval_ms: u64,
}

/// Top-level configuration for a [`Supervisor`](crate::runtime::Supervisor).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipesConfig {
    /// Number of worker slots.
    pub num_workers: usize,
    /// Wall-clock budget per item before the slot is terminated.
    pub per_item_timeout_ms: u64,
    /// How long in-flight items may run after a cancel request.
    pub shutdown_grace_ms: u64,
    /// Capacity of the intake channel between source and dispatcher.
    pub queue_size: usize,
    pub isolation: IsolationMode,
    /// Backend for extension registrations and job status.
    pub state_store: ExtensionDescriptor,
    pub store_retry: StoreRetryConfig,
    pub expiry: Option<ExpiryConfig>,
}

impl Default for PipesConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            per_item_timeout_ms: 60_000,
            shutdown_grace_ms: 30_000,
            queue_size: 10_000,
            isolation: IsolationMode::default(),
            state_store: ExtensionDescriptor::new(
                LOCAL_PLUGIN_ID,
                ExtensionKind::StateStore,
                serde_json::Value::Null,
            ),
            store_retry: StoreRetryConfig::default(),
            expiry: None,
        }
    }
}

impl PipesConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self, PipesError> {
        let config: PipesConfig = serde_json::from_str(json)
            .map_err(|err| PipesError::config(format!("invalid pipes config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipesError> {
        if self.num_workers == 0 {
            return Err(PipesError::config("num_workers must be at least 1"));
        }
        if self.per_item_timeout_ms == 0 {
            return Err(PipesError::config("per_item_timeout_ms must be positive"));
        }
        if self.queue_size == 0 {
            return Err(PipesError::config("queue_size must be at least 1"));
        }
        if self.state_store.kind != ExtensionKind::StateStore {
            return Err(PipesError::config(format!(
                "state_store must be a statestore descriptor, got `{}`",
                self.state_store.kind
            )));
        }
        if let IsolationMode::ChildProcess(child) = &self.isolation {
            if child.program.is_empty() {
                return Err(PipesError::config("child process program must be set"));
            }
            if child.max_items_per_process == 0 {
                return Err(PipesError::config("max_items_per_process must be at least 1"));
            }
        }
        Ok(())
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_per_item_timeout(mut self, ms: u64) -> Self {
        self.per_item_timeout_ms = ms;
        self
    }

    pub fn with_shutdown_grace(mut self, ms: u64) -> Self {
        self.shutdown_grace_ms = ms;
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationMode) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_state_store(mut self, descriptor: ExtensionDescriptor) -> Self {
        self.state_store = descriptor;
        self
    }

    pub fn with_store_retry(mut self, retry: StoreRetryConfig) -> Self {
        self.store_retry = retry;
        self
    }

    pub fn with_expiry(mut self, expiry: ExpiryConfig) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn per_item_timeout(&self) -> Duration {
        Duration::from_millis(self.per_item_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
