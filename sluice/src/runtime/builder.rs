use std::fmt;
use std::sync::Arc;

use crate::config::{IsolationMode, PipesConfig};
use crate::extension::ExtensionRegistry;
use crate::reporter::{LoggingReporter, PipesReporter};

use super::supervisor::Supervisor;
use super::worker::Processor;

/// Builder for constructing a [`Supervisor`] with explicit dependencies.
///
/// The registry is always required. A processor is required for in-process
/// isolation; child-process workers bring their own. Without a reporter,
/// outcomes are logged through [`LoggingReporter`].
///
/// # Example
///
/// ```ignore
/// use sluice::*;
///
/// let registry = Arc::new(ExtensionRegistry::connect(&config.state_store, config.store_retry).await?);
/// let supervisor = SupervisorBuilder::new(config)
///     .with_registry(registry)
///     .with_processor(Arc::new(MyProcessor))
///     .with_reporter(Arc::new(MyReporter))
///     .build()?;
/// ```
pub struct SupervisorBuilder {
    config: PipesConfig,
    registry: Option<Arc<ExtensionRegistry>>,
    processor: Option<Arc<dyn Processor>>,
    reporter: Option<Arc<dyn PipesReporter>>,
}

impl fmt::Debug for SupervisorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorBuilder")
            .field("config", &self.config)
            .field("registry_set", &self.registry.is_some())
            .field("processor_set", &self.processor.is_some())
            .field("reporter_set", &self.reporter.is_some())
            .finish()
    }
}

impl SupervisorBuilder {
    /// Create a new builder with the given configuration.
    pub fn new(config: PipesConfig) -> Self {
        Self {
            config,
            registry: None,
            processor: None,
            reporter: None,
        }
    }

    /// Set the extension registry. Its state store also holds job status.
    pub fn with_registry(mut self, registry: Arc<ExtensionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the processor used by in-process workers.
    pub fn with_processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Set the reporter that receives every outcome.
    pub fn with_reporter(mut self, reporter: Arc<dyn PipesReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Build the `Supervisor`.
    ///
    /// # Errors
    ///
    /// Returns an error if a required dependency is missing or the
    /// configuration is invalid.
    pub fn build(self) -> anyhow::Result<Supervisor> {
        self.config.validate()?;

        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry dependency missing"))?;
        if matches!(self.config.isolation, IsolationMode::InProcess) && self.processor.is_none() {
            anyhow::bail!("processor dependency missing (required for in-process isolation)");
        }
        let reporter = self
            .reporter
            .unwrap_or_else(|| Arc::new(LoggingReporter));

        Ok(Supervisor::new(self.config, registry, self.processor, reporter))
    }
}
