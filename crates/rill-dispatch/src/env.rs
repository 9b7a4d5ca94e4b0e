//! The environment: named dispatchers plus the shared timer.
//!
//! Graph construction looks dispatchers up here instead of in a
//! process-global registry. An environment is built once from an
//! [`EnvironmentConfig`], threaded through stream construction, and
//! shut down explicitly when the graphs it powers are done.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;

use crate::config::{ConfigError, DispatcherConfig, DispatcherKind};
use crate::task::Dispatcher;
use crate::timer::TimerService;

/// Builder-input for an [`Environment`].
#[derive(Clone, Debug)]
pub struct EnvironmentConfig {
    /// Dispatchers to construct, in registration order.
    pub dispatchers: Vec<DispatcherConfig>,
    /// Name of the dispatcher returned by
    /// [`Environment::default_dispatcher`]. Must be registered.
    pub default_dispatcher: String,
    /// Timer minimum resolution.
    pub timer_resolution: Duration,
}

impl Default for EnvironmentConfig {
    /// Three stock dispatchers: `sync` (inline), `shared` (one ordered
    /// worker, the default), and `work` (a pool sized to the machine).
    fn default() -> Self {
        Self {
            dispatchers: vec![
                DispatcherConfig::new("sync", DispatcherKind::Synchronous),
                DispatcherConfig::new("shared", DispatcherKind::SingleThread),
                DispatcherConfig::new("work", DispatcherKind::WorkPool),
            ],
            default_dispatcher: "shared".to_string(),
            timer_resolution: crate::timer::DEFAULT_RESOLUTION,
        }
    }
}

/// Registry of named dispatchers and the shared [`TimerService`].
pub struct Environment {
    dispatchers: IndexMap<String, Arc<dyn Dispatcher>>,
    default_name: String,
    timer: Arc<TimerService>,
}

// Compile-time assertion: Environment must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<Environment>();
};

impl Environment {
    /// Validate the config and construct every dispatcher.
    pub fn new(config: EnvironmentConfig) -> Result<Arc<Self>, ConfigError> {
        let mut dispatchers = IndexMap::new();
        for dispatcher_config in &config.dispatchers {
            dispatcher_config.validate()?;
            if dispatchers.contains_key(&dispatcher_config.name) {
                return Err(ConfigError::DuplicateName {
                    name: dispatcher_config.name.clone(),
                });
            }
            dispatchers.insert(dispatcher_config.name.clone(), dispatcher_config.build()?);
        }
        if !dispatchers.contains_key(&config.default_dispatcher) {
            return Err(ConfigError::UnknownDefault {
                name: config.default_dispatcher.clone(),
            });
        }
        Ok(Arc::new(Self {
            dispatchers,
            default_name: config.default_dispatcher,
            timer: Arc::new(TimerService::with_resolution(config.timer_resolution)),
        }))
    }

    /// An environment with the stock dispatcher set.
    pub fn with_defaults() -> Arc<Self> {
        Self::new(EnvironmentConfig::default()).expect("default environment config is valid")
    }

    /// Look up a dispatcher by name.
    pub fn dispatcher(&self, name: &str) -> Option<Arc<dyn Dispatcher>> {
        self.dispatchers.get(name).cloned()
    }

    /// The configured default dispatcher.
    pub fn default_dispatcher(&self) -> Arc<dyn Dispatcher> {
        self.dispatchers[&self.default_name].clone()
    }

    /// Registered dispatcher names, in registration order.
    pub fn dispatcher_names(&self) -> impl Iterator<Item = &str> {
        self.dispatchers.keys().map(String::as_str)
    }

    /// The shared timer service.
    pub fn timer(&self) -> &Arc<TimerService> {
        &self.timer
    }

    /// Shut down every dispatcher (draining up to `timeout` each) and
    /// the timer. Returns whether all queues drained cleanly.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let mut clean = true;
        for dispatcher in self.dispatchers.values() {
            clean &= dispatcher.shutdown(timeout);
        }
        self.timer.shutdown();
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_environment_has_stock_dispatchers() {
        let env = Environment::with_defaults();
        assert!(env.dispatcher("sync").is_some());
        assert!(env.dispatcher("shared").is_some());
        assert!(env.dispatcher("work").is_some());
        assert!(env.dispatcher("absent").is_none());
        assert_eq!(env.default_dispatcher().name(), "shared");
        assert!(env.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut config = EnvironmentConfig::default();
        config
            .dispatchers
            .push(DispatcherConfig::new("sync", DispatcherKind::Synchronous));
        assert!(matches!(
            Environment::new(config),
            Err(ConfigError::DuplicateName { .. })
        ));
    }

    #[test]
    fn unknown_default_is_rejected() {
        let mut config = EnvironmentConfig::default();
        config.default_dispatcher = "nope".to_string();
        assert!(matches!(
            Environment::new(config),
            Err(ConfigError::UnknownDefault { .. })
        ));
    }
}
