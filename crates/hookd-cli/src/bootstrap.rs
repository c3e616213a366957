use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookd_jobs::{InMemoryJobStore, JobStore, SqliteJobStore};
use hookd_plugins::{
    EnvironmentOptions, HookDispatcher, HostApiFactory, InMemoryKeyValueStore, KeyValueStore,
    PluginEnvironment, SupervisorOptions,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{filter::Directive, EnvFilter};

use crate::config::{HookdConfig, JobStoreKind};

/// Installs the global subscriber. `RUST_LOG` overrides `default_filter`.
pub(crate) fn init_tracing(default_filter: &str) {
    let directive = default_filter
        .parse::<Directive>()
        .unwrap_or_else(|_| LevelFilter::INFO.into());
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

pub(crate) fn environment_options(config: &HookdConfig) -> EnvironmentOptions {
    EnvironmentOptions {
        plugin_dir: config.plugins.directory.clone(),
        supervisor: SupervisorOptions {
            startup_timeout: Duration::from_millis(config.plugins.startup_timeout_ms),
            stop_grace: Duration::from_millis(config.plugins.stop_grace_ms),
        },
    }
}

pub(crate) fn build_job_store(config: &HookdConfig) -> Result<Arc<dyn JobStore>> {
    match config.jobs.store {
        JobStoreKind::Memory => Ok(Arc::new(InMemoryJobStore::new())),
        JobStoreKind::Sqlite => {
            let store = SqliteJobStore::new(&config.jobs.sqlite_path).with_context(|| {
                format!(
                    "failed to open job store {}",
                    config.jobs.sqlite_path.display()
                )
            })?;
            Ok(Arc::new(store))
        }
    }
}

/// Shared runtime wiring: one key/value store, one environment and a
/// dispatcher over it.
pub(crate) struct HookdRuntime {
    pub(crate) kv: Arc<dyn KeyValueStore>,
    pub(crate) environment: PluginEnvironment,
    pub(crate) dispatcher: HookDispatcher,
}

impl HookdRuntime {
    pub(crate) fn build(config: &HookdConfig) -> Self {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
        let factory = Arc::new(HostApiFactory::new(kv.clone()));
        let environment = PluginEnvironment::new(environment_options(config), factory);
        let dispatcher =
            HookDispatcher::new(environment.clone(), config.plugins.notify_concurrency);
        Self {
            kv,
            environment,
            dispatcher,
        }
    }
}
