//! The active plugin set: activation, deactivation, hook lookup and reaping
//! of crashed processes.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use hookd_core::{HookContext, HOOK_ON_ACTIVATE, HOOK_ON_DEACTIVATE};
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::{
    available_bundles, load_bundle, ActivationError, ApiFactory, BundleInfo, PluginManifest,
    ProcessExit, Supervisor, SupervisorError, SupervisorOptions,
};

const LIFECYCLE_REQUEST_ID: &str = "plugin-lifecycle";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentOptions {
    pub plugin_dir: PathBuf,
    pub supervisor: SupervisorOptions,
}

impl EnvironmentOptions {
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            supervisor: SupervisorOptions::default(),
        }
    }
}

struct ActiveExtension {
    sequence: u64,
    manifest: PluginManifest,
    supervisor: Arc<Supervisor>,
}

#[derive(Default)]
struct ActiveSet {
    // Registration order.
    entries: Vec<Arc<ActiveExtension>>,
}

impl ActiveSet {
    fn find(&self, plugin_id: &str) -> Option<&Arc<ActiveExtension>> {
        self.entries
            .iter()
            .find(|entry| entry.manifest.id == plugin_id)
    }

    fn without(&self, predicate: impl Fn(&ActiveExtension) -> bool) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|entry| !predicate(entry))
                .cloned()
                .collect(),
        }
    }
}

struct EnvironmentInner {
    options: EnvironmentOptions,
    api_factory: Arc<dyn ApiFactory>,
    active: ArcSwap<ActiveSet>,
    mutation: Mutex<()>,
    next_sequence: AtomicU64,
    activation_complete: AtomicBool,
}

/// Result of activating every discovered bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    pub activated: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub invalid_bundles: usize,
}

/// Owns every supervised plugin. Cheap to clone.
///
/// All mutation goes through [`activate`](Self::activate) and
/// [`deactivate`](Self::deactivate), serialized by one lock; readers load an
/// immutable snapshot and never observe a half-registered plugin.
#[derive(Clone)]
pub struct PluginEnvironment {
    inner: Arc<EnvironmentInner>,
}

impl PluginEnvironment {
    pub fn new(options: EnvironmentOptions, api_factory: Arc<dyn ApiFactory>) -> Self {
        Self {
            inner: Arc::new(EnvironmentInner {
                options,
                api_factory,
                active: ArcSwap::from_pointee(ActiveSet::default()),
                mutation: Mutex::new(()),
                next_sequence: AtomicU64::new(1),
                activation_complete: AtomicBool::new(false),
            }),
        }
    }

    pub fn plugin_dir(&self) -> &Path {
        self.inner.options.plugin_dir.as_path()
    }

    /// Starts the plugin with this id. Already-active ids return their manifest.
    ///
    /// On any failure the id stays absent from the active set.
    pub async fn activate(&self, plugin_id: &str) -> Result<PluginManifest, ActivationError> {
        let _guard = self.inner.mutation.lock().await;
        if let Some(existing) = self.inner.active.load().find(plugin_id) {
            return Ok(existing.manifest.clone());
        }

        let bundle = self.find_bundle(plugin_id)?;
        let api = self.inner.api_factory.api_for(&bundle.manifest);
        let supervisor = Supervisor::start(&bundle, api, &self.inner.options.supervisor)
            .await
            .map_err(|source| ActivationError::Start {
                identity: plugin_id.to_string(),
                source,
            })?;

        if bundle.manifest.declares_hook(HOOK_ON_ACTIVATE) {
            let context = HookContext::system(LIFECYCLE_REQUEST_ID);
            let timeout = self.inner.options.supervisor.startup_timeout;
            let outcome = tokio::time::timeout(
                timeout,
                supervisor.dispatch(HOOK_ON_ACTIVATE, Value::Null, &context),
            )
            .await;
            let error = match outcome {
                Ok(Ok(_)) => None,
                Ok(Err(SupervisorError::Remote { message, .. })) => {
                    Some(ActivationError::OnActivate {
                        identity: plugin_id.to_string(),
                        message,
                    })
                }
                Ok(Err(other)) => Some(ActivationError::OnActivate {
                    identity: plugin_id.to_string(),
                    message: other.to_string(),
                }),
                Err(_) => {
                    warn!(plugin_id, "plugin OnActivate timed out; stopping process");
                    Some(ActivationError::OnActivateTimeout {
                        identity: plugin_id.to_string(),
                        timeout_ms: duration_ms(timeout),
                    })
                }
            };
            if let Some(error) = error {
                supervisor.stop().await;
                return Err(error);
            }
        }

        let entry = Arc::new(ActiveExtension {
            sequence: self.inner.next_sequence.fetch_add(1, Ordering::Relaxed),
            manifest: bundle.manifest.clone(),
            supervisor: Arc::new(supervisor),
        });
        let mut entries = self.inner.active.load().entries.clone();
        entries.push(entry.clone());
        self.inner.active.store(Arc::new(ActiveSet { entries }));
        spawn_reaper(
            Arc::downgrade(&self.inner),
            entry.manifest.id.clone(),
            entry.sequence,
            entry.supervisor.exit_watch(),
        );

        info!(
            plugin_id,
            version = %bundle.manifest.version,
            hooks = bundle.manifest.hooks.len(),
            "plugin activated"
        );
        Ok(bundle.manifest)
    }

    /// Removes the plugin from the active set, runs `OnDeactivate` when
    /// declared and stops the process. Returns false when it was not active.
    pub async fn deactivate(&self, plugin_id: &str) -> bool {
        let _guard = self.inner.mutation.lock().await;
        let current = self.inner.active.load_full();
        let Some(entry) = current.find(plugin_id).cloned() else {
            debug!(plugin_id, "deactivate ignored: plugin not active");
            return false;
        };
        self.inner
            .active
            .store(Arc::new(current.without(|candidate| {
                candidate.sequence == entry.sequence
            })));

        if entry.manifest.declares_hook(HOOK_ON_DEACTIVATE) && entry.supervisor.is_alive() {
            let context = HookContext::system(LIFECYCLE_REQUEST_ID);
            let grace = self.inner.options.supervisor.stop_grace;
            match tokio::time::timeout(
                grace,
                entry
                    .supervisor
                    .dispatch(HOOK_ON_DEACTIVATE, Value::Null, &context),
            )
            .await
            {
                Ok(Ok(_)) => {}
                Ok(Err(error)) => warn!(plugin_id, error = %error, "plugin OnDeactivate failed"),
                Err(_) => warn!(
                    plugin_id,
                    grace_ms = duration_ms(grace),
                    "plugin OnDeactivate timed out"
                ),
            }
        }
        entry.supervisor.stop().await;
        info!(plugin_id, "plugin deactivated");
        true
    }

    /// Activates every valid bundle in the plugin directory, in path order,
    /// then marks activation complete.
    pub async fn activate_available(&self) -> ActivationReport {
        let mut report = ActivationReport::default();
        match available_bundles(self.plugin_dir()) {
            Ok(discovery) => {
                report.invalid_bundles = discovery.invalid_entries.len();
                for invalid in &discovery.invalid_entries {
                    warn!(
                        manifest = %invalid.manifest_path.display(),
                        error = %invalid.error,
                        "skipping invalid plugin bundle"
                    );
                }
                for bundle in &discovery.bundles {
                    let plugin_id = bundle.manifest.id.as_str();
                    match self.activate(plugin_id).await {
                        Ok(_) => report.activated.push(plugin_id.to_string()),
                        Err(error) => {
                            warn!(plugin_id, error = %error, "extension failed to load");
                            report.failed.push((plugin_id.to_string(), error.to_string()));
                        }
                    }
                }
            }
            Err(error) => warn!(error = %error, "plugin discovery failed"),
        }
        self.mark_activation_complete();
        report
    }

    /// Deactivates every active plugin, newest first.
    pub async fn shutdown(&self) {
        let mut ids = self.active_ids();
        ids.reverse();
        for plugin_id in ids {
            self.deactivate(&plugin_id).await;
        }
    }

    /// Ids of live plugins whose manifest declares `hook_id`, in registration order.
    pub fn hooks_for_id(&self, hook_id: &str) -> Vec<String> {
        self.extensions_for_hook(hook_id)
            .into_iter()
            .map(|(plugin_id, _)| plugin_id)
            .collect()
    }

    pub(crate) fn extensions_for_hook(&self, hook_id: &str) -> Vec<(String, Arc<Supervisor>)> {
        self.inner
            .active
            .load()
            .entries
            .iter()
            .filter(|entry| entry.manifest.declares_hook(hook_id) && entry.supervisor.is_alive())
            .map(|entry| (entry.manifest.id.clone(), entry.supervisor.clone()))
            .collect()
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.inner
            .active
            .load()
            .entries
            .iter()
            .map(|entry| entry.manifest.id.clone())
            .collect()
    }

    pub fn is_active(&self, plugin_id: &str) -> bool {
        self.inner.active.load().find(plugin_id).is_some()
    }

    pub fn manifest(&self, plugin_id: &str) -> Option<PluginManifest> {
        self.inner
            .active
            .load()
            .find(plugin_id)
            .map(|entry| entry.manifest.clone())
    }

    pub fn mark_activation_complete(&self) {
        self.inner.activation_complete.store(true, Ordering::SeqCst);
    }

    pub fn is_activation_complete(&self) -> bool {
        self.inner.activation_complete.load(Ordering::SeqCst)
    }

    fn find_bundle(&self, plugin_id: &str) -> Result<BundleInfo, ActivationError> {
        let bundle_error = |source| ActivationError::Bundle {
            identity: plugin_id.to_string(),
            source,
        };
        let discovery = available_bundles(self.plugin_dir()).map_err(bundle_error)?;
        if let Some(bundle) = discovery.find(plugin_id) {
            return Ok(bundle.clone());
        }

        // Surface the manifest error for a bundle directory named after the id.
        let candidate = self.plugin_dir().join(plugin_id);
        if candidate.is_dir() {
            let bundle = load_bundle(&candidate).map_err(bundle_error)?;
            if bundle.manifest.id == plugin_id {
                return Ok(bundle);
            }
        }
        Err(ActivationError::NotFound(plugin_id.to_string()))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn spawn_reaper(
    inner: Weak<EnvironmentInner>,
    plugin_id: String,
    sequence: u64,
    mut exit_rx: watch::Receiver<Option<ProcessExit>>,
) {
    tokio::spawn(async move {
        let _ = exit_rx.wait_for(Option::is_some).await;
        let exit = *exit_rx.borrow();
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let _guard = inner.mutation.lock().await;
        let current = inner.active.load_full();
        if !current
            .entries
            .iter()
            .any(|entry| entry.sequence == sequence)
        {
            return;
        }
        inner
            .active
            .store(Arc::new(current.without(|entry| entry.sequence == sequence)));
        warn!(
            plugin_id = %plugin_id,
            exit_code = ?exit.and_then(|exit| exit.code),
            "plugin process exited unexpectedly; removed from active set"
        );
    });
}
