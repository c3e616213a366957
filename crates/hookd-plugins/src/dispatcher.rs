//! Hook fan-out across the active plugin set.

use std::sync::Arc;

use hookd_core::{dispatch_policy_for, DispatchPolicy, HookContext, HookResponse};
use serde_json::Value;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, info, warn};

use crate::{DispatchError, PluginEnvironment};

pub const NOTIFY_CONCURRENCY_DEFAULT: usize = 16;

/// Delivery outcome of a notify dispatch. Ids are sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifySummary {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
    pub panicked: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Chained(Value),
    Notified(NotifySummary),
}

#[derive(Clone)]
pub struct HookDispatcher {
    environment: PluginEnvironment,
    notify_concurrency: usize,
}

impl HookDispatcher {
    pub fn new(environment: PluginEnvironment, notify_concurrency: usize) -> Self {
        Self {
            environment,
            notify_concurrency: notify_concurrency.max(1),
        }
    }

    pub fn environment(&self) -> &PluginEnvironment {
        &self.environment
    }

    /// Passes `value` through every plugin declaring `hook_id`, in
    /// registration order.
    ///
    /// The first non-blank rejection stops the chain; any value sent with it
    /// is ignored. Unreachable plugins and malformed replies are logged and
    /// skipped as if the plugin had returned the value unchanged.
    pub async fn run_chained(
        &self,
        hook_id: &str,
        value: Value,
        context: &HookContext,
    ) -> Result<Value, DispatchError> {
        if !self.environment.is_activation_complete() {
            return Err(DispatchError::ActivationIncomplete);
        }

        let mut current = value;
        for (identity, supervisor) in self.environment.extensions_for_hook(hook_id) {
            let raw = match supervisor.dispatch(hook_id, current.clone(), context).await {
                Ok(raw) => raw,
                Err(source) => {
                    let error = DispatchError::TransportError { identity, source };
                    warn!(hook_id, error = %error, "skipping plugin for chained hook");
                    continue;
                }
            };
            let response = match HookResponse::from_value(raw) {
                Ok(response) => response,
                Err(error) => {
                    warn!(
                        plugin_id = %identity,
                        hook_id,
                        error = %error,
                        "ignoring malformed hook response"
                    );
                    continue;
                }
            };
            if let Some(reason) = response.rejection() {
                info!(plugin_id = %identity, hook_id, reason, "operation rejected by plugin");
                return Err(DispatchError::RejectedByExtension {
                    identity,
                    reason: reason.to_string(),
                });
            }
            if let Some(updated) = response.value {
                current = updated;
            }
        }
        Ok(current)
    }

    /// Delivers `args` to every plugin declaring `hook_id`, at most
    /// `notify_concurrency` at a time. Replies are discarded and one plugin's
    /// failure never blocks delivery to the others.
    pub async fn notify(&self, hook_id: &str, args: Value, context: &HookContext) -> NotifySummary {
        let mut summary = NotifySummary::default();
        if !self.environment.is_activation_complete() {
            debug!(hook_id, "notify skipped: plugin activation incomplete");
            return summary;
        }

        let semaphore = Arc::new(Semaphore::new(self.notify_concurrency));
        let mut tasks = JoinSet::new();
        for (identity, supervisor) in self.environment.extensions_for_hook(hook_id) {
            let semaphore = semaphore.clone();
            let hook_id = hook_id.to_string();
            let args = args.clone();
            let context = context.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = supervisor.dispatch(&hook_id, args, &context).await;
                (identity, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((identity, Ok(_))) => summary.delivered.push(identity),
                Ok((identity, Err(error))) => {
                    warn!(plugin_id = %identity, hook_id, error = %error, "notify hook failed");
                    summary.failed.push(identity);
                }
                Err(error) => {
                    warn!(hook_id, error = %error, "notify task aborted");
                    summary.panicked += 1;
                }
            }
        }
        summary.delivered.sort();
        summary.failed.sort();
        summary
    }

    /// Dispatches by the hook's catalog policy. Hooks missing from the
    /// catalog are treated as notifications.
    pub async fn trigger(
        &self,
        hook_id: &str,
        payload: Value,
        context: &HookContext,
    ) -> Result<TriggerOutcome, DispatchError> {
        match dispatch_policy_for(hook_id).unwrap_or(DispatchPolicy::Notify) {
            DispatchPolicy::Chained => self
                .run_chained(hook_id, payload, context)
                .await
                .map(TriggerOutcome::Chained),
            DispatchPolicy::Notify => Ok(TriggerOutcome::Notified(
                self.notify(hook_id, payload, context).await,
            )),
            DispatchPolicy::Lifecycle => Err(DispatchError::LifecycleHook(hook_id.to_string())),
        }
    }
}
