use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use hookd_core::{dispatch_policy_for, DispatchPolicy, HookContext};
use hookd_jobs::{MaintenanceScheduler, MaintenanceWorker, SchedulerConfig};
use hookd_plugins::{
    available_bundles, load_bundle, resolve_executable, ActivationReport, BundleDiscoveryReport,
    BundleInfo, NotifySummary, TriggerOutcome,
};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::bootstrap::{build_job_store, HookdRuntime};
use crate::cli_args::TriggerArgs;
use crate::config::HookdConfig;
use crate::maintenance::ExpiredPluginKeysTask;

pub(crate) fn render_bundle_list_report(report: &BundleDiscoveryReport) -> String {
    let mut lines = vec![format!(
        "plugin list: root={} count={} invalid={}",
        report.root.display(),
        report.bundles.len(),
        report.invalid_entries.len()
    )];
    for bundle in &report.bundles {
        lines.push(format!(
            "plugin: id={} version={} hooks={} manifest={}",
            bundle.manifest.id,
            bundle.manifest.version,
            render_list(&bundle.manifest.hooks),
            bundle.manifest_path.display()
        ));
    }
    for invalid in &report.invalid_entries {
        lines.push(format!(
            "invalid: manifest={} error={}",
            invalid.manifest_path.display(),
            invalid.error
        ));
    }
    lines.join("\n")
}

pub(crate) fn render_bundle_validation(bundle: &BundleInfo, executable: &Path) -> String {
    format!(
        "plugin valid: id={} version={} name={} hooks={} executable={}",
        bundle.manifest.id,
        bundle.manifest.version,
        bundle.manifest.display_name(),
        render_list(&bundle.manifest.hooks),
        executable.display()
    )
}

pub(crate) fn render_activation_report(report: &ActivationReport) -> String {
    let mut lines = vec![format!(
        "plugin activation: activated={} failed={} invalid={}",
        report.activated.len(),
        report.failed.len(),
        report.invalid_bundles
    )];
    for (plugin_id, error) in &report.failed {
        lines.push(format!("failed: id={plugin_id} error={error}"));
    }
    lines.join("\n")
}

pub(crate) fn render_trigger_outcome(hook_id: &str, outcome: &TriggerOutcome) -> String {
    match outcome {
        TriggerOutcome::Chained(value) => format!(
            "hook trigger: hook={} policy={}\nresult: {}",
            hook_id,
            DispatchPolicy::Chained.as_str(),
            value
        ),
        TriggerOutcome::Notified(summary) => format!(
            "hook trigger: hook={} policy={}\n{}",
            hook_id,
            DispatchPolicy::Notify.as_str(),
            render_notify_summary(summary)
        ),
    }
}

fn render_notify_summary(summary: &NotifySummary) -> String {
    format!(
        "notify: delivered={} failed={} panicked={}",
        render_list(&summary.delivered),
        render_list(&summary.failed),
        summary.panicked
    )
}

fn render_list(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(",")
    }
}

pub(crate) fn execute_list(config: &HookdConfig) -> Result<String> {
    let report = available_bundles(&config.plugins.directory).with_context(|| {
        format!(
            "failed to scan plugin directory {}",
            config.plugins.directory.display()
        )
    })?;
    Ok(render_bundle_list_report(&report))
}

pub(crate) fn execute_validate(bundle_dir: &Path) -> Result<String> {
    let bundle = load_bundle(bundle_dir)
        .with_context(|| format!("invalid plugin bundle {}", bundle_dir.display()))?;
    let executable = resolve_executable(&bundle)
        .with_context(|| format!("invalid plugin bundle {}", bundle_dir.display()))?;
    Ok(render_bundle_validation(&bundle, &executable))
}

pub(crate) fn trigger_context(args: &TriggerArgs) -> HookContext {
    HookContext {
        session_id: args.session_id.clone(),
        request_id: args.request_id.clone(),
        ip_address: args.ip_address.clone(),
        accept_language: args.accept_language.clone(),
        user_agent: args.user_agent.clone(),
    }
}

/// Activates the requested plugins, dispatches one hook and tears every
/// process down again, whether or not the dispatch succeeded.
pub(crate) async fn execute_trigger(config: &HookdConfig, args: &TriggerArgs) -> Result<String> {
    let hook_id = args.hook.trim();
    if hook_id.is_empty() {
        bail!("--hook must not be empty");
    }
    if dispatch_policy_for(hook_id) == Some(DispatchPolicy::Lifecycle) {
        bail!("hook '{hook_id}' is a lifecycle hook and cannot be triggered");
    }
    let payload: Value = serde_json::from_str(&args.payload)
        .with_context(|| format!("--payload is not valid JSON: {}", args.payload))?;
    if !config.plugins.enable {
        bail!("plugins are disabled by configuration (plugins.enable = false)");
    }

    let runtime = HookdRuntime::build(config);
    let environment = &runtime.environment;
    let mut lines = Vec::new();
    if args.plugins.is_empty() {
        let report = environment.activate_available().await;
        lines.push(render_activation_report(&report));
    } else {
        for plugin_id in &args.plugins {
            if let Err(error) = environment.activate(plugin_id).await {
                environment.shutdown().await;
                return Err(error).with_context(|| format!("failed to activate '{plugin_id}'"));
            }
        }
        environment.mark_activation_complete();
    }

    let outcome = runtime
        .dispatcher
        .trigger(hook_id, payload, &trigger_context(args))
        .await;
    environment.shutdown().await;
    let outcome = outcome?;
    lines.push(render_trigger_outcome(hook_id, &outcome));
    Ok(lines.join("\n"))
}

/// Runs until Ctrl-C: every bundle active, scheduler and worker running.
pub(crate) async fn execute_serve(config: &HookdConfig) -> Result<()> {
    let runtime = HookdRuntime::build(config);
    let environment = runtime.environment.clone();
    if config.plugins.enable {
        let report = environment.activate_available().await;
        for (plugin_id, error) in &report.failed {
            warn!(plugin_id = %plugin_id, error = %error, "plugin failed to activate");
        }
        info!(
            activated = report.activated.len(),
            failed = report.failed.len(),
            invalid = report.invalid_bundles,
            "plugin activation complete"
        );
    } else {
        info!("plugins disabled by configuration");
        environment.mark_activation_complete();
    }

    let store = build_job_store(config)?;
    let task = Arc::new(ExpiredPluginKeysTask::new(runtime.kv.clone()));
    let worker =
        MaintenanceWorker::new(config.jobs.worker_name.clone(), store.clone(), task).spawn();
    let scheduler = MaintenanceScheduler::new(
        store,
        worker.job_sender(),
        SchedulerConfig {
            interval: Duration::from_secs(config.jobs.maintenance_interval_secs),
            ..SchedulerConfig::default()
        },
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(async move { scheduler.run(shutdown_rx).await });
    info!(worker = %worker.name(), "hookd serving; press Ctrl-C to stop");

    let signal = tokio::signal::ctrl_c().await;
    if let Err(error) = &signal {
        warn!(error = %error, "failed to listen for Ctrl-C; shutting down");
    }
    info!("shutting down");

    shutdown_tx.send_replace(true);
    match scheduler_task.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => warn!(error = %error, "maintenance scheduler failed"),
        Err(error) => warn!(error = %error, "maintenance scheduler task failed"),
    }
    worker.stop().await;
    environment.shutdown().await;
    Ok(())
}
