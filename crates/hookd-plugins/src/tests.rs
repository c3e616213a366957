//! Tests for bundle validation, the key/value store, API routing and the
//! process supervisor.

use super::{
    available_bundles, load_bundle, resolve_executable, route_api_request,
    validate_plugin_manifest, BundleError, BundleInfo, HostPluginApi, InMemoryKeyValueStore,
    KeyValueError, KeyValueStore, PluginBackend, PluginManifest, Supervisor, SupervisorError,
    SupervisorOptions, PLUGIN_KEY_MAX_LEN,
};
use hookd_core::HookContext;
use hookd_rpc::{RpcError, METHOD_API_KV_DELETE, METHOD_API_KV_GET, METHOD_API_KV_SET, METHOD_API_LOG};
use serde_json::{json, Value};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};
use tempfile::tempdir;
use tokio::sync::{Mutex, MutexGuard};

const HELLO_LINE: &str = r#"{"kind":"hello","protocol_version":1}"#;

async fn process_test_guard() -> MutexGuard<'static, ()> {
    static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
    GUARD.get_or_init(|| Mutex::new(())).lock().await
}

fn make_executable(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = fs::metadata(path).expect("metadata").permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(path, permissions).expect("set executable permissions");
    }
}

fn manifest(id: &str, executable: &str, hooks: &[&str]) -> PluginManifest {
    PluginManifest {
        schema_version: 1,
        id: id.to_string(),
        version: "1.0.0".to_string(),
        name: None,
        backend: PluginBackend {
            executable: executable.to_string(),
        },
        hooks: hooks.iter().map(|hook| hook.to_string()).collect(),
    }
}

fn write_bundle(root: &Path, dir_name: &str, manifest: &PluginManifest) -> PathBuf {
    let bundle_dir = root.join(dir_name);
    fs::create_dir_all(&bundle_dir).expect("create bundle dir");
    fs::write(
        bundle_dir.join("plugin.json"),
        serde_json::to_string_pretty(manifest).expect("serialize manifest"),
    )
    .expect("write manifest");
    bundle_dir
}

fn write_script_bundle(root: &Path, id: &str, script_body: &str) -> BundleInfo {
    let bundle_dir = write_bundle(root, id, &manifest(id, "backend.sh", &[]));
    let script = bundle_dir.join("backend.sh");
    fs::write(&script, format!("#!/bin/sh\n{script_body}\n")).expect("write script");
    make_executable(&script);
    load_bundle(&bundle_dir).expect("load bundle")
}

fn quick_options() -> SupervisorOptions {
    SupervisorOptions {
        startup_timeout: Duration::from_millis(2_000),
        stop_grace: Duration::from_millis(200),
    }
}

fn host_api() -> Arc<HostPluginApi> {
    Arc::new(HostPluginApi::new(
        "fixture.plugin",
        Arc::new(InMemoryKeyValueStore::new()),
    ))
}

#[test]
fn unit_validate_plugin_manifest_accepts_minimal_manifest() {
    let temp = tempdir().expect("tempdir");
    let bundle_dir = temp.path().join("demo");
    fs::create_dir_all(&bundle_dir).expect("create dir");
    fs::write(
        bundle_dir.join("plugin.json"),
        r#"{
  "id": "com.example.demo",
  "version": "0.1.0",
  "backend": { "executable": "bin/demo" }
}"#,
    )
    .expect("write manifest");

    let bundle = load_bundle(&bundle_dir).expect("valid bundle");
    assert_eq!(bundle.manifest.schema_version, 1);
    assert_eq!(bundle.manifest.id, "com.example.demo");
    assert!(bundle.manifest.hooks.is_empty());
    assert_eq!(bundle.manifest.display_name(), "com.example.demo");
    assert_eq!(bundle.manifest_path, bundle_dir.join("plugin.json"));
}

#[test]
fn regression_validate_plugin_manifest_rejects_bad_fields() {
    let mut duplicate_hooks = manifest("demo.plugin", "run.sh", &["OnActivate", "OnActivate"]);
    let error = validate_plugin_manifest(&duplicate_hooks).expect_err("duplicate hooks");
    assert!(error.to_string().contains("duplicate entry 'OnActivate'"));

    duplicate_hooks.hooks.clear();
    duplicate_hooks.schema_version = 2;
    let error = validate_plugin_manifest(&duplicate_hooks).expect_err("schema version");
    assert!(error.to_string().contains("unsupported schema_version 2"));

    for bad_id in ["ab", "has space", "slash/id", ""] {
        let error = validate_plugin_manifest(&manifest(bad_id, "run.sh", &[]))
            .expect_err("invalid id should fail");
        assert!(matches!(error, BundleError::Invalid(_)), "id {bad_id:?}");
    }

    let error = validate_plugin_manifest(&manifest("demo.plugin", "  ", &[]))
        .expect_err("empty executable");
    assert!(error.to_string().contains("'backend.executable' must not be empty"));
}

#[test]
fn functional_available_bundles_reports_invalid_and_duplicate_entries_in_path_order() {
    let temp = tempdir().expect("tempdir");
    write_bundle(temp.path(), "b-second", &manifest("plugin.two", "run.sh", &[]));
    write_bundle(temp.path(), "a-first", &manifest("plugin.one", "run.sh", &[]));
    write_bundle(temp.path(), "c-duplicate", &manifest("plugin.one", "run.sh", &[]));
    let broken = temp.path().join("d-broken");
    fs::create_dir_all(&broken).expect("create broken");
    fs::write(broken.join("plugin.json"), "{ not json").expect("write broken");
    fs::create_dir_all(temp.path().join("e-no-manifest")).expect("create empty bundle");
    fs::write(temp.path().join("stray.json"), "{}").expect("write stray file");

    let report = available_bundles(temp.path()).expect("discovery");
    let ids: Vec<&str> = report
        .bundles
        .iter()
        .map(|bundle| bundle.manifest.id.as_str())
        .collect();
    assert_eq!(ids, vec!["plugin.one", "plugin.two"]);
    assert_eq!(report.invalid_entries.len(), 2);
    assert!(report.invalid_entries[0]
        .error
        .contains("duplicate plugin id 'plugin.one'"));
    assert!(report.invalid_entries[1]
        .error
        .contains("failed to parse plugin manifest"));
    assert!(report.find("plugin.two").is_some());
}

#[test]
fn unit_available_bundles_treats_missing_root_as_empty() {
    let temp = tempdir().expect("tempdir");
    let report = available_bundles(&temp.path().join("missing")).expect("missing root");
    assert!(report.bundles.is_empty());
    assert!(report.invalid_entries.is_empty());
}

#[test]
fn regression_resolve_executable_rejects_paths_escaping_bundle() {
    let temp = tempdir().expect("tempdir");
    let outside = temp.path().join("outside.sh");
    fs::write(&outside, "#!/bin/sh\n").expect("write outside");
    make_executable(&outside);

    for executable in ["../outside.sh", "/foo/../../backend.exe", "bin/../../outside.sh"] {
        let dir = write_bundle(temp.path(), "escape", &manifest("escape.plugin", executable, &[]));
        let bundle = load_bundle(&dir).expect("manifest itself is valid");
        let error = resolve_executable(&bundle).expect_err("escape should fail");
        assert!(
            matches!(error, BundleError::PathTraversal { .. }),
            "{executable}: {error}"
        );
    }
}

#[cfg(unix)]
#[test]
fn regression_resolve_executable_rejects_symlink_escaping_bundle() {
    let temp = tempdir().expect("tempdir");
    let outside = temp.path().join("outside.sh");
    fs::write(&outside, "#!/bin/sh\n").expect("write outside");
    make_executable(&outside);
    let dir = write_bundle(temp.path(), "linked", &manifest("linked.plugin", "backend", &[]));
    std::os::unix::fs::symlink(&outside, dir.join("backend")).expect("symlink");

    let bundle = load_bundle(&dir).expect("bundle");
    let error = resolve_executable(&bundle).expect_err("symlink escape should fail");
    assert!(matches!(error, BundleError::PathTraversal { .. }));
}

#[test]
fn regression_resolve_executable_reports_missing_and_non_executable_files() {
    let temp = tempdir().expect("tempdir");
    let dir = write_bundle(temp.path(), "missing", &manifest("missing.plugin", "bin/none", &[]));
    let bundle = load_bundle(&dir).expect("bundle");
    assert!(matches!(
        resolve_executable(&bundle),
        Err(BundleError::ExecutableNotFound { .. })
    ));

    fs::write(dir.join("plain.sh"), "#!/bin/sh\n").expect("write plain");
    let mut bundle = bundle;
    bundle.manifest.backend.executable = "plain.sh".to_string();
    if cfg!(unix) {
        assert!(matches!(
            resolve_executable(&bundle),
            Err(BundleError::ExecutableNotFound { .. })
        ));
    }

    make_executable(&dir.join("plain.sh"));
    let resolved = resolve_executable(&bundle).expect("executable resolves");
    assert!(resolved.ends_with("plain.sh"));
}

#[tokio::test]
async fn functional_in_memory_kv_store_namespaces_keys_and_expires_entries() {
    let store = InMemoryKeyValueStore::new();
    store
        .set_at("plugin.a", "shared", json!(1), None, 1_000)
        .await
        .expect("set a");
    store
        .set_at("plugin.b", "shared", json!(2), Some(5), 1_000)
        .await
        .expect("set b");

    assert_eq!(
        store.get_at("plugin.a", "shared", 1_000).await.expect("get a"),
        Some(json!(1))
    );
    assert_eq!(
        store.get_at("plugin.b", "shared", 5_999).await.expect("get b"),
        Some(json!(2))
    );
    assert_eq!(
        store.get_at("plugin.b", "shared", 6_000).await.expect("get b expired"),
        None
    );

    assert_eq!(store.delete_expired_at(5_999).await, 0);
    assert_eq!(store.delete_expired_at(6_000).await, 1);
    assert_eq!(store.len().await, 1);

    store.delete("plugin.a", "shared").await.expect("delete");
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn regression_in_memory_kv_store_rejects_invalid_keys() {
    let store = InMemoryKeyValueStore::new();
    assert_eq!(
        store.set("plugin.a", "", json!(1), None).await,
        Err(KeyValueError::EmptyKey)
    );
    let long_key = "k".repeat(PLUGIN_KEY_MAX_LEN + 1);
    assert!(matches!(
        store.get("plugin.a", &long_key).await,
        Err(KeyValueError::KeyTooLong { .. })
    ));
    assert_eq!(store.delete_all_expired().await, Ok(0));
}

#[tokio::test]
async fn functional_route_api_request_serves_log_and_kv_calls() {
    let api = host_api();

    let logged = route_api_request(
        api.as_ref(),
        METHOD_API_LOG,
        json!({"level": "info", "message": "hello", "fields": {"k": "v"}}),
    )
    .await
    .expect("log");
    assert_eq!(logged, Value::Null);

    route_api_request(
        api.as_ref(),
        METHOD_API_KV_SET,
        json!({"key": "counter", "value": {"n": 3}}),
    )
    .await
    .expect("kv set");
    let loaded = route_api_request(api.as_ref(), METHOD_API_KV_GET, json!({"key": "counter"}))
        .await
        .expect("kv get");
    assert_eq!(loaded, json!({"n": 3}));

    route_api_request(api.as_ref(), METHOD_API_KV_DELETE, json!({"key": "counter"}))
        .await
        .expect("kv delete");
    let missing = route_api_request(api.as_ref(), METHOD_API_KV_GET, json!({"key": "counter"}))
        .await
        .expect("kv get after delete");
    assert_eq!(missing, Value::Null);
}

#[tokio::test]
async fn regression_route_api_request_rejects_unknown_methods_and_bad_params() {
    let api = host_api();
    let error = route_api_request(api.as_ref(), "api.format_disk", json!({}))
        .await
        .expect_err("unknown method");
    assert!(error.contains("unsupported api method"));

    let error = route_api_request(api.as_ref(), METHOD_API_KV_SET, json!({"value": 1}))
        .await
        .expect_err("missing key");
    assert!(error.contains("invalid params for api.kv_set"));

    let error = route_api_request(api.as_ref(), METHOD_API_KV_GET, json!({"key": ""}))
        .await
        .expect_err("empty key");
    assert!(error.contains("must not be empty"));
}

#[tokio::test]
async fn functional_supervisor_stops_cooperative_process_without_kill() {
    let _guard = process_test_guard().await;
    let temp = tempdir().expect("tempdir");
    let bundle = write_script_bundle(
        temp.path(),
        "cooperative",
        &format!("printf '%s\\n' '{HELLO_LINE}'\ncat > /dev/null"),
    );

    let supervisor = Supervisor::start(&bundle, host_api(), &quick_options())
        .await
        .expect("start");
    assert!(supervisor.is_alive());
    assert!(supervisor.pid().is_some());

    let exit = supervisor.stop().await.expect("exit recorded");
    assert!(!exit.killed);
    assert_eq!(exit.code, Some(0));
    assert!(!supervisor.is_alive());
    assert_eq!(supervisor.stop().await, Some(exit));
}

#[tokio::test]
async fn regression_supervisor_kills_process_ignoring_shutdown_after_grace() {
    let _guard = process_test_guard().await;
    let temp = tempdir().expect("tempdir");
    let bundle = write_script_bundle(
        temp.path(),
        "stubborn",
        &format!("printf '%s\\n' '{HELLO_LINE}'\nexec sleep 30"),
    );

    let supervisor = Supervisor::start(&bundle, host_api(), &quick_options())
        .await
        .expect("start");
    let started = Instant::now();
    let exit = supervisor.stop().await.expect("exit recorded");
    assert!(exit.killed);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn regression_supervisor_reports_handshake_failure_when_process_exits_early() {
    let _guard = process_test_guard().await;
    let temp = tempdir().expect("tempdir");
    let bundle = write_script_bundle(temp.path(), "early-exit", "exit 1");

    let error = Supervisor::start(&bundle, host_api(), &quick_options())
        .await
        .err()
        .expect("early exit should fail");
    assert!(matches!(
        error,
        SupervisorError::Handshake {
            source: RpcError::Closed,
            ..
        }
    ));
}

#[tokio::test]
async fn regression_supervisor_dispatch_fails_fast_after_process_exit() {
    let _guard = process_test_guard().await;
    let temp = tempdir().expect("tempdir");
    let bundle = write_script_bundle(
        temp.path(),
        "short-lived",
        &format!("printf '%s\\n' '{HELLO_LINE}'\nexit 0"),
    );

    let supervisor = Supervisor::start(&bundle, host_api(), &quick_options())
        .await
        .expect("start");
    let exit = supervisor.wait_exited().await.expect("exit");
    assert!(!exit.killed);

    let error = supervisor
        .dispatch("MessageWillBePosted", json!("x"), &HookContext::default())
        .await
        .expect_err("dispatch after exit");
    assert!(matches!(error, SupervisorError::Exited { .. }));
}

#[tokio::test]
async fn regression_supervisor_start_rejects_nonexistent_and_escaping_executables() {
    let temp = tempdir().expect("tempdir");
    let dir = write_bundle(temp.path(), "ghost", &manifest("ghost.plugin", "backend.exe", &[]));
    let bundle = load_bundle(&dir).expect("bundle");
    let error = Supervisor::start(&bundle, host_api(), &quick_options())
        .await
        .err()
        .expect("missing executable");
    assert!(error.is_executable_not_found());

    let mut escaping = bundle.clone();
    escaping.manifest.backend.executable = "/foo/../../backend.exe".to_string();
    let error = Supervisor::start(&escaping, host_api(), &quick_options())
        .await
        .err()
        .expect("escaping executable");
    assert!(error.is_path_traversal());
}
