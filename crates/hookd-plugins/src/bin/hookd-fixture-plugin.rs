//! Plugin used by the integration tests. Behaviour is driven by a
//! `fixture.json` in the working directory (the bundle directory).

use std::{fs::OpenOptions, io::Write, path::Path};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hookd_core::{HOOK_ON_ACTIVATE, HOOK_ON_DEACTIVATE};
use hookd_rpc::{serve_plugin, HookInvocation, HostApi, PluginHandler};
use serde::Deserialize;
use serde_json::{json, Value};

const FIXTURE_FILE: &str = "fixture.json";
const INVOCATION_LOG_FILE: &str = "invocations.log";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FixtureConfig {
    suffix: Option<String>,
    reject_reason: Option<String>,
    log_context: bool,
    fail_activate: Option<String>,
    exit_on_hook: Option<String>,
    remember_key: Option<String>,
}

impl FixtureConfig {
    fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }
}

struct FixturePlugin {
    config: FixtureConfig,
}

impl FixturePlugin {
    fn record(&self, invocation: &HookInvocation) -> Result<(), String> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(INVOCATION_LOG_FILE)
            .map_err(|error| error.to_string())?;
        writeln!(file, "{} {}", invocation.hook_id, invocation.args)
            .map_err(|error| error.to_string())
    }
}

#[async_trait]
impl PluginHandler for FixturePlugin {
    async fn handle_hook(
        &self,
        api: &HostApi,
        invocation: HookInvocation,
    ) -> Result<Value, String> {
        self.record(&invocation)?;

        if self.config.exit_on_hook.as_deref() == Some(invocation.hook_id.as_str()) {
            std::process::exit(3);
        }

        match invocation.hook_id.as_str() {
            HOOK_ON_ACTIVATE => {
                return match &self.config.fail_activate {
                    Some(message) => Err(message.clone()),
                    None => Ok(Value::Null),
                };
            }
            HOOK_ON_DEACTIVATE => return Ok(Value::Null),
            _ => {}
        }

        if self.config.log_context {
            let fields = serde_json::to_value(&invocation.context).map_err(|error| error.to_string())?;
            api.log_info(format!("hook {}", invocation.hook_id), Some(fields))
                .await
                .map_err(|error| error.to_string())?;
        }

        if let Some(key) = &self.config.remember_key {
            api.kv_set(key.as_str(), invocation.args.clone(), None)
                .await
                .map_err(|error| error.to_string())?;
        }

        let value = match (&self.config.suffix, invocation.args.as_str()) {
            (Some(suffix), Some(current)) => Some(json!(format!("{current}{suffix}"))),
            _ => None,
        };
        Ok(json!({
            "value": value,
            "reject_reason": self.config.reject_reason,
        }))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = FixtureConfig::load(Path::new(FIXTURE_FILE))?;
    serve_plugin(FixturePlugin { config }).await?;
    Ok(())
}
