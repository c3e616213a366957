//! Method names and parameter shapes carried by request frames.

use hookd_core::HookContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Host -> plugin: invoke one hook.
pub const METHOD_HOOK_INVOKE: &str = "hook.invoke";
/// Plugin -> host: emit a log line through the host logger.
pub const METHOD_API_LOG: &str = "api.log";
/// Plugin -> host: store a value under a plugin-scoped key.
pub const METHOD_API_KV_SET: &str = "api.kv_set";
/// Plugin -> host: load a plugin-scoped value.
pub const METHOD_API_KV_GET: &str = "api.kv_get";
/// Plugin -> host: remove a plugin-scoped value.
pub const METHOD_API_KV_DELETE: &str = "api.kv_delete";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookInvocation {
    pub hook_id: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub context: HookContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl ApiLogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiLogParams {
    pub level: ApiLogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvSetParams {
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_in_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvKeyParams {
    pub key: String,
}
