//! Capability surface exposed to each plugin process over the RPC bridge.

use std::sync::Arc;

use async_trait::async_trait;
use hookd_rpc::{
    ApiLogLevel, ApiLogParams, KvKeyParams, KvSetParams, METHOD_API_KV_DELETE, METHOD_API_KV_GET,
    METHOD_API_KV_SET, METHOD_API_LOG,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::{KeyValueResult, KeyValueStore, PluginManifest};

/// Host services one plugin may call back into.
#[async_trait]
pub trait PluginApi: Send + Sync {
    async fn log(&self, level: ApiLogLevel, message: &str, fields: Option<&Value>);

    async fn kv_set(
        &self,
        key: &str,
        value: Value,
        expire_in_seconds: Option<u64>,
    ) -> KeyValueResult<()>;

    async fn kv_get(&self, key: &str) -> KeyValueResult<Option<Value>>;

    async fn kv_delete(&self, key: &str) -> KeyValueResult<()>;
}

/// Builds the capability object for a plugin at activation time.
pub trait ApiFactory: Send + Sync {
    fn api_for(&self, manifest: &PluginManifest) -> Arc<dyn PluginApi>;
}

impl<F> ApiFactory for F
where
    F: Fn(&PluginManifest) -> Arc<dyn PluginApi> + Send + Sync,
{
    fn api_for(&self, manifest: &PluginManifest) -> Arc<dyn PluginApi> {
        self(manifest)
    }
}

/// Production API: logs through `tracing` and stores data in a shared store.
pub struct HostPluginApi {
    plugin_id: String,
    kv: Arc<dyn KeyValueStore>,
}

impl HostPluginApi {
    pub fn new(plugin_id: impl Into<String>, kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            kv,
        }
    }
}

#[async_trait]
impl PluginApi for HostPluginApi {
    async fn log(&self, level: ApiLogLevel, message: &str, fields: Option<&Value>) {
        let fields = fields.map(Value::to_string).unwrap_or_default();
        let plugin_id = self.plugin_id.as_str();
        match level {
            ApiLogLevel::Debug => debug!(plugin_id, fields = %fields, "{message}"),
            ApiLogLevel::Info => info!(plugin_id, fields = %fields, "{message}"),
            ApiLogLevel::Warn => warn!(plugin_id, fields = %fields, "{message}"),
            ApiLogLevel::Error => error!(plugin_id, fields = %fields, "{message}"),
        }
    }

    async fn kv_set(
        &self,
        key: &str,
        value: Value,
        expire_in_seconds: Option<u64>,
    ) -> KeyValueResult<()> {
        self.kv
            .set(&self.plugin_id, key, value, expire_in_seconds)
            .await
    }

    async fn kv_get(&self, key: &str) -> KeyValueResult<Option<Value>> {
        self.kv.get(&self.plugin_id, key).await
    }

    async fn kv_delete(&self, key: &str) -> KeyValueResult<()> {
        self.kv.delete(&self.plugin_id, key).await
    }
}

/// Hands every plugin a [`HostPluginApi`] over one shared store.
#[derive(Clone)]
pub struct HostApiFactory {
    kv: Arc<dyn KeyValueStore>,
}

impl HostApiFactory {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }
}

impl ApiFactory for HostApiFactory {
    fn api_for(&self, manifest: &PluginManifest) -> Arc<dyn PluginApi> {
        Arc::new(HostPluginApi::new(manifest.id.clone(), self.kv.clone()))
    }
}

/// Routes one plugin-originated request to the matching API call.
pub async fn route_api_request(
    api: &dyn PluginApi,
    method: &str,
    params: Value,
) -> Result<Value, String> {
    match method {
        METHOD_API_LOG => {
            let params: ApiLogParams = decode_params(method, params)?;
            api.log(params.level, &params.message, params.fields.as_ref())
                .await;
            Ok(Value::Null)
        }
        METHOD_API_KV_SET => {
            let params: KvSetParams = decode_params(method, params)?;
            api.kv_set(&params.key, params.value, params.expire_in_seconds)
                .await
                .map_err(|error| error.to_string())?;
            Ok(Value::Null)
        }
        METHOD_API_KV_GET => {
            let params: KvKeyParams = decode_params(method, params)?;
            let value = api
                .kv_get(&params.key)
                .await
                .map_err(|error| error.to_string())?;
            Ok(value.unwrap_or(Value::Null))
        }
        METHOD_API_KV_DELETE => {
            let params: KvKeyParams = decode_params(method, params)?;
            api.kv_delete(&params.key)
                .await
                .map_err(|error| error.to_string())?;
            Ok(Value::Null)
        }
        other => Err(format!("unsupported api method '{other}'")),
    }
}

fn decode_params<T>(method: &str, params: Value) -> Result<T, String>
where
    T: DeserializeOwned,
{
    serde_json::from_value(params).map_err(|error| format!("invalid params for {method}: {error}"))
}
