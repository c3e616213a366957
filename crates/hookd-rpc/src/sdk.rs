//! Plugin-side SDK: serve hook invocations over stdin/stdout and call back
//! into the host API.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

use crate::{
    write_hello, ApiLogLevel, ApiLogParams, HookInvocation, KvKeyParams, KvSetParams, RpcPeer,
    RpcResult, METHOD_API_KV_DELETE, METHOD_API_KV_GET, METHOD_API_KV_SET, METHOD_API_LOG,
    METHOD_HOOK_INVOKE,
};

/// Implemented by plugin binaries.
///
/// The returned value is the hook response payload: `null` leaves a chained
/// value unchanged, `{"value": ..}` replaces it and `{"reject_reason": ..}`
/// vetoes the operation. An `Err` is reported to the host as a remote error.
#[async_trait]
pub trait PluginHandler: Send + Sync + 'static {
    async fn handle_hook(&self, api: &HostApi, invocation: HookInvocation)
        -> Result<Value, String>;
}

/// Handle for calling host services from inside a plugin.
#[derive(Clone)]
pub struct HostApi {
    peer: Arc<RpcPeer>,
}

impl HostApi {
    pub fn new(peer: Arc<RpcPeer>) -> Self {
        Self { peer }
    }

    pub async fn log(
        &self,
        level: ApiLogLevel,
        message: impl Into<String>,
        fields: Option<Value>,
    ) -> RpcResult<()> {
        let params = ApiLogParams {
            level,
            message: message.into(),
            fields,
        };
        self.peer
            .call(METHOD_API_LOG, serde_json::to_value(params)?)
            .await?;
        Ok(())
    }

    pub async fn log_debug(&self, message: impl Into<String>, fields: Option<Value>) -> RpcResult<()> {
        self.log(ApiLogLevel::Debug, message, fields).await
    }

    pub async fn log_info(&self, message: impl Into<String>, fields: Option<Value>) -> RpcResult<()> {
        self.log(ApiLogLevel::Info, message, fields).await
    }

    pub async fn log_warn(&self, message: impl Into<String>, fields: Option<Value>) -> RpcResult<()> {
        self.log(ApiLogLevel::Warn, message, fields).await
    }

    pub async fn log_error(&self, message: impl Into<String>, fields: Option<Value>) -> RpcResult<()> {
        self.log(ApiLogLevel::Error, message, fields).await
    }

    /// Stores `value` under `key`; `expire_in_seconds` of `None` or 0 keeps it forever.
    pub async fn kv_set(
        &self,
        key: impl Into<String>,
        value: Value,
        expire_in_seconds: Option<u64>,
    ) -> RpcResult<()> {
        let params = KvSetParams {
            key: key.into(),
            value,
            expire_in_seconds,
        };
        self.peer
            .call(METHOD_API_KV_SET, serde_json::to_value(params)?)
            .await?;
        Ok(())
    }

    pub async fn kv_get(&self, key: impl Into<String>) -> RpcResult<Option<Value>> {
        let params = KvKeyParams { key: key.into() };
        let value = self
            .peer
            .call(METHOD_API_KV_GET, serde_json::to_value(params)?)
            .await?;
        Ok((!value.is_null()).then_some(value))
    }

    pub async fn kv_delete(&self, key: impl Into<String>) -> RpcResult<()> {
        let params = KvKeyParams { key: key.into() };
        self.peer
            .call(METHOD_API_KV_DELETE, serde_json::to_value(params)?)
            .await?;
        Ok(())
    }
}

/// Serves `handler` on the process's stdin/stdout until the host closes stdin.
pub async fn serve_plugin<H>(handler: H) -> RpcResult<()>
where
    H: PluginHandler,
{
    serve_plugin_with_io(handler, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Writes the hello frame, then answers host requests until end-of-input.
pub async fn serve_plugin_with_io<H, R, W>(handler: H, reader: R, mut writer: W) -> RpcResult<()>
where
    H: PluginHandler,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    write_hello(&mut writer).await?;
    let (peer, mut incoming) = RpcPeer::spawn("host", BufReader::new(reader), writer);
    let api = HostApi::new(Arc::new(peer));
    let handler = Arc::new(handler);

    while let Some(mut request) = incoming.recv().await {
        let handler = handler.clone();
        let api = api.clone();
        let method = request.method.clone();
        let params = std::mem::take(&mut request.params);
        tokio::spawn(async move {
            let handled =
                tokio::spawn(async move { handle_request(handler, api, method, params).await })
                    .await;
            let outcome =
                handled.unwrap_or_else(|error| Err(format!("plugin handler failed: {error}")));
            request.respond(outcome).await;
        });
    }
    Ok(())
}

async fn handle_request<H>(
    handler: Arc<H>,
    api: HostApi,
    method: String,
    params: Value,
) -> Result<Value, String>
where
    H: PluginHandler,
{
    if method != METHOD_HOOK_INVOKE {
        return Err(format!("unsupported method '{method}'"));
    }
    let invocation: HookInvocation = serde_json::from_value(params)
        .map_err(|error| format!("invalid hook invocation: {error}"))?;
    handler.handle_hook(&api, invocation).await
}

#[cfg(test)]
mod tests {
    use super::{serve_plugin_with_io, HostApi, PluginHandler};
    use crate::{
        read_hello, ApiLogParams, HookInvocation, KvSetParams, RpcError, RpcPeer,
        METHOD_API_KV_GET, METHOD_API_KV_SET, METHOD_API_LOG, METHOD_HOOK_INVOKE,
    };
    use async_trait::async_trait;
    use hookd_core::HookContext;
    use serde_json::{json, Value};
    use tokio::io::{duplex, BufReader};

    struct EchoHandler;

    #[async_trait]
    impl PluginHandler for EchoHandler {
        async fn handle_hook(
            &self,
            api: &HostApi,
            invocation: HookInvocation,
        ) -> Result<Value, String> {
            match invocation.hook_id.as_str() {
                "Echo" => Ok(json!({ "value": invocation.args })),
                "LogContext" => {
                    api.log_info(
                        "context",
                        Some(json!({ "request_id": invocation.context.request_id })),
                    )
                    .await
                    .map_err(|error| error.to_string())?;
                    Ok(Value::Null)
                }
                "Remember" => {
                    api.kv_set("last", invocation.args.clone(), None)
                        .await
                        .map_err(|error| error.to_string())?;
                    let stored = api.kv_get("last").await.map_err(|error| error.to_string())?;
                    Ok(json!({ "value": stored }))
                }
                "Panic" => panic!("handler exploded"),
                other => Err(format!("unexpected hook {other}")),
            }
        }
    }

    async fn start_plugin() -> (RpcPeer, tokio::sync::mpsc::Receiver<crate::IncomingRequest>) {
        let (host_out, plugin_in) = duplex(16 * 1024);
        let (plugin_out, host_in) = duplex(16 * 1024);
        tokio::spawn(serve_plugin_with_io(EchoHandler, plugin_in, plugin_out));
        let mut host_in = BufReader::new(host_in);
        read_hello(&mut host_in).await.expect("hello");
        RpcPeer::spawn("plugin", host_in, host_out)
    }

    fn invocation(hook_id: &str, args: Value) -> Value {
        serde_json::to_value(HookInvocation {
            hook_id: hook_id.to_string(),
            args,
            context: HookContext {
                request_id: "req-1".to_string(),
                ..HookContext::default()
            },
        })
        .expect("serialize invocation")
    }

    #[tokio::test]
    async fn functional_serve_plugin_answers_hook_invocations() {
        let (host, _incoming) = start_plugin().await;
        let reply = host
            .call(METHOD_HOOK_INVOKE, invocation("Echo", json!("hi")))
            .await
            .expect("echo");
        assert_eq!(reply, json!({"value": "hi"}));
    }

    #[tokio::test]
    async fn functional_host_api_calls_reach_host_with_context_fields() {
        let (host, mut incoming) = start_plugin().await;
        let host_side = tokio::spawn(async move {
            let request = incoming.recv().await.expect("api request");
            assert_eq!(request.method, METHOD_API_LOG);
            let params: ApiLogParams =
                serde_json::from_value(request.params.clone()).expect("log params");
            request.respond(Ok(Value::Null)).await;
            params
        });

        let reply = host
            .call(METHOD_HOOK_INVOKE, invocation("LogContext", Value::Null))
            .await
            .expect("log context");
        assert_eq!(reply, Value::Null);
        let params = host_side.await.expect("host side");
        assert_eq!(params.message, "context");
        assert_eq!(params.fields, Some(json!({"request_id": "req-1"})));
    }

    #[tokio::test]
    async fn functional_host_api_kv_round_trip_through_host() {
        let (host, mut incoming) = start_plugin().await;
        tokio::spawn(async move {
            let mut stored = Value::Null;
            while let Some(request) = incoming.recv().await {
                match request.method.as_str() {
                    METHOD_API_KV_SET => {
                        let params: KvSetParams =
                            serde_json::from_value(request.params.clone()).expect("kv set");
                        stored = params.value;
                        request.respond(Ok(Value::Null)).await;
                    }
                    METHOD_API_KV_GET => {
                        let value = stored.clone();
                        request.respond(Ok(value)).await;
                    }
                    _ => request.respond(Err("unsupported".to_string())).await,
                }
            }
        });

        let reply = host
            .call(METHOD_HOOK_INVOKE, invocation("Remember", json!({"n": 7})))
            .await
            .expect("remember");
        assert_eq!(reply, json!({"value": {"n": 7}}));
    }

    #[tokio::test]
    async fn regression_serve_plugin_reports_handler_panics_and_unknown_methods() {
        let (host, _incoming) = start_plugin().await;
        let panicked = host
            .call(METHOD_HOOK_INVOKE, invocation("Panic", Value::Null))
            .await
            .expect_err("panic surfaces as remote error");
        assert!(matches!(panicked, RpcError::Remote(message) if message.contains("plugin handler failed")));

        let unknown = host
            .call("bogus.method", json!({}))
            .await
            .expect_err("unknown method");
        assert!(matches!(unknown, RpcError::Remote(message) if message.contains("unsupported method")));

        let still_alive = host
            .call(METHOD_HOOK_INVOKE, invocation("Echo", json!(1)))
            .await
            .expect("plugin keeps serving");
        assert_eq!(still_alive, json!({"value": 1}));
    }
}
