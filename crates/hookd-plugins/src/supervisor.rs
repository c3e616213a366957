//! One supervised plugin subprocess: spawn, handshake, hook calls, exit
//! monitoring and graceful stop.

use std::{
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use hookd_core::HookContext;
use hookd_rpc::{
    read_hello, HookInvocation, IncomingRequest, RpcError, RpcPeer, METHOD_HOOK_INVOKE,
};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStderr, Command},
    sync::{mpsc, watch},
};
use tracing::{debug, info, warn};

use crate::{resolve_executable, route_api_request, BundleInfo, PluginApi, SupervisorError};

pub const PLUGIN_STARTUP_TIMEOUT_MS_DEFAULT: u64 = 3_000;
pub const PLUGIN_STOP_GRACE_MS_DEFAULT: u64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorOptions {
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_millis(PLUGIN_STARTUP_TIMEOUT_MS_DEFAULT),
            stop_grace: Duration::from_millis(PLUGIN_STOP_GRACE_MS_DEFAULT),
        }
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    /// True when the supervisor killed the process itself.
    pub killed: bool,
}

pub struct Supervisor {
    identity: String,
    pid: Option<u32>,
    peer: RpcPeer,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    kill_tx: watch::Sender<bool>,
    stop_requested: AtomicBool,
    stop_grace: Duration,
}

impl Supervisor {
    /// Spawns the bundle's backend and waits for its handshake.
    ///
    /// The handshake is bounded by `options.startup_timeout`; a process that
    /// misses it is killed before the error is returned.
    pub async fn start(
        bundle: &BundleInfo,
        api: Arc<dyn PluginApi>,
        options: &SupervisorOptions,
    ) -> Result<Self, SupervisorError> {
        let identity = bundle.manifest.id.clone();
        let executable = resolve_executable(bundle)?;
        let spawn_error = |source| SupervisorError::Spawn {
            path: executable.clone(),
            source,
        };

        let mut child = Command::new(&executable)
            .current_dir(&bundle.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error(std::io::Error::other("stdin was not captured")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(std::io::Error::other("stdout was not captured")))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(identity.clone(), stderr));
        }

        let mut stdout = BufReader::new(stdout);
        match tokio::time::timeout(options.startup_timeout, read_hello(&mut stdout)).await {
            Ok(Ok(_)) => {}
            Ok(Err(source)) => {
                terminate(&identity, &mut child).await;
                return Err(SupervisorError::Handshake { identity, source });
            }
            Err(_) => {
                terminate(&identity, &mut child).await;
                return Err(SupervisorError::StartTimeout {
                    identity,
                    timeout_ms: duration_ms(options.startup_timeout),
                });
            }
        }

        let (peer, incoming) = RpcPeer::spawn(format!("plugin:{identity}"), stdout, stdin);
        tokio::spawn(serve_api_requests(identity.clone(), api, incoming));

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = watch::channel(false);
        tokio::spawn(monitor_process(identity.clone(), child, kill_rx, exit_tx));

        info!(plugin_id = %identity, pid = ?pid, "plugin process started");
        Ok(Self {
            identity,
            pid,
            peer,
            exit_rx,
            kill_tx,
            stop_requested: AtomicBool::new(false),
            stop_grace: options.stop_grace,
        })
    }

    pub fn identity(&self) -> &str {
        self.identity.as_str()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Invokes one hook and returns the plugin's raw reply.
    ///
    /// Calls against an exited process fail immediately.
    pub async fn dispatch(
        &self,
        hook_id: &str,
        args: Value,
        context: &HookContext,
    ) -> Result<Value, SupervisorError> {
        if !self.is_alive() {
            return Err(SupervisorError::Exited {
                identity: self.identity.clone(),
            });
        }
        let invocation = HookInvocation {
            hook_id: hook_id.to_string(),
            args,
            context: context.clone(),
        };
        let params = serde_json::to_value(invocation).map_err(|error| SupervisorError::Transport {
            identity: self.identity.clone(),
            source: RpcError::from(error),
        })?;
        match self.peer.call(METHOD_HOOK_INVOKE, params).await {
            Ok(value) => Ok(value),
            Err(RpcError::Remote(message)) => Err(SupervisorError::Remote {
                identity: self.identity.clone(),
                message,
            }),
            Err(source) => Err(SupervisorError::Transport {
                identity: self.identity.clone(),
                source,
            }),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none() && !self.peer.is_closed()
    }

    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// Returns a watch that receives the exit state once the process ends.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }

    pub async fn wait_exited(&self) -> Option<ProcessExit> {
        wait_for_exit(self.exit_rx.clone()).await
    }

    /// Closes the plugin's stdin, waits out the grace period and then kills
    /// the process. Safe to call repeatedly; every caller waits for exit.
    pub async fn stop(&self) -> Option<ProcessExit> {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            debug!(plugin_id = %self.identity, "stopping plugin process");
            self.peer.close_writer();
            let exited_in_grace =
                tokio::time::timeout(self.stop_grace, wait_for_exit(self.exit_rx.clone()))
                    .await
                    .is_ok();
            if !exited_in_grace {
                warn!(
                    plugin_id = %self.identity,
                    grace_ms = duration_ms(self.stop_grace),
                    "plugin ignored shutdown request; killing"
                );
                self.kill_tx.send_replace(true);
            }
        }
        self.wait_exited().await
    }
}

async fn wait_for_exit(mut exit_rx: watch::Receiver<Option<ProcessExit>>) -> Option<ProcessExit> {
    let _ = exit_rx.wait_for(Option::is_some).await;
    let exit = *exit_rx.borrow();
    exit
}

async fn terminate(identity: &str, child: &mut Child) {
    if let Err(error) = child.kill().await {
        warn!(plugin_id = identity, error = %error, "failed to kill plugin process");
    }
}

async fn monitor_process(
    identity: String,
    mut child: Child,
    mut kill_rx: watch::Receiver<bool>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill_rx.wait_for(|kill| *kill) => None,
    };
    let (status, killed) = match exited {
        Some(status) => (status, false),
        None => {
            if let Err(error) = child.start_kill() {
                warn!(plugin_id = %identity, error = %error, "failed to kill plugin process");
            }
            (child.wait().await, true)
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(error) => {
            warn!(plugin_id = %identity, error = %error, "failed to wait for plugin process");
            None
        }
    };
    if killed {
        debug!(plugin_id = %identity, "plugin process killed");
    } else {
        info!(plugin_id = %identity, exit_code = ?code, "plugin process exited");
    }
    exit_tx.send_replace(Some(ProcessExit { code, killed }));
}

async fn serve_api_requests(
    identity: String,
    api: Arc<dyn PluginApi>,
    mut incoming: mpsc::Receiver<IncomingRequest>,
) {
    while let Some(mut request) = incoming.recv().await {
        let api = api.clone();
        tokio::spawn(async move {
            let params = std::mem::take(&mut request.params);
            let outcome = route_api_request(api.as_ref(), &request.method, params).await;
            request.respond(outcome).await;
        });
    }
    debug!(plugin_id = %identity, "plugin api channel closed");
}

async fn forward_stderr(identity: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            info!(plugin_id = %identity, stderr = %line, "plugin output");
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
