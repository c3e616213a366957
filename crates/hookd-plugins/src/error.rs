use std::path::PathBuf;

use hookd_rpc::RpcError;
use thiserror::Error;

/// Manifest, discovery and executable-resolution failures.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("failed to read plugin manifest {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse plugin manifest {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid plugin manifest: {0}")]
    Invalid(String),
    #[error("plugin directory '{}' is not readable: {source}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("plugin executable '{executable}' resolves outside bundle directory {}", bundle.display())]
    PathTraversal { executable: String, bundle: PathBuf },
    #[error("plugin executable '{}' is missing or not executable", path.display())]
    ExecutableNotFound { path: PathBuf },
}

/// Failures of a single supervised plugin process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error("failed to spawn plugin process {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("plugin '{identity}' did not complete its startup handshake within {timeout_ms}ms")]
    StartTimeout { identity: String, timeout_ms: u64 },
    #[error("plugin '{identity}' startup handshake failed: {source}")]
    Handshake {
        identity: String,
        #[source]
        source: RpcError,
    },
    #[error("plugin '{identity}' is unreachable: {source}")]
    Transport {
        identity: String,
        #[source]
        source: RpcError,
    },
    #[error("plugin '{identity}' returned an error: {message}")]
    Remote { identity: String, message: String },
    #[error("plugin '{identity}' process has exited")]
    Exited { identity: String },
}

impl SupervisorError {
    pub fn is_path_traversal(&self) -> bool {
        matches!(self, Self::Bundle(BundleError::PathTraversal { .. }))
    }

    pub fn is_executable_not_found(&self) -> bool {
        matches!(self, Self::Bundle(BundleError::ExecutableNotFound { .. }))
    }
}

/// Reasons an activation attempt left the plugin inactive.
#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("plugin '{0}' was not found in the plugin directory")]
    NotFound(String),
    #[error("plugin '{identity}' failed to load: {source}")]
    Bundle {
        identity: String,
        #[source]
        source: BundleError,
    },
    #[error("plugin '{identity}' failed to start: {source}")]
    Start {
        identity: String,
        #[source]
        source: SupervisorError,
    },
    #[error("plugin '{identity}' failed to activate: {message}")]
    OnActivate { identity: String, message: String },
    #[error("plugin '{identity}' did not finish OnActivate within {timeout_ms}ms")]
    OnActivateTimeout { identity: String, timeout_ms: u64 },
}

impl ActivationError {
    pub fn supervisor_error(&self) -> Option<&SupervisorError> {
        match self {
            Self::Start { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Outcomes of a hook dispatch that the triggering operation must handle.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("operation rejected by extension: {reason}")]
    RejectedByExtension { identity: String, reason: String },
    #[error("extension '{identity}' could not be reached: {source}")]
    TransportError {
        identity: String,
        #[source]
        source: SupervisorError,
    },
    #[error("plugin activation has not completed")]
    ActivationIncomplete,
    #[error("hook '{0}' is invoked by the plugin environment and cannot be triggered")]
    LifecycleHook(String),
}
