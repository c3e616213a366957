//! Plugin bundle manifests: loading, validation, discovery and backend
//! executable resolution.

use std::{
    collections::HashSet,
    fs,
    path::{Component, Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::BundleError;

pub const PLUGIN_MANIFEST_FILE: &str = "plugin.json";
const PLUGIN_MANIFEST_SCHEMA_VERSION: u32 = 1;
const PLUGIN_ID_MIN_LEN: usize = 3;
const PLUGIN_ID_MAX_LEN: usize = 190;

fn default_schema_version() -> u32 {
    PLUGIN_MANIFEST_SCHEMA_VERSION
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginBackend {
    /// Path of the backend executable, relative to the bundle directory.
    pub executable: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub backend: PluginBackend,
    #[serde(default)]
    pub hooks: Vec<String>,
}

impl PluginManifest {
    pub fn declares_hook(&self, hook_id: &str) -> bool {
        self.hooks.iter().any(|hook| hook == hook_id)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

/// A validated manifest together with the directory it was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleInfo {
    pub path: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest: PluginManifest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidBundle {
    pub manifest_path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleDiscoveryReport {
    pub root: PathBuf,
    pub bundles: Vec<BundleInfo>,
    pub invalid_entries: Vec<InvalidBundle>,
}

impl BundleDiscoveryReport {
    pub fn find(&self, plugin_id: &str) -> Option<&BundleInfo> {
        self.bundles
            .iter()
            .find(|bundle| bundle.manifest.id == plugin_id)
    }
}

pub fn load_plugin_manifest(path: &Path) -> Result<PluginManifest, BundleError> {
    let raw = fs::read_to_string(path).map_err(|source| BundleError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| BundleError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads and validates `<bundle_dir>/plugin.json`.
pub fn load_bundle(bundle_dir: &Path) -> Result<BundleInfo, BundleError> {
    let manifest_path = bundle_dir.join(PLUGIN_MANIFEST_FILE);
    let manifest = load_plugin_manifest(&manifest_path)?;
    validate_plugin_manifest(&manifest)?;
    Ok(BundleInfo {
        path: bundle_dir.to_path_buf(),
        manifest_path,
        manifest,
    })
}

pub fn validate_plugin_manifest(manifest: &PluginManifest) -> Result<(), BundleError> {
    if manifest.schema_version != PLUGIN_MANIFEST_SCHEMA_VERSION {
        return Err(BundleError::Invalid(format!(
            "unsupported schema_version {}: expected {}",
            manifest.schema_version, PLUGIN_MANIFEST_SCHEMA_VERSION
        )));
    }
    validate_non_empty_field("id", &manifest.id)?;
    validate_non_empty_field("version", &manifest.version)?;
    if !is_valid_plugin_id(&manifest.id) {
        return Err(BundleError::Invalid(format!(
            "id '{}' must be {}..={} characters of [A-Za-z0-9._-]",
            manifest.id, PLUGIN_ID_MIN_LEN, PLUGIN_ID_MAX_LEN
        )));
    }
    validate_non_empty_field("backend.executable", &manifest.backend.executable)?;

    let mut seen = HashSet::new();
    for hook in &manifest.hooks {
        if hook.trim().is_empty() {
            return Err(BundleError::Invalid(
                "'hooks' must not contain empty entries".to_string(),
            ));
        }
        if !seen.insert(hook.as_str()) {
            return Err(BundleError::Invalid(format!(
                "'hooks' contains duplicate entry '{hook}'"
            )));
        }
    }
    Ok(())
}

fn validate_non_empty_field(name: &str, value: &str) -> Result<(), BundleError> {
    if value.trim().is_empty() {
        return Err(BundleError::Invalid(format!("'{name}' must not be empty")));
    }
    Ok(())
}

fn is_valid_plugin_id(id: &str) -> bool {
    (PLUGIN_ID_MIN_LEN..=PLUGIN_ID_MAX_LEN).contains(&id.len())
        && id.chars().all(|character| {
            character.is_ascii_alphanumeric()
                || character == '-'
                || character == '_'
                || character == '.'
        })
}

/// Scans `root` one level deep for bundle directories containing a manifest.
///
/// A missing root yields an empty report. Bundles whose id repeats an
/// earlier (path-ordered) bundle are reported as invalid.
pub fn available_bundles(root: &Path) -> Result<BundleDiscoveryReport, BundleError> {
    let mut report = BundleDiscoveryReport {
        root: root.to_path_buf(),
        bundles: Vec::new(),
        invalid_entries: Vec::new(),
    };
    if !root.exists() {
        return Ok(report);
    }

    let mut seen_ids = HashSet::new();
    for manifest_path in discover_manifest_paths(root)? {
        let bundle_dir = manifest_path.parent().unwrap_or(root).to_path_buf();
        match load_bundle(&bundle_dir) {
            Ok(bundle) if !seen_ids.insert(bundle.manifest.id.clone()) => {
                report.invalid_entries.push(InvalidBundle {
                    error: format!("duplicate plugin id '{}'", bundle.manifest.id),
                    manifest_path,
                });
            }
            Ok(bundle) => report.bundles.push(bundle),
            Err(error) => report.invalid_entries.push(InvalidBundle {
                manifest_path,
                error: error.to_string(),
            }),
        }
    }
    Ok(report)
}

fn discover_manifest_paths(root: &Path) -> Result<Vec<PathBuf>, BundleError> {
    let directory_error = |source| BundleError::Directory {
        path: root.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in fs::read_dir(root).map_err(directory_error)? {
        let path = entry.map_err(directory_error)?.path();
        if !path.is_dir() {
            continue;
        }
        let manifest_path = path.join(PLUGIN_MANIFEST_FILE);
        if manifest_path.is_file() {
            paths.push(manifest_path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Resolves the backend executable and checks it stays inside the bundle.
///
/// The declared path is normalized lexically first, then canonicalized so
/// symlinks pointing outside the bundle are caught as well.
pub fn resolve_executable(bundle: &BundleInfo) -> Result<PathBuf, BundleError> {
    let executable = bundle.manifest.backend.executable.trim();
    let traversal = || BundleError::PathTraversal {
        executable: executable.to_string(),
        bundle: bundle.path.clone(),
    };
    if !stays_within_root(Path::new(executable)) {
        return Err(traversal());
    }

    let root = bundle
        .path
        .canonicalize()
        .map_err(|source| BundleError::Directory {
            path: bundle.path.clone(),
            source,
        })?;
    let candidate = root.join(executable);
    let resolved = candidate
        .canonicalize()
        .map_err(|_| BundleError::ExecutableNotFound {
            path: candidate.clone(),
        })?;
    if !resolved.starts_with(&root) {
        return Err(traversal());
    }
    if !resolved.is_file() || !is_executable(&resolved) {
        return Err(BundleError::ExecutableNotFound { path: resolved });
    }
    Ok(resolved)
}

fn stays_within_root(path: &Path) -> bool {
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => return false,
            Component::ParentDir => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            Component::CurDir => {}
            Component::Normal(_) => depth += 1,
        }
    }
    depth > 0
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    fs::metadata(path)
        .map(|metadata| metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
