//! Execution backends: two strategies for driving isolated units through one
//! create/attach/stop/remove state machine.

mod container;
mod sandbox;

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{CheckedInLocation, GlobalConfig, ProjectConfig};

pub use container::ContainerBackend;
pub use sandbox::SandboxBackend;

/// Which backend drives a unit.
#[derive(
    Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Docker sandbox (MicroVM) execution
    #[default]
    Sandbox,
    /// Standard Docker container execution
    Container,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Sandbox => write!(f, "sandbox"),
            BackendKind::Container => write!(f, "container"),
        }
    }
}

/// Lifecycle state of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    NotCreated,
    Stopped,
    Running,
}

impl InstanceStatus {
    /// Map an external tool's status string onto the state machine.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => InstanceStatus::Running,
            "" => InstanceStatus::NotCreated,
            _ => InstanceStatus::Stopped,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::NotCreated => write!(f, "not-created"),
            InstanceStatus::Stopped => write!(f, "stopped"),
            InstanceStatus::Running => write!(f, "running"),
        }
    }
}

/// Backend-agnostic view of a unit. Recomputed on every query, never cached
/// across invocations.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub id: String,
    pub name: String,
    pub status: InstanceStatus,
    pub image: String,
    pub workspace: PathBuf,
    pub backend: BackendKind,
}

/// Options for a `run` invocation.
pub struct RunOptions<'a> {
    /// Workspace directory to mount
    pub workspace: &'a Path,

    /// Extra profiles for this session, merged with the project's
    pub profiles: Vec<String>,

    /// Force a template rebuild even when the tag already exists
    pub force_rebuild: bool,

    /// Pass the external tool's debug flag through
    pub debug: bool,

    /// Mount the Docker socket (container backend only)
    pub mount_docker_socket: bool,

    pub global: &'a GlobalConfig,
    pub project: &'a ProjectConfig,
    pub checked_in: Option<&'a CheckedInLocation>,
}

/// The shared capability interface both backends implement.
///
/// State machine per (workspace, backend) pair:
/// absent -> created/stopped -> running -> stopped -> removed. Transitions
/// are driven by explicit commands, never spontaneously.
pub trait Backend {
    /// The backend kind tag
    fn kind(&self) -> BackendKind;

    /// Start or attach to a unit for the workspace. Always re-materializes
    /// the handoff directory first, because host configuration may have
    /// changed since the unit was last started; builds and creates only when
    /// no unit exists.
    fn run(&self, opts: &RunOptions) -> Result<()>;

    /// Open an interactive shell in the running unit
    fn shell(&self, workspace: &Path) -> Result<()>;

    /// Stop the unit, optionally removing it. Returns `None` (and performs
    /// no external-tool invocation) when nothing is running.
    fn stop(&self, workspace: &Path, remove: bool) -> Result<Option<InstanceInfo>>;

    /// Find the unit for a workspace, in any state
    fn find(&self, workspace: &Path) -> Result<Option<InstanceInfo>>;

    /// Find the unit only if it is running
    fn find_running(&self, workspace: &Path) -> Result<Option<InstanceInfo>>;

    /// All units managed by this backend
    fn list(&self) -> Result<Vec<InstanceInfo>>;

    /// Remove a unit by id
    fn remove(&self, id: &str) -> Result<()>;

    /// Snapshot the unit's live state-home into the workspace cache
    fn save_cache(&self, workspace: &Path) -> Result<()>;

    /// Remove all backend-specific resources for a workspace
    fn cleanup(&self, workspace: &Path) -> Result<()>;

    /// Whether units remember their mount set permanently at creation time.
    /// Only then can mount drift occur; otherwise the detector is a no-op.
    fn pins_mounts(&self) -> bool;
}

/// Construct the backend for a kind.
pub fn get(kind: BackendKind, config: &GlobalConfig) -> Box<dyn Backend + '_> {
    match kind {
        BackendKind::Sandbox => Box::new(SandboxBackend::new(config)),
        BackendKind::Container => Box::new(ContainerBackend::new(config)),
    }
}

/// Generate the stable unit name for a workspace:
/// `agentbox-<sanitized basename>`, restricted to letters, digits, hyphens
/// and underscores.
pub fn generate_instance_name(workspace: &Path) -> String {
    let basename = workspace
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let re = Regex::new(r"[^a-zA-Z0-9_-]").expect("static pattern");
    let mut sanitized = re.replace_all(&basename, "-").to_string();

    while sanitized.contains("--") {
        sanitized = sanitized.replace("--", "-");
    }
    let sanitized = sanitized.trim_matches('-');

    let name = if sanitized.is_empty() {
        "workspace"
    } else {
        sanitized
    };
    format!("agentbox-{}", name)
}

/// Check whether we are already running inside a sandboxed unit, so `shell`
/// can refuse to nest.
pub fn is_inside_sandbox() -> bool {
    if Path::new("/.dockerenv").exists() {
        return true;
    }

    // The sandbox runs as the 'agent' user
    std::env::var("USER").is_ok_and(|u| u == "agent")
        || std::env::var("HOME").is_ok_and(|h| h == "/home/agent")
}

/// Merge project profiles with session profiles, dropping duplicates while
/// preserving first-seen order.
pub fn merge_profiles(project: &[String], session: &[String]) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();
    for profile in project.iter().chain(session.iter()) {
        if !result.contains(profile) {
            result.push(profile.clone());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_name_sanitized() {
        assert_eq!(
            generate_instance_name(Path::new("/home/me/My Project!")),
            "agentbox-My-Project"
        );
        assert_eq!(
            generate_instance_name(Path::new("/srv/app_v2")),
            "agentbox-app_v2"
        );
        assert_eq!(
            generate_instance_name(Path::new("/srv/a--b")),
            "agentbox-a-b"
        );
    }

    #[test]
    fn instance_name_falls_back_for_empty_basename() {
        assert_eq!(generate_instance_name(Path::new("/!!!")), "agentbox-workspace");
    }

    #[test]
    fn status_parsing() {
        assert_eq!(InstanceStatus::parse("running"), InstanceStatus::Running);
        assert_eq!(InstanceStatus::parse("Running"), InstanceStatus::Running);
        assert_eq!(InstanceStatus::parse("exited"), InstanceStatus::Stopped);
        assert_eq!(InstanceStatus::parse("stopped"), InstanceStatus::Stopped);
        assert_eq!(InstanceStatus::parse(""), InstanceStatus::NotCreated);
    }

    #[test]
    fn merge_profiles_dedups_in_order() {
        let project = vec!["go".to_string(), "rust".to_string()];
        let session = vec!["rust".to_string(), "docker".to_string()];
        assert_eq!(
            merge_profiles(&project, &session),
            vec!["go", "rust", "docker"]
        );
    }
}
