//! Layered configuration: global config, per-workspace project config, and
//! the checked-in `.agentbox.yaml` discovered by walking up from the
//! workspace. Merging is pure; all I/O happens in the load/save functions.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::backend::BackendKind;

/// Name of the checked-in config file discovered by upward walk.
pub const CHECKED_IN_FILE: &str = ".agentbox.yaml";

/// Configuration errors are reported with the offending value, never
/// silently defaulted.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid volume specification {spec:?} in {file} (expected 'host:dest[:ro]')")]
    InvalidVolumeSpec { spec: String, file: String },

    #[error("invalid volume option {option:?} in {spec:?} in {file} (expected 'ro')")]
    InvalidVolumeOption {
        option: String,
        spec: String,
        file: String,
    },

    #[error("failed to parse {file}: {source}")]
    Parse {
        file: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Docker socket mount policy.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SocketPolicy {
    /// Mount the socket only when explicitly requested
    #[default]
    Auto,
    /// Always mount the socket
    Always,
    /// Never mount the socket
    Never,
}

/// Global configuration, stored at `~/.config/agentbox/config.yaml`.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct GlobalConfig {
    /// Path to the agent's home directory on the host (default: ~/.claude)
    pub agent_home: PathBuf,

    /// Path to agentbox's own data directory (default: ~/.config/agentbox)
    pub data_dir: PathBuf,

    /// Docker socket mount policy
    pub docker_socket: SocketPolicy,

    /// Profiles enabled for every new project
    pub default_profiles: Vec<String>,

    /// Backend used when neither CLI, checked-in, nor project config picks one
    pub default_backend: Option<BackendKind>,

    /// Env specs shared with every sandbox (NAME or NAME=value)
    pub envs: Vec<String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        let home = home::home_dir().unwrap_or_else(|| PathBuf::from("/"));
        Self {
            agent_home: home.join(".claude"),
            data_dir: home.join(".config").join("agentbox"),
            docker_socket: SocketPolicy::Auto,
            default_profiles: Vec::new(),
            default_backend: None,
            envs: Vec::new(),
        }
    }
}

impl GlobalConfig {
    fn default_path() -> PathBuf {
        GlobalConfig::default().data_dir.join("config.yaml")
    }

    /// Load the global configuration, synthesizing defaults when the file is
    /// absent. Paths are tilde-expanded and made absolute.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config:no global config, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: GlobalConfig =
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
                file: path.display().to_string(),
                source: e,
            })?;

        config.agent_home = expand_path(&config.agent_home);
        config.data_dir = expand_path(&config.data_dir);

        debug!(
            path = %path.display(),
            agent_home = %config.agent_home.display(),
            data_dir = %config.data_dir.display(),
            "config:loaded global config"
        );
        Ok(config)
    }

    /// Persist the global configuration back to its well-known path.
    pub fn save(&self) -> Result<()> {
        let path = self.data_dir.join("config.yaml");
        fs::create_dir_all(&self.data_dir).with_context(|| {
            format!("Failed to create data directory {}", self.data_dir.display())
        })?;

        let yaml = serde_yaml::to_string(self).context("Failed to serialize config")?;
        fs::write(&path, yaml)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;

        debug!(path = %path.display(), "config:saved global config");
        Ok(())
    }
}

/// Per-workspace configuration, stored under
/// `<data_dir>/projects/<hash>/config.yaml` where `<hash>` is derived from
/// the absolute workspace path.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct ProjectConfig {
    /// Absolute workspace path, stored so projects can be listed by path
    pub workspace_path: PathBuf,

    /// Active profiles for this project
    pub profiles: Vec<String>,

    /// Extra volumes to mount, as `host:dest[:ro]` specs
    pub volumes: Vec<String>,

    /// Docker socket policy override
    pub docker_socket: Option<SocketPolicy>,

    /// Env specs for this project
    pub envs: Vec<String>,

    /// Backend override
    pub backend: Option<BackendKind>,

    /// Generated stable instance name
    pub instance_name: Option<String>,
}

impl ProjectConfig {
    /// Load the project config for a workspace, returning defaults when none
    /// was saved yet, together with the workspace hash.
    pub fn load(global: &GlobalConfig, workspace: &Path) -> Result<(Self, String)> {
        let abs = absolute(workspace)?;
        let hash = workspace_hash(&abs);
        let path = global
            .data_dir
            .join("projects")
            .join(&hash)
            .join("config.yaml");

        if !path.exists() {
            debug!(
                workspace = %abs.display(),
                hash = %hash,
                "config:no project config, using defaults"
            );
            return Ok((Self::default(), hash));
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read project config {}", path.display()))?;
        let config: ProjectConfig =
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
                file: path.display().to_string(),
                source: e,
            })?;

        debug!(
            workspace = %abs.display(),
            hash = %hash,
            profiles = ?config.profiles,
            "config:loaded project config"
        );
        Ok((config, hash))
    }

    /// Persist the project config, recording the absolute workspace path.
    pub fn save(&mut self, global: &GlobalConfig, workspace: &Path) -> Result<()> {
        let abs = absolute(workspace)?;
        self.workspace_path = abs.clone();

        let hash = workspace_hash(&abs);
        let dir = global.data_dir.join("projects").join(&hash);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create project directory {}", dir.display()))?;

        let path = dir.join("config.yaml");
        let yaml = serde_yaml::to_string(self).context("Failed to serialize project config")?;
        fs::write(&path, yaml)
            .with_context(|| format!("Failed to write project config {}", path.display()))?;

        debug!(workspace = %abs.display(), hash = %hash, "config:saved project config");
        Ok(())
    }
}

/// Remove all stored data for a workspace (config and cached files).
pub fn remove_project_data(global: &GlobalConfig, workspace: &Path) -> Result<()> {
    let abs = absolute(workspace)?;
    let hash = workspace_hash(&abs);
    let dir = global.data_dir.join("projects").join(&hash);

    if dir.exists() {
        fs::remove_dir_all(&dir)
            .with_context(|| format!("Failed to remove project directory {}", dir.display()))?;
    }
    debug!(workspace = %abs.display(), hash = %hash, "config:removed project data");
    Ok(())
}

/// A known project, for listing purposes.
#[derive(Debug, Clone)]
pub struct ProjectInfo {
    pub hash: String,
    pub workspace_path: PathBuf,
    pub config: ProjectConfig,
}

/// Enumerate all saved projects under `<data_dir>/projects/`.
pub fn list_projects(global: &GlobalConfig) -> Result<Vec<ProjectInfo>> {
    let projects_dir = global.data_dir.join("projects");
    if !projects_dir.exists() {
        return Ok(Vec::new());
    }

    let mut projects = Vec::new();
    for entry in fs::read_dir(&projects_dir)
        .with_context(|| format!("Failed to read {}", projects_dir.display()))?
    {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        let hash = entry.file_name().to_string_lossy().to_string();
        let config_path = entry.path().join("config.yaml");
        let contents = match fs::read_to_string(&config_path) {
            Ok(c) => c,
            Err(e) => {
                debug!(hash = %hash, error = %e, "config:skipping unreadable project");
                continue;
            }
        };
        let config: ProjectConfig = match serde_yaml::from_str(&contents) {
            Ok(c) => c,
            Err(e) => {
                debug!(hash = %hash, error = %e, "config:skipping unparsable project");
                continue;
            }
        };
        projects.push(ProjectInfo {
            hash,
            workspace_path: config.workspace_path.clone(),
            config,
        });
    }

    Ok(projects)
}

/// Checked-in configuration committed to a repository: the overridable
/// subset of the project config.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct CheckedInConfig {
    pub profiles: Vec<String>,
    pub volumes: Vec<String>,
    pub docker_socket: Option<SocketPolicy>,
    pub envs: Vec<String>,
    pub backend: Option<BackendKind>,
}

/// A discovered checked-in config file and where it was found.
#[derive(Debug, Clone)]
pub struct CheckedInLocation {
    /// Absolute path of the config file
    pub path: PathBuf,
    /// Directory containing the config file (base for relative volume paths)
    pub dir: PathBuf,
    pub config: CheckedInConfig,
}

/// Search for `.agentbox.yaml` from `start_dir` up to the filesystem root.
/// Returns `None` when no file exists; this is a normal state, not an error.
pub fn find_checked_in(start_dir: &Path) -> Result<Option<CheckedInLocation>> {
    let abs = absolute(start_dir)?;
    let mut dir = abs.clone();

    loop {
        let candidate = dir.join(CHECKED_IN_FILE);
        if candidate.exists() {
            let contents = fs::read_to_string(&candidate)
                .with_context(|| format!("Failed to read {}", candidate.display()))?;
            let config: CheckedInConfig =
                serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
                    file: candidate.display().to_string(),
                    source: e,
                })?;

            debug!(
                path = %candidate.display(),
                profiles = ?config.profiles,
                "config:found checked-in config"
            );
            return Ok(Some(CheckedInLocation {
                path: candidate,
                dir,
                config,
            }));
        }

        if !dir.pop() {
            break;
        }
    }

    debug!(start_dir = %abs.display(), "config:no checked-in config found");
    Ok(None)
}

/// Merge a checked-in config into a project config.
///
/// Checked-in profiles and volumes are appended with name-based dedup (the
/// project entry wins); relative volume host paths are resolved against the
/// checked-in file's directory before merging. Socket and backend overrides
/// apply only when the project config leaves them unset. Pure: no I/O.
pub fn merge_checked_in(
    project: &ProjectConfig,
    checked_in: Option<&CheckedInLocation>,
) -> Result<ProjectConfig> {
    let Some(location) = checked_in else {
        return Ok(project.clone());
    };

    let mut merged = project.clone();
    let file = location.path.display().to_string();

    for profile in &location.config.profiles {
        if !merged.profiles.contains(profile) {
            merged.profiles.push(profile.clone());
        }
    }

    for spec in &location.config.volumes {
        let (host, dest, read_only) = parse_volume_spec(spec, &file)?;
        let resolved_host = resolve_volume_path(&host, &location.dir);
        let mut resolved = format!("{}:{}", resolved_host.display(), dest);
        if read_only {
            resolved.push_str(":ro");
        }
        if !merged.volumes.contains(&resolved) {
            merged.volumes.push(resolved);
        }
    }

    if merged.docker_socket.is_none() {
        merged.docker_socket = location.config.docker_socket;
    }
    if merged.backend.is_none() {
        merged.backend = location.config.backend;
    }

    debug!(
        profiles = ?merged.profiles,
        volumes = ?merged.volumes,
        "config:merged checked-in config"
    );
    Ok(merged)
}

/// Determine the effective backend. Precedence, highest first: explicit CLI
/// flag, checked-in config, project config, global default, hardcoded
/// fallback.
pub fn resolve_backend(
    cli: Option<BackendKind>,
    checked_in: Option<&CheckedInLocation>,
    project: &ProjectConfig,
    global: &GlobalConfig,
) -> BackendKind {
    if let Some(kind) = cli {
        return kind;
    }
    if let Some(kind) = checked_in.and_then(|c| c.config.backend) {
        return kind;
    }
    if let Some(kind) = project.backend {
        return kind;
    }
    if let Some(kind) = global.default_backend {
        return kind;
    }
    BackendKind::default()
}

/// Parse a `host:dest[:ro]` volume spec.
pub fn parse_volume_spec(spec: &str, file: &str) -> Result<(String, String, bool), ConfigError> {
    let parts: Vec<&str> = spec.split(':').collect();
    match parts.as_slice() {
        [host, dest] => Ok((host.to_string(), dest.to_string(), false)),
        [host, dest, "ro"] => Ok((host.to_string(), dest.to_string(), true)),
        [_, _, option] => Err(ConfigError::InvalidVolumeOption {
            option: option.to_string(),
            spec: spec.to_string(),
            file: file.to_string(),
        }),
        _ => Err(ConfigError::InvalidVolumeSpec {
            spec: spec.to_string(),
            file: file.to_string(),
        }),
    }
}

/// Resolve a volume host path. `./` and `../` are relative to `base_dir`
/// (the checked-in file's directory, not the process working directory);
/// `~` expands to the invoking user's home; anything else passes through.
pub fn resolve_volume_path(path: &str, base_dir: &Path) -> PathBuf {
    if path == "~" {
        return home::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = home::home_dir() {
            return home.join(rest);
        }
    }
    if path.starts_with("./") || path.starts_with("../") {
        return base_dir.join(path);
    }
    PathBuf::from(path)
}

/// Compute the stable hash keying a workspace: first 12 hex chars of the
/// SHA-256 of its absolute path.
pub fn workspace_hash(workspace: &Path) -> String {
    let digest = Sha256::digest(workspace.as_os_str().as_encoded_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..12].to_string()
}

/// Make a path absolute against the current directory without resolving
/// symlinks.
pub fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    Ok(cwd.join(path))
}

/// Expand a leading `~` and make the path absolute.
fn expand_path(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    let expanded = if s == "~" {
        home::home_dir().unwrap_or_else(|| path.to_path_buf())
    } else if let Some(rest) = s.strip_prefix("~/") {
        match home::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    };
    absolute(&expanded).unwrap_or(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn workspace_hash_is_stable_and_short() {
        let a = workspace_hash(Path::new("/tmp/project-a"));
        let b = workspace_hash(Path::new("/tmp/project-b"));
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
        assert_eq!(a, workspace_hash(Path::new("/tmp/project-a")));
    }

    #[test]
    fn global_config_defaults_when_absent() {
        let temp = TempDir::new().unwrap();
        let config = GlobalConfig::load_from(&temp.path().join("config.yaml")).unwrap();
        assert_eq!(config.docker_socket, SocketPolicy::Auto);
        assert!(config.default_profiles.is_empty());
        assert!(config.default_backend.is_none());
    }

    #[test]
    fn global_config_rejects_unknown_socket_policy() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(&path, "docker_socket: sometimes\n").unwrap();

        let err = GlobalConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("config.yaml"));
    }

    #[test]
    fn project_config_round_trip() {
        let temp = TempDir::new().unwrap();
        let global = GlobalConfig {
            data_dir: temp.path().to_path_buf(),
            ..Default::default()
        };
        let workspace = temp.path().join("my-project");
        std::fs::create_dir_all(&workspace).unwrap();

        let mut config = ProjectConfig {
            profiles: vec!["go".into(), "rust".into()],
            envs: vec!["FOO=bar".into(), "BAZ".into()],
            ..Default::default()
        };
        config.save(&global, &workspace).unwrap();

        let (loaded, hash) = ProjectConfig::load(&global, &workspace).unwrap();
        assert_eq!(hash.len(), 12);
        assert_eq!(loaded.profiles, vec!["go", "rust"]);
        assert_eq!(loaded.envs, vec!["FOO=bar", "BAZ"]);
        assert_eq!(loaded.workspace_path, workspace);
    }

    #[test]
    fn find_checked_in_walks_up() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a").join("b").join("c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(
            temp.path().join("a").join(CHECKED_IN_FILE),
            "profiles: [rust]\n",
        )
        .unwrap();

        let found = find_checked_in(&nested).unwrap().unwrap();
        assert_eq!(found.dir, temp.path().join("a"));
        assert_eq!(found.config.profiles, vec!["rust"]);
    }

    #[test]
    fn find_checked_in_absent_is_none() {
        let temp = TempDir::new().unwrap();
        assert!(find_checked_in(temp.path()).unwrap().is_none());
    }

    #[test]
    fn merge_checked_in_dedups_profiles_and_resolves_volumes() {
        let project = ProjectConfig {
            profiles: vec!["go".into()],
            volumes: vec!["/data:/data".into()],
            ..Default::default()
        };
        let location = CheckedInLocation {
            path: PathBuf::from("/repo/.agentbox.yaml"),
            dir: PathBuf::from("/repo"),
            config: CheckedInConfig {
                profiles: vec!["go".into(), "rust".into()],
                volumes: vec!["./fixtures:/fixtures:ro".into()],
                ..Default::default()
            },
        };

        let merged = merge_checked_in(&project, Some(&location)).unwrap();
        assert_eq!(merged.profiles, vec!["go", "rust"]);
        assert_eq!(
            merged.volumes,
            vec!["/data:/data", "/repo/./fixtures:/fixtures:ro"]
        );
    }

    #[test]
    fn merge_checked_in_does_not_override_project_settings() {
        let project = ProjectConfig {
            docker_socket: Some(SocketPolicy::Never),
            backend: Some(BackendKind::Container),
            ..Default::default()
        };
        let location = CheckedInLocation {
            path: PathBuf::from("/repo/.agentbox.yaml"),
            dir: PathBuf::from("/repo"),
            config: CheckedInConfig {
                docker_socket: Some(SocketPolicy::Always),
                backend: Some(BackendKind::Sandbox),
                ..Default::default()
            },
        };

        let merged = merge_checked_in(&project, Some(&location)).unwrap();
        assert_eq!(merged.docker_socket, Some(SocketPolicy::Never));
        assert_eq!(merged.backend, Some(BackendKind::Container));
    }

    #[test]
    fn parse_volume_spec_variants() {
        assert_eq!(
            parse_volume_spec("/a:/b", "f").unwrap(),
            ("/a".into(), "/b".into(), false)
        );
        assert_eq!(
            parse_volume_spec("/a:/b:ro", "f").unwrap(),
            ("/a".into(), "/b".into(), true)
        );

        let err = parse_volume_spec("/a:/b:rw", "proj.yaml").unwrap_err();
        assert!(err.to_string().contains("rw"));
        assert!(err.to_string().contains("proj.yaml"));

        assert!(parse_volume_spec("/only-host", "f").is_err());
    }

    #[test]
    fn resolve_volume_path_relative_to_base() {
        let resolved = resolve_volume_path("./sub", Path::new("/repo"));
        assert_eq!(resolved, PathBuf::from("/repo/./sub"));

        let passthrough = resolve_volume_path("/abs/path", Path::new("/repo"));
        assert_eq!(passthrough, PathBuf::from("/abs/path"));
    }

    #[test]
    fn backend_resolution_precedence_cascades() {
        let global = GlobalConfig {
            default_backend: Some(BackendKind::Container),
            ..Default::default()
        };
        let project = ProjectConfig {
            backend: Some(BackendKind::Sandbox),
            ..Default::default()
        };
        let checked_in = CheckedInLocation {
            path: PathBuf::from("/repo/.agentbox.yaml"),
            dir: PathBuf::from("/repo"),
            config: CheckedInConfig {
                backend: Some(BackendKind::Container),
                ..Default::default()
            },
        };

        // CLI wins over everything.
        assert_eq!(
            resolve_backend(
                Some(BackendKind::Sandbox),
                Some(&checked_in),
                &project,
                &global
            ),
            BackendKind::Sandbox
        );
        // Then checked-in.
        assert_eq!(
            resolve_backend(None, Some(&checked_in), &project, &global),
            BackendKind::Container
        );
        // Then project.
        assert_eq!(
            resolve_backend(None, None, &project, &global),
            BackendKind::Sandbox
        );
        // Then global.
        assert_eq!(
            resolve_backend(None, None, &ProjectConfig::default(), &global),
            BackendKind::Container
        );
        // Hardcoded fallback.
        assert_eq!(
            resolve_backend(
                None,
                None,
                &ProjectConfig::default(),
                &GlobalConfig::default()
            ),
            BackendKind::Sandbox
        );
    }

    #[test]
    fn list_projects_reads_saved_configs() {
        let temp = TempDir::new().unwrap();
        let global = GlobalConfig {
            data_dir: temp.path().to_path_buf(),
            ..Default::default()
        };
        let workspace = temp.path().join("proj");
        std::fs::create_dir_all(&workspace).unwrap();

        let mut config = ProjectConfig::default();
        config.save(&global, &workspace).unwrap();

        let projects = list_projects(&global).unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].workspace_path, workspace);
    }
}
