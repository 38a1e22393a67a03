//! Host side of the handoff protocol.
//!
//! `run` writes a versioned manifest plus resolved environment and shared
//! artifacts into the workspace's hidden state directory, which is visible
//! on both sides of the isolation boundary. The in-sandbox runner consumes
//! them before replacing itself with the agent process.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::BackendKind;
use crate::config::{CheckedInLocation, GlobalConfig, ProjectConfig};
use crate::context;
use crate::envs::{merge_envs, resolve_envs};

/// Directory inside the workspace shared between host and sandbox.
pub const HANDOFF_DIR: &str = ".agentbox";

/// Manifest file name within the handoff directory.
pub const MANIFEST_FILE: &str = "handoff.yaml";

/// Resolved environment file name within the handoff directory.
pub const ENV_FILE: &str = "env";

/// Concatenated context document name within the handoff directory.
pub const CONTEXT_FILE: &str = "CLAUDE.md";

/// Current manifest schema version. Bump on breaking format changes.
pub const MANIFEST_VERSION: u32 = 1;

/// The versioned handoff document written by the host and read by the
/// in-sandbox runner.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffManifest {
    /// Schema version for compatibility checking
    #[serde(default)]
    pub version: u32,

    /// Plugins to expose inside the sandbox
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<PluginEntry>,

    /// Agent definitions to install inside the sandbox
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agents: Vec<AgentEntry>,
}

/// A plugin staged into the handoff directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginEntry {
    /// Plugin identifier (e.g. "code-simplifier@official")
    pub name: String,

    /// Path relative to the handoff directory where the plugin files live
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Package/commit hash of the installed plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_version: Option<String>,
}

/// An agent definition staged into the handoff directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEntry {
    /// Agent name (file name without extension)
    pub name: String,

    /// Path relative to the handoff directory
    pub path: String,
}

/// Write the manifest, stamping the current schema version.
pub fn write_manifest(workspace: &Path, manifest: &mut HandoffManifest) -> Result<()> {
    manifest.version = MANIFEST_VERSION;

    let dir = workspace.join(HANDOFF_DIR);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create handoff directory {}", dir.display()))?;

    let path = dir.join(MANIFEST_FILE);
    let yaml = serde_yaml::to_string(manifest).context("Failed to serialize manifest")?;
    fs::write(&path, yaml)
        .with_context(|| format!("Failed to write manifest {}", path.display()))?;
    Ok(())
}

/// Read the manifest. Returns `None` when no manifest exists (pre-manifest
/// units); fails closed when the version exceeds the supported one, because
/// silently ignoring unknown fields risks starting the agent with incomplete
/// setup.
pub fn read_manifest(workspace: &Path) -> Result<Option<HandoffManifest>> {
    let path = workspace.join(HANDOFF_DIR).join(MANIFEST_FILE);
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    let manifest: HandoffManifest =
        serde_yaml::from_str(&contents).context("Failed to parse manifest")?;

    if manifest.version == 0 {
        bail!("manifest is missing its version field");
    }
    if manifest.version > MANIFEST_VERSION {
        bail!(
            "manifest version {} is newer than supported version {}; please update agentbox",
            manifest.version,
            MANIFEST_VERSION
        );
    }

    Ok(Some(manifest))
}

/// Write resolved `NAME=value` lines to the env file.
pub fn write_env_file(workspace: &Path, envs: &[String]) -> Result<()> {
    let dir = workspace.join(HANDOFF_DIR);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create handoff directory {}", dir.display()))?;

    let mut content = String::new();
    for env in envs {
        content.push_str(env);
        content.push('\n');
    }

    let path = dir.join(ENV_FILE);
    fs::write(&path, content)
        .with_context(|| format!("Failed to write env file {}", path.display()))?;
    Ok(())
}

/// Read `NAME=value` lines from the env file. Blank lines and `#` comments
/// are ignored; a missing file is an empty list.
pub fn read_env_file(workspace: &Path) -> Result<Vec<String>> {
    let path = workspace.join(HANDOFF_DIR).join(ENV_FILE);
    let contents = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read env file {}", path.display()));
        }
    };

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Populate the handoff directory: context document, plugins, agents,
/// manifest, resolved environment. Called before every unit start since host
/// configuration may have changed. Optional steps (plugins, agents, context)
/// are best-effort; the manifest and env file are always written.
pub fn prepare(
    workspace: &Path,
    global: &GlobalConfig,
    project: &ProjectConfig,
    checked_in: Option<&CheckedInLocation>,
    backend: BackendKind,
) -> Result<()> {
    let dir = workspace.join(HANDOFF_DIR);

    info!(
        workspace = %workspace.display(),
        handoff_dir = %dir.display(),
        backend = %backend,
        "handoff:preparing directory"
    );

    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create handoff directory {}", dir.display()))?;

    if let Err(e) = prepare_context(workspace, &dir, backend) {
        warn!(error = %e, "handoff:failed to prepare context document");
    }

    let mut manifest = HandoffManifest::default();

    match prepare_plugins(&global.agent_home, &dir) {
        Ok(plugins) => manifest.plugins = plugins,
        Err(e) => warn!(error = %e, "handoff:failed to prepare plugins"),
    }

    match prepare_agents(&global.agent_home, &dir) {
        Ok(agents) => manifest.agents = agents,
        Err(e) => warn!(error = %e, "handoff:failed to prepare agents"),
    }

    write_manifest(workspace, &mut manifest)?;

    let checked_in_envs = checked_in.map(|c| c.config.envs.as_slice()).unwrap_or(&[]);
    let (merged, _) = merge_envs(&global.envs, &project.envs, checked_in_envs);
    let resolved = resolve_envs(&merged);
    write_env_file(workspace, &resolved)?;

    info!(
        plugins = manifest.plugins.len(),
        agents = manifest.agents.len(),
        envs = resolved.len(),
        "handoff:directory prepared"
    );
    Ok(())
}

/// Assemble the concatenated context document into the handoff directory.
fn prepare_context(workspace: &Path, handoff_dir: &Path, backend: BackendKind) -> Result<()> {
    let files = context::discover_context_files(workspace)?;
    let content = context::concatenate(&files, backend)?;

    let path = handoff_dir.join(CONTEXT_FILE);
    fs::write(&path, content)
        .with_context(|| format!("Failed to write context document {}", path.display()))?;

    info!(path = %path.display(), sources = files.len(), "handoff:context document prepared");
    Ok(())
}

/// The installed-plugins index maintained by the agent on the host.
#[derive(Debug, Deserialize)]
struct InstalledPlugins {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    #[serde(default)]
    plugins: HashMap<String, Vec<InstalledPluginEntry>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstalledPluginEntry {
    install_path: PathBuf,
    #[serde(default)]
    version: String,
    #[serde(default)]
    git_commit_sha: Option<String>,
}

/// Copy installed plugins into `<handoff>/plugins/`, keeping their cache-
/// relative paths, and return the manifest entries.
fn prepare_plugins(agent_home: &Path, handoff_dir: &Path) -> Result<Vec<PluginEntry>> {
    let index_path = agent_home.join("plugins").join("installed_plugins.json");
    let cache_path = agent_home.join("plugins").join("cache");

    if !index_path.exists() {
        debug!("handoff:no installed plugins index, skipping plugins");
        return Ok(Vec::new());
    }

    let contents = fs::read_to_string(&index_path)
        .with_context(|| format!("Failed to read {}", index_path.display()))?;
    let index: InstalledPlugins =
        serde_json::from_str(&contents).context("Failed to parse installed_plugins.json")?;

    let mut plugins = Vec::new();

    for (name, entries) in &index.plugins {
        for entry in entries {
            if !entry.install_path.exists() {
                warn!(plugin = %name, path = %entry.install_path.display(), "handoff:plugin install path not found, skipping");
                continue;
            }

            // Only plugins under the cache directory have a stable relative
            // layout to reproduce inside the sandbox
            let Ok(relative) = entry.install_path.strip_prefix(&cache_path) else {
                warn!(plugin = %name, path = %entry.install_path.display(), "handoff:plugin outside cache directory, skipping");
                continue;
            };

            let dst = handoff_dir.join("plugins").join(relative);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            // fs_extra nests the source under an existing destination, so a
            // stale copy from a previous run is cleared first
            if dst.exists() {
                fs::remove_dir_all(&dst)
                    .with_context(|| format!("Failed to clear {}", dst.display()))?;
            }

            let mut options = fs_extra::dir::CopyOptions::new();
            options.overwrite = true;
            options.copy_inside = true;
            if let Err(e) = fs_extra::dir::copy(&entry.install_path, &dst, &options) {
                warn!(plugin = %name, error = %e, "handoff:failed to copy plugin, skipping");
                continue;
            }

            plugins.push(PluginEntry {
                name: name.clone(),
                path: Path::new("plugins")
                    .join(relative)
                    .to_string_lossy()
                    .to_string(),
                version: (!entry.version.is_empty()).then(|| entry.version.clone()),
                package_version: entry.git_commit_sha.clone(),
            });

            debug!(plugin = %name, dst = %dst.display(), "handoff:staged plugin");
        }
    }

    // Index iteration order is unstable; keep the manifest deterministic
    plugins.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(plugins)
}

/// Copy agent definition files into `<handoff>/agents/` and return the
/// manifest entries.
fn prepare_agents(agent_home: &Path, handoff_dir: &Path) -> Result<Vec<AgentEntry>> {
    let agents_dir = agent_home.join("agents");
    if !agents_dir.exists() {
        debug!("handoff:no agents directory, skipping agents");
        return Ok(Vec::new());
    }

    let dst_dir = handoff_dir.join("agents");
    fs::create_dir_all(&dst_dir)
        .with_context(|| format!("Failed to create {}", dst_dir.display()))?;

    let mut agents = Vec::new();
    for entry in fs::read_dir(&agents_dir)
        .with_context(|| format!("Failed to read {}", agents_dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            continue;
        }

        let file_name = entry.file_name().to_string_lossy().to_string();
        if !file_name.ends_with(".md") && !file_name.ends_with(".json") {
            continue;
        }

        let dst = dst_dir.join(&file_name);
        if let Err(e) = fs::copy(&path, &dst) {
            warn!(agent = %file_name, error = %e, "handoff:failed to copy agent, skipping");
            continue;
        }

        let name = file_name
            .rsplit_once('.')
            .map(|(stem, _)| stem.to_string())
            .unwrap_or_else(|| file_name.clone());

        agents.push(AgentEntry {
            name,
            path: format!("agents/{}", file_name),
        });
        debug!(agent = %file_name, "handoff:staged agent");
    }

    agents.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(agents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn manifest_round_trip() {
        let temp = TempDir::new().unwrap();

        let mut manifest = HandoffManifest {
            version: 0,
            plugins: vec![PluginEntry {
                name: "demo@official".into(),
                path: "plugins/official/demo/abc123".into(),
                version: Some("abc123".into()),
                package_version: Some("deadbeef".into()),
            }],
            agents: vec![AgentEntry {
                name: "reviewer".into(),
                path: "agents/reviewer.md".into(),
            }],
        };
        write_manifest(temp.path(), &mut manifest).unwrap();

        let loaded = read_manifest(temp.path()).unwrap().unwrap();
        assert_eq!(loaded.version, MANIFEST_VERSION);
        assert_eq!(loaded.plugins, manifest.plugins);
        assert_eq!(loaded.agents, manifest.agents);
    }

    #[test]
    fn missing_manifest_is_none() {
        let temp = TempDir::new().unwrap();
        assert!(read_manifest(temp.path()).unwrap().is_none());
    }

    #[test]
    fn newer_manifest_version_fails_closed() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(HANDOFF_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(MANIFEST_FILE),
            format!("version: {}\n", MANIFEST_VERSION + 1),
        )
        .unwrap();

        let err = read_manifest(temp.path()).unwrap_err();
        assert!(err.to_string().contains("newer than supported"));
    }

    #[test]
    fn manifest_without_version_is_rejected() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(HANDOFF_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(MANIFEST_FILE), "plugins: []\n").unwrap();

        let err = read_manifest(temp.path()).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn env_file_round_trip_skips_comments() {
        let temp = TempDir::new().unwrap();
        write_env_file(
            temp.path(),
            &["FOO=bar".to_string(), "TOKEN=abc".to_string()],
        )
        .unwrap();

        // Append a comment and a blank line by hand
        let path = temp.path().join(HANDOFF_DIR).join(ENV_FILE);
        let mut contents = fs::read_to_string(&path).unwrap();
        contents.push_str("\n# a comment\n\n");
        fs::write(&path, contents).unwrap();

        let envs = read_env_file(temp.path()).unwrap();
        assert_eq!(envs, vec!["FOO=bar", "TOKEN=abc"]);
    }

    #[test]
    fn prepare_writes_manifest_and_env_even_without_optional_artifacts() {
        let temp = TempDir::new().unwrap();
        let workspace = temp.path().join("ws");
        fs::create_dir_all(&workspace).unwrap();

        let global = GlobalConfig {
            agent_home: temp.path().join("no-such-claude-home"),
            envs: vec!["FOO=bar".into()],
            ..Default::default()
        };
        let project = ProjectConfig::default();

        prepare(&workspace, &global, &project, None, BackendKind::Sandbox).unwrap();

        let manifest = read_manifest(&workspace).unwrap().unwrap();
        assert!(manifest.plugins.is_empty());
        assert!(manifest.agents.is_empty());
        assert_eq!(read_env_file(&workspace).unwrap(), vec!["FOO=bar"]);
    }

    #[test]
    fn prepare_stages_agents_and_plugins() {
        let temp = TempDir::new().unwrap();
        let workspace = temp.path().join("ws");
        fs::create_dir_all(&workspace).unwrap();

        let agent_home = temp.path().join("claude");
        let agents_dir = agent_home.join("agents");
        fs::create_dir_all(&agents_dir).unwrap();
        fs::write(agents_dir.join("reviewer.md"), "agent body").unwrap();
        fs::write(agents_dir.join("notes.txt"), "ignored").unwrap();

        let plugin_src = agent_home
            .join("plugins")
            .join("cache")
            .join("official")
            .join("demo")
            .join("v1");
        fs::create_dir_all(&plugin_src).unwrap();
        fs::write(plugin_src.join("plugin.json"), "{}").unwrap();
        let index = serde_json::json!({
            "version": 2,
            "plugins": {
                "demo@official": [{
                    "scope": "global",
                    "installPath": plugin_src,
                    "version": "v1",
                    "installedAt": "2026-01-15T00:00:00.000Z",
                    "lastUpdated": "2026-01-19T00:00:00.000Z"
                }]
            }
        });
        fs::write(
            agent_home.join("plugins").join("installed_plugins.json"),
            serde_json::to_string_pretty(&index).unwrap(),
        )
        .unwrap();

        let global = GlobalConfig {
            agent_home,
            ..Default::default()
        };
        let project = ProjectConfig::default();

        prepare(&workspace, &global, &project, None, BackendKind::Container).unwrap();

        let manifest = read_manifest(&workspace).unwrap().unwrap();
        assert_eq!(manifest.agents.len(), 1);
        assert_eq!(manifest.agents[0].name, "reviewer");
        assert_eq!(manifest.plugins.len(), 1);
        assert_eq!(manifest.plugins[0].path, "plugins/official/demo/v1");

        // Staged files are physically present in the handoff directory
        let handoff = workspace.join(HANDOFF_DIR);
        assert!(handoff.join("agents").join("reviewer.md").exists());
        assert!(
            handoff
                .join("plugins")
                .join("official")
                .join("demo")
                .join("v1")
                .join("plugin.json")
                .exists()
        );
        assert!(handoff.join(CONTEXT_FILE).exists());
    }
}
