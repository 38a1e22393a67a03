//! Sandbox side of the handoff protocol.
//!
//! The image wraps the agent binary so that `agentbox entrypoint` runs
//! first: it consumes the handoff directory (manifest, environment, context
//! document, state cache) and then replaces itself with the real agent
//! process. Process-image replacement, not spawning, is required so the
//! agent inherits the sandbox's designated process slot and signal handling.

use std::fs;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, warn};

use crate::handoff::{self, AgentEntry, CONTEXT_FILE, HANDOFF_DIR, HandoffManifest};
use crate::statecache;

/// Marker preventing the dev override binary from re-entering itself.
pub const DEV_ENTRYPOINT_ENV: &str = "AGENTBOX_DEV_ENTRYPOINT";

/// Name of the dev override binary inside the handoff directory.
pub const DEV_BINARY: &str = "agentbox-dev";

/// Written once setup completed, so the agent can verify the runner ran.
const MARKER_FILE: &str = "/tmp/agentbox-entrypoint-ran";

/// Login shells source this file; exports are persisted here so interactive
/// shells opened later also see the handoff environment.
const PERSISTENT_ENV_FILE: &str = "/etc/profile.d/agentbox-env.sh";

/// Default agent state-home inside the sandbox.
const DEFAULT_STATE_HOME: &str = "/home/agent/.claude";

/// Execute the entrypoint: set up the sandbox from the handoff directory,
/// then exec the agent. Returns only on error; on success the process image
/// is replaced.
pub fn run(forwarded: &[String]) -> Result<()> {
    info!(args = ?forwarded, "entrypoint:starting");

    let Some(workspace) = read_workspace_path() else {
        // No workspace found: degraded mode, hand straight over to the agent
        warn!("entrypoint:workspace not found, exec agent directly");
        return exec_agent(forwarded, &[]);
    };

    info!(workspace = %workspace.display(), "entrypoint:workspace located");

    // A dev override binary replaces this entrypoint entirely, letting
    // developers iterate without rebuilding the image. Only returns when no
    // override exists.
    maybe_exec_dev_binary(&workspace, forwarded)?;

    let manifest = match handoff::read_manifest(&workspace) {
        // Pre-manifest unit: start the agent without setup
        Ok(None) => {
            info!("entrypoint:no manifest, exec agent directly");
            return exec_agent(forwarded, &[]);
        }
        Ok(Some(manifest)) => manifest,
        Err(e) => return Err(e).context("failed to read handoff manifest"),
    };

    info!(
        version = manifest.version,
        plugins = manifest.plugins.len(),
        agents = manifest.agents.len(),
        "entrypoint:manifest loaded"
    );

    let state_home = find_state_home();
    info!(path = %state_home.display(), "entrypoint:state-home located");

    if let Err(e) = statecache::restore(&workspace, &state_home) {
        warn!(error = %e, "entrypoint:failed to restore state cache");
    }

    if let Err(e) = install_context(&workspace, &state_home) {
        warn!(error = %e, "entrypoint:failed to install context document");
    }

    if let Err(e) = install_agents(&workspace, &state_home, &manifest.agents) {
        warn!(error = %e, "entrypoint:failed to install agents");
    }

    if let Err(e) = load_env(&workspace) {
        warn!(error = %e, "entrypoint:failed to load environment");
    }

    let plugin_dirs = plugin_dirs(&workspace, &manifest);

    if let Err(e) = fs::write(MARKER_FILE, b"") {
        debug!(error = %e, "entrypoint:could not write marker file");
    }

    info!(plugin_dirs = ?plugin_dirs, "entrypoint:setup complete, exec agent");
    exec_agent(forwarded, &plugin_dirs)
}

/// The workspace path, as the external tool communicates it: WORKSPACE_DIR,
/// then PWD, then the current working directory.
pub fn read_workspace_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("WORKSPACE_DIR")
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    if let Ok(dir) = std::env::var("PWD")
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    std::env::current_dir().ok()
}

/// Exec the dev override binary when present. On success this never
/// returns; it returns `Ok(())` when no override exists and an error when
/// the override exists but cannot be executed.
fn maybe_exec_dev_binary(workspace: &Path, forwarded: &[String]) -> Result<()> {
    // We ARE the dev binary: do not recurse
    if std::env::var(DEV_ENTRYPOINT_ENV).is_ok_and(|v| v == "1") {
        debug!("entrypoint:running as dev binary, skipping override check");
        return Ok(());
    }

    let dev_binary = workspace.join(HANDOFF_DIR).join(DEV_BINARY);
    if !dev_binary.exists() {
        return Ok(());
    }

    info!(path = %dev_binary.display(), "entrypoint:handing off to dev override binary");
    eprintln!("agentbox: using dev override binary at {}", dev_binary.display());

    let err = Command::new(&dev_binary)
        .arg("entrypoint")
        .args(forwarded)
        .env(DEV_ENTRYPOINT_ENV, "1")
        .exec();

    // exec only returns on failure
    if err.raw_os_error() == Some(libc::ENOEXEC) {
        let arch = std::env::consts::ARCH;
        bail!(
            "dev override binary at {} has the wrong architecture (exec format error); \
             rebuild it for the sandbox platform (linux/{}) and place it back in {}/{}",
            dev_binary.display(),
            arch,
            HANDOFF_DIR,
            DEV_BINARY,
        );
    }
    Err(anyhow!(err)).with_context(|| {
        format!("failed to exec dev override binary {}", dev_binary.display())
    })
}

/// Locate the agent state-home: a configured override first, the
/// conventional default next, then a scan of common host-mount locations,
/// since bind-mounted home directories may land anywhere.
pub fn find_state_home() -> PathBuf {
    if let Ok(dir) = std::env::var("CLAUDE_CONFIG_DIR") {
        let path = PathBuf::from(&dir);
        if path.exists() {
            return path;
        }
    }

    let default = PathBuf::from(DEFAULT_STATE_HOME);
    if default.exists() {
        return default;
    }

    for base in ["/Users", "/home"] {
        let Ok(entries) = fs::read_dir(base) else {
            continue;
        };
        for entry in entries.flatten() {
            if entry.file_name() == "agent" {
                continue; // default location, already checked
            }
            let candidate = entry.path().join(".claude");
            if candidate.exists() {
                return candidate;
            }
        }
    }

    default
}

/// Install the concatenated context document into the state-home.
fn install_context(workspace: &Path, state_home: &Path) -> Result<()> {
    let src = workspace.join(HANDOFF_DIR).join(CONTEXT_FILE);
    if !src.exists() {
        debug!("entrypoint:no context document to install");
        return Ok(());
    }

    fs::create_dir_all(state_home)
        .with_context(|| format!("Failed to create state-home {}", state_home.display()))?;

    let dst = state_home.join(CONTEXT_FILE);
    fs::copy(&src, &dst)
        .with_context(|| format!("Failed to copy context document to {}", dst.display()))?;

    info!(src = %src.display(), dst = %dst.display(), "entrypoint:context document installed");
    Ok(())
}

/// Copy manifest-listed agent definitions into the state-home's agents
/// directory. A single broken agent is skipped, not fatal.
fn install_agents(workspace: &Path, state_home: &Path, agents: &[AgentEntry]) -> Result<()> {
    if agents.is_empty() {
        debug!("entrypoint:no agents to install");
        return Ok(());
    }

    let agents_dir = state_home.join("agents");
    fs::create_dir_all(&agents_dir)
        .with_context(|| format!("Failed to create {}", agents_dir.display()))?;

    for agent in agents {
        let src = workspace.join(HANDOFF_DIR).join(&agent.path);
        let file_name = Path::new(&agent.path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| agent.name.clone());
        let dst = agents_dir.join(&file_name);

        match fs::copy(&src, &dst) {
            Ok(_) => info!(agent = %agent.name, path = %dst.display(), "entrypoint:agent installed"),
            Err(e) => warn!(agent = %agent.name, error = %e, "entrypoint:failed to copy agent, skipping"),
        }
    }

    Ok(())
}

/// Load the resolved env file into the current process environment and
/// persist exports for login shells.
fn load_env(workspace: &Path) -> Result<()> {
    let envs = handoff::read_env_file(workspace)?;
    if envs.is_empty() {
        debug!("entrypoint:no environment variables to load");
        return Ok(());
    }

    let mut entries: Vec<(String, String)> = Vec::new();
    for env in &envs {
        let Some((key, value)) = env.split_once('=') else {
            continue;
        };
        // SAFETY: the runner is single-threaded and about to exec; the
        // variables must land in this process's environment so the agent
        // inherits them.
        unsafe { std::env::set_var(key, value) };
        entries.push((key.to_string(), value.to_string()));
        debug!(key = %key, "entrypoint:loaded environment variable");
    }

    // Best-effort: the file may not be writable in older images; the vars
    // are still in the process environment and inherited through exec.
    match fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(PERSISTENT_ENV_FILE)
    {
        Ok(mut file) => {
            use std::io::Write;
            let mut content = String::from("\n# agentbox entrypoint environment variables\n");
            for (key, value) in &entries {
                content.push_str(&format!("export {}={:?}\n", key, value));
            }
            if let Err(e) = file.write_all(content.as_bytes()) {
                warn!(error = %e, "entrypoint:failed to write persistent env file");
            }
        }
        Err(e) => {
            warn!(
                path = PERSISTENT_ENV_FILE,
                error = %e,
                "entrypoint:could not open persistent env file, process environment only"
            );
        }
    }

    info!(count = entries.len(), "entrypoint:environment loaded");
    Ok(())
}

/// Manifest plugin paths that actually exist in the handoff directory.
fn plugin_dirs(workspace: &Path, manifest: &HandoffManifest) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for plugin in &manifest.plugins {
        let dir = workspace.join(HANDOFF_DIR).join(&plugin.path);
        if dir.exists() {
            debug!(plugin = %plugin.name, path = %dir.display(), "entrypoint:plugin directory found");
            dirs.push(dir);
        } else {
            warn!(plugin = %plugin.name, path = %dir.display(), "entrypoint:plugin directory missing");
        }
    }
    dirs
}

/// Replace the current process with the agent binary, forwarding the
/// original arguments plus one `--plugin-dir` flag per staged plugin. Never
/// returns on success.
fn exec_agent(forwarded: &[String], plugin_dirs: &[PathBuf]) -> Result<()> {
    let agent_path = find_agent().context("failed to find the agent binary")?;

    let mut cmd = Command::new(&agent_path);
    cmd.arg("--dangerously-skip-permissions");
    for dir in plugin_dirs {
        cmd.arg("--plugin-dir").arg(dir);
    }
    cmd.args(forwarded);

    info!(path = %agent_path.display(), "entrypoint:executing agent");

    let err = cmd.exec();
    Err(anyhow!(err)).with_context(|| format!("failed to exec agent at {}", agent_path.display()))
}

/// Locate the real agent binary. The image wrapper renames it to
/// `claude-real`, so that name is preferred; plain `claude` covers units
/// whose image predates the wrapper.
fn find_agent() -> Result<PathBuf> {
    let known = [
        "/home/agent/.local/bin/claude-real",
        "/usr/local/bin/claude-real",
        "/usr/bin/claude-real",
        "/home/agent/.local/bin/claude",
        "/usr/local/bin/claude",
        "/usr/bin/claude",
    ];
    for path in known {
        let path = Path::new(path);
        if path.exists() {
            return Ok(path.to_path_buf());
        }
    }

    for name in ["claude-real", "claude"] {
        if let Ok(path) = which::which(name) {
            return Ok(path);
        }
    }

    bail!("agent binary not found in known locations or PATH")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::{HandoffManifest, PluginEntry, write_manifest};
    use tempfile::TempDir;

    #[test]
    fn plugin_dirs_filters_missing_paths() {
        let temp = TempDir::new().unwrap();
        let existing = temp
            .path()
            .join(HANDOFF_DIR)
            .join("plugins")
            .join("official")
            .join("demo");
        fs::create_dir_all(&existing).unwrap();

        let manifest = HandoffManifest {
            version: 1,
            plugins: vec![
                PluginEntry {
                    name: "demo@official".into(),
                    path: "plugins/official/demo".into(),
                    version: None,
                    package_version: None,
                },
                PluginEntry {
                    name: "ghost@official".into(),
                    path: "plugins/official/ghost".into(),
                    version: None,
                    package_version: None,
                },
            ],
            agents: vec![],
        };

        let dirs = plugin_dirs(temp.path(), &manifest);
        assert_eq!(dirs, vec![existing]);
    }

    #[test]
    fn install_agents_copies_manifest_entries() {
        let temp = TempDir::new().unwrap();
        let handoff_agents = temp.path().join(HANDOFF_DIR).join("agents");
        fs::create_dir_all(&handoff_agents).unwrap();
        fs::write(handoff_agents.join("reviewer.md"), "body").unwrap();

        let state_home = temp.path().join("state-home");
        let agents = vec![AgentEntry {
            name: "reviewer".into(),
            path: "agents/reviewer.md".into(),
        }];

        install_agents(temp.path(), &state_home, &agents).unwrap();
        assert!(state_home.join("agents").join("reviewer.md").exists());
    }

    #[test]
    fn install_context_copies_document() {
        let temp = TempDir::new().unwrap();
        let handoff = temp.path().join(HANDOFF_DIR);
        fs::create_dir_all(&handoff).unwrap();
        fs::write(handoff.join(CONTEXT_FILE), "# context").unwrap();

        let state_home = temp.path().join("state-home");
        install_context(temp.path(), &state_home).unwrap();

        let installed = fs::read_to_string(state_home.join(CONTEXT_FILE)).unwrap();
        assert_eq!(installed, "# context");
    }

    #[test]
    fn manifest_read_is_used_for_version_gating() {
        // The runner path itself execs; the version gate lives in
        // handoff::read_manifest, exercised here through the same call.
        let temp = TempDir::new().unwrap();
        let mut manifest = HandoffManifest::default();
        write_manifest(temp.path(), &mut manifest).unwrap();
        assert!(handoff::read_manifest(temp.path()).unwrap().is_some());
    }
}
