//! State-cache synchronization between a unit and the workspace.
//!
//! The agent's state-home (credentials, settings, session history) is
//! mirrored onto a workspace-relative cache directory so it outlives unit
//! recreation. Saving runs rsync inside the unit; restoring runs inside the
//! sandbox during entrypoint setup.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::backend::{Backend, BackendKind};
use crate::cmd::Cmd;
use crate::handoff::HANDOFF_DIR;

/// Cache directory inside the handoff directory.
pub const CACHE_DIR: &str = "claude-cache";

/// State-home of the agent inside a unit.
const UNIT_STATE_HOME: &str = "/home/agent/.claude";

/// Mirror the running unit's state-home onto the workspace cache.
///
/// rsync runs inside the unit; the handoff directory is a workspace mount,
/// so the result is visible on the host. `--delete` keeps the cache an exact
/// snapshot.
pub fn save_cache(workspace: &Path, backend: &dyn Backend) -> Result<()> {
    let cache_path = workspace.join(HANDOFF_DIR).join(CACHE_DIR);

    info!(
        workspace = %workspace.display(),
        cache = %cache_path.display(),
        "statecache:saving"
    );

    fs::create_dir_all(&cache_path)
        .with_context(|| format!("Failed to create cache directory {}", cache_path.display()))?;

    let Some(unit) = backend.find_running(workspace)? else {
        bail!("no running unit found for {}", workspace.display());
    };

    let src = format!("{}/", UNIT_STATE_HOME);
    let dst = format!("{}/", cache_path.display());

    let mut args: Vec<&str> = match backend.kind() {
        BackendKind::Sandbox => vec!["sandbox", "exec", unit.id.as_str()],
        BackendKind::Container => vec!["exec", unit.id.as_str()],
    };
    args.extend(["rsync", "-a", "--delete", src.as_str(), dst.as_str()]);

    Cmd::new("docker")
        .args(&args)
        .run()
        .context("rsync inside unit failed")?;

    info!(cache = %cache_path.display(), "statecache:saved");
    Ok(())
}

/// Restore the cached state-home, if a non-empty cache exists.
///
/// Runs without `--delete` so state created before restoration is preserved
/// rather than clobbered. Called from the in-sandbox runner.
pub fn restore(workspace: &Path, state_home: &Path) -> Result<()> {
    let cache_path = workspace.join(HANDOFF_DIR).join(CACHE_DIR);

    let entries = match fs::read_dir(&cache_path) {
        Ok(entries) => entries.count(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read cache directory {}", cache_path.display()));
        }
    };
    if entries == 0 {
        debug!(cache = %cache_path.display(), "statecache:no cache to restore");
        return Ok(());
    }

    info!(
        cache = %cache_path.display(),
        state_home = %state_home.display(),
        "statecache:restoring"
    );

    fs::create_dir_all(state_home)
        .with_context(|| format!("Failed to create state-home {}", state_home.display()))?;

    let src = format!("{}/", cache_path.display());
    let dst = format!("{}/", state_home.display());
    Cmd::new("rsync")
        .args(&["-a", src.as_str(), dst.as_str()])
        .run()
        .context("rsync restore failed")?;

    info!("statecache:restored");
    Ok(())
}
