pub mod clean;
pub mod env;
pub mod list;
pub mod profile;
pub mod run;
pub mod shell;
pub mod stop;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::backend::BackendKind;
use crate::config::{
    self, CheckedInLocation, GlobalConfig, ProjectConfig, merge_checked_in, resolve_backend,
};

/// The resolved configuration for a workspace: the common loading pattern
/// shared by shell, stop, clean, and the config-editing commands.
pub struct WorkspaceContext {
    pub workspace: PathBuf,
    pub global: GlobalConfig,
    pub project: ProjectConfig,
    pub checked_in: Option<CheckedInLocation>,
    pub backend_kind: BackendKind,
}

impl WorkspaceContext {
    /// Load all configuration layers and resolve the backend for a
    /// workspace. `cli_backend` is the explicit flag, which wins over every
    /// configured source.
    pub fn load(workspace: Option<&Path>, cli_backend: Option<BackendKind>) -> Result<Self> {
        let workspace = resolve_workspace(workspace)?;

        let global = GlobalConfig::load().context("Failed to load config")?;
        let (project, _) =
            ProjectConfig::load(&global, &workspace).context("Failed to load project config")?;
        let checked_in =
            config::find_checked_in(&workspace).context("Failed to load checked-in config")?;
        let project = merge_checked_in(&project, checked_in.as_ref())
            .context("Failed to merge checked-in config")?;

        let backend_kind = resolve_backend(cli_backend, checked_in.as_ref(), &project, &global);

        Ok(Self {
            workspace,
            global,
            project,
            checked_in,
            backend_kind,
        })
    }
}

/// The workspace directory: the explicit flag, or the current directory.
pub fn resolve_workspace(flag: Option<&Path>) -> Result<PathBuf> {
    match flag {
        Some(path) => config::absolute(path),
        None => std::env::current_dir().context("Failed to get current directory"),
    }
}
