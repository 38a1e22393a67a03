//! `agentbox shell`: open an interactive shell in the running unit.

use std::path::PathBuf;

use anyhow::Result;

use crate::backend::{self, BackendKind};
use crate::command::WorkspaceContext;

pub fn run(workspace: Option<PathBuf>, cli_backend: Option<BackendKind>) -> Result<()> {
    let ctx = WorkspaceContext::load(workspace.as_deref(), cli_backend)?;
    let backend = backend::get(ctx.backend_kind, &ctx.global);
    backend.shell(&ctx.workspace)
}
