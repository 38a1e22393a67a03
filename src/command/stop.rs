//! `agentbox stop`: stop the unit for a workspace, saving the state cache
//! first so credentials and session history survive.

use std::path::PathBuf;

use anyhow::Result;
use tracing::warn;

use crate::backend::{self, BackendKind};
use crate::command::WorkspaceContext;

pub fn run(
    workspace: Option<PathBuf>,
    cli_backend: Option<BackendKind>,
    remove: bool,
) -> Result<()> {
    let ctx = WorkspaceContext::load(workspace.as_deref(), cli_backend)?;
    let backend = backend::get(ctx.backend_kind, &ctx.global);

    if backend.find_running(&ctx.workspace)?.is_none() {
        println!(
            "No running {} for workspace: {}",
            ctx.backend_kind,
            ctx.workspace.display()
        );
        return Ok(());
    }

    // Snapshot state before the unit goes away; a failed snapshot should
    // not prevent the stop itself
    if let Err(e) = backend.save_cache(&ctx.workspace) {
        warn!(error = %e, "stop:failed to save state cache");
    }

    match backend.stop(&ctx.workspace, remove)? {
        Some(info) => {
            if remove {
                println!("Stopped and removed '{}' ({})", info.name, info.id);
            } else {
                println!("Stopped '{}' ({})", info.name, info.id);
            }
        }
        // The unit disappeared between lookup and stop; nothing to do
        None => println!("Nothing left to stop"),
    }

    Ok(())
}
