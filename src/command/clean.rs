//! `agentbox clean`: full teardown for a workspace — unit, backend
//! resources, and stored project data.

use std::path::PathBuf;

use anyhow::Result;
use tracing::warn;

use crate::backend::{self, BackendKind, InstanceStatus};
use crate::command::WorkspaceContext;
use crate::config::remove_project_data;
use crate::template::clean_templates;

pub fn run(
    workspace: Option<PathBuf>,
    cli_backend: Option<BackendKind>,
    templates: bool,
) -> Result<()> {
    let ctx = WorkspaceContext::load(workspace.as_deref(), cli_backend)?;
    let backend = backend::get(ctx.backend_kind, &ctx.global);

    match backend.find(&ctx.workspace) {
        Ok(Some(info)) => {
            if info.status == InstanceStatus::Running {
                println!("Stopping and removing '{}'...", info.name);
                let _ = backend.stop(&ctx.workspace, true)?;
            } else {
                println!("Removing '{}'...", info.name);
                backend.remove(&info.id)?;
            }
        }
        Ok(None) => println!("No unit to remove"),
        Err(e) => warn!(error = %e, "clean:failed to look up unit"),
    }

    backend.cleanup(&ctx.workspace)?;
    remove_project_data(&ctx.global, &ctx.workspace)?;
    println!("Project data removed");

    if templates {
        clean_templates()?;
        println!("Cached template images removed");
    }

    Ok(())
}
