//! `agentbox run`: launch the agent for a workspace, creating the unit on
//! first use and attaching on later runs.

use std::path::PathBuf;

use anyhow::{Context, Result};
use console::style;
use tracing::{debug, warn};

use crate::backend::{self, Backend, BackendKind, RunOptions, generate_instance_name};
use crate::command::WorkspaceContext;
use crate::config::SocketPolicy;
use crate::mounts;

pub struct RunArgs {
    pub backend: Option<BackendKind>,
    pub profiles: Vec<String>,
    pub recreate: bool,
    pub docker_socket: bool,
    pub workspace: Option<PathBuf>,
    pub debug: bool,
}

pub fn run(args: RunArgs) -> Result<()> {
    let mut ctx = WorkspaceContext::load(args.workspace.as_deref(), args.backend)?;

    if ctx.project.instance_name.is_none() {
        ctx.project.instance_name = Some(generate_instance_name(&ctx.workspace));
    }

    let backend = backend::get(ctx.backend_kind, &ctx.global);

    let existing = match backend.find(&ctx.workspace) {
        Ok(existing) => existing,
        Err(e) => {
            debug!(error = %e, "run:failed to check for existing unit");
            None
        }
    };

    if args.recreate {
        if let Some(existing) = &existing {
            // Credentials and session history must outlive the unit
            save_cache_best_effort(backend.as_ref(), &ctx);

            println!(
                "Removing existing {} '{}' ({})...",
                ctx.backend_kind, existing.name, existing.id
            );
            backend
                .remove(&existing.id)
                .context("Failed to remove existing unit")?;
            println!("Existing unit removed");
        }
    } else if existing.is_some() && backend.pins_mounts() {
        if let Err(e) = warn_on_mount_drift(backend.as_ref(), &ctx) {
            debug!(error = %e, "run:failed to check mount drift");
        }
    }

    // Register the project before the long-running attach, so other
    // terminals can see it; failure here must not block the run
    if let Err(e) = ctx.project.save(&ctx.global, &ctx.workspace) {
        warn!(error = %e, "run:failed to save project config");
    }

    let opts = RunOptions {
        workspace: &ctx.workspace,
        profiles: args.profiles,
        force_rebuild: args.recreate,
        debug: args.debug,
        mount_docker_socket: resolve_socket_mount(&ctx, args.docker_socket),
        global: &ctx.global,
        project: &ctx.project,
        checked_in: ctx.checked_in.as_ref(),
    };

    backend.run(&opts)
}

/// Whether to mount the Docker socket, from the effective policy: `always`
/// and `never` are absolute, `auto` follows the CLI flag.
fn resolve_socket_mount(ctx: &WorkspaceContext, flag: bool) -> bool {
    let policy = ctx
        .project
        .docker_socket
        .unwrap_or(ctx.global.docker_socket);
    match policy {
        SocketPolicy::Always => true,
        SocketPolicy::Never => {
            if flag {
                warn!("run:--docker-socket ignored, policy is 'never'");
            }
            false
        }
        SocketPolicy::Auto => flag,
    }
}

fn save_cache_best_effort(backend: &dyn Backend, ctx: &WorkspaceContext) {
    match backend.find_running(&ctx.workspace) {
        Ok(Some(_)) => {
            if let Err(e) = backend.save_cache(&ctx.workspace) {
                warn!(error = %e, "run:failed to save state cache before recreate");
            }
        }
        _ => debug!("run:no running unit, skipping cache save"),
    }
}

/// Units that pin their mounts at creation can miss mounts the current
/// configuration would produce; warn so the user can recreate.
fn warn_on_mount_drift(backend: &dyn Backend, ctx: &WorkspaceContext) -> Result<()> {
    let Some(running) = backend.find_running(&ctx.workspace)? else {
        return Ok(());
    };

    let expected = mounts::expected_mounts(&ctx.global, &ctx.project, &ctx.workspace);
    let actual = mounts::actual_mounts(&running.id)?;
    let diff = mounts::diff(&expected, &actual);

    if diff.missing.is_empty() {
        return Ok(());
    }

    println!();
    println!(
        "{} Unit mount configuration has changed.",
        style("WARNING:").yellow().bold()
    );
    println!("The following mounts are missing from the running unit:");
    for mount in &diff.missing {
        let ro = if mount.read_only { " (read-only)" } else { "" };
        println!(
            "  - {} -> {}{}",
            mount.source.display(),
            mount.destination.display(),
            ro
        );
    }
    println!();
    println!("Units remember their initial mount configuration.");
    println!("To apply new mounts, use: agentbox run --recreate");
    println!();

    Ok(())
}
