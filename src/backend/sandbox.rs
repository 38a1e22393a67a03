//! Docker sandbox (MicroVM) backend.
//!
//! Units are managed through the `docker sandbox` CLI, whose own persistent
//! state makes a created unit survive restarts without extra plumbing.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info};

use crate::backend::{
    Backend, BackendKind, InstanceInfo, InstanceStatus, RunOptions, generate_instance_name,
    is_inside_sandbox, merge_profiles,
};
use crate::cmd::Cmd;
use crate::config::{GlobalConfig, absolute};
use crate::template::{BASE_TEMPLATE_IMAGE, TemplateBuilder};
use crate::{handoff, statecache};

pub struct SandboxBackend<'a> {
    config: &'a GlobalConfig,
}

impl<'a> SandboxBackend<'a> {
    pub fn new(config: &'a GlobalConfig) -> Self {
        Self { config }
    }
}

/// A row from `docker sandbox ls`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerSandbox {
    pub id: String,
    pub name: String,
    pub status: String,
    pub image: String,
    pub workspace: String,
}

impl DockerSandbox {
    fn to_info(&self) -> InstanceInfo {
        InstanceInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            status: InstanceStatus::parse(&self.status),
            image: self.image.clone(),
            workspace: PathBuf::from(&self.workspace),
            backend: BackendKind::Sandbox,
        }
    }
}

/// List all sandboxes known to the external tool.
fn list_sandboxes() -> Result<Vec<DockerSandbox>> {
    let output = Cmd::new("docker")
        .args(&["sandbox", "ls"])
        .run_and_capture_stdout()
        .context("docker sandbox ls failed")?;

    parse_sandbox_ls(&output)
}

/// Parse the fixed-width column table printed by `docker sandbox ls`.
fn parse_sandbox_ls(output: &str) -> Result<Vec<DockerSandbox>> {
    let mut lines = output.lines();
    let Some(header) = lines.next() else {
        return Ok(Vec::new());
    };

    let col_names = ["SANDBOX ID", "TEMPLATE", "NAME", "WORKSPACE", "STATUS", "CREATED"];
    let mut starts = Vec::with_capacity(col_names.len());
    for name in col_names {
        let idx = header.find(name).ok_or_else(|| {
            anyhow!("docker sandbox ls: missing column {:?} in header: {}", name, header)
        })?;
        starts.push(idx);
    }

    let extract = |line: &str, col: usize| -> String {
        let start = starts[col];
        if start >= line.len() {
            return String::new();
        }
        let end = starts
            .get(col + 1)
            .copied()
            .unwrap_or(line.len())
            .min(line.len());
        line[start..end].trim().to_string()
    };

    let mut sandboxes = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }

        let mut workspace = extract(line, 3);
        // "-" means no workspace
        if workspace == "-" {
            workspace.clear();
        }

        sandboxes.push(DockerSandbox {
            id: extract(line, 0),
            image: extract(line, 1),
            name: extract(line, 2),
            workspace,
            status: extract(line, 4),
        });
    }

    Ok(sandboxes)
}

/// Find a sandbox by its generated name.
pub fn find_by_name(name: &str) -> Result<Option<DockerSandbox>> {
    let sandboxes = list_sandboxes()?;
    Ok(sandboxes.into_iter().find(|sb| sb.name == name))
}

/// Find the sandbox for a workspace: by the expected generated name first,
/// then by matching recorded workspace paths with symlinks resolved on both
/// sides. The fallback handles units created under an older naming scheme.
pub fn find_for_workspace(workspace: &Path) -> Result<Option<DockerSandbox>> {
    let abs = absolute(workspace)?;
    let real = std::fs::canonicalize(&abs).unwrap_or_else(|_| abs.clone());

    let sandboxes = list_sandboxes()?;

    let expected_name = generate_instance_name(&abs);
    if let Some(sb) = sandboxes.iter().find(|sb| sb.name == expected_name) {
        debug!(name = %expected_name, id = %sb.id, "sandbox:found by name");
        return Ok(Some(sb.clone()));
    }

    for sb in &sandboxes {
        if sb.workspace.is_empty() {
            continue;
        }
        let recorded = PathBuf::from(&sb.workspace);
        let recorded_real = std::fs::canonicalize(&recorded).unwrap_or_else(|_| recorded.clone());
        if recorded == abs || recorded == real || recorded_real == abs || recorded_real == real {
            debug!(id = %sb.id, workspace = %abs.display(), "sandbox:found by workspace");
            return Ok(Some(sb.clone()));
        }
    }

    Ok(None)
}

/// Create a sandbox with `docker sandbox create`, attaching the template
/// image when it differs from the stock one.
fn create_sandbox(name: &str, workspace: &Path, template_image: &str, debug_flag: bool) -> Result<()> {
    let abs = absolute(workspace)?;
    let workspace_str = abs.display().to_string();

    let mut args: Vec<&str> = vec!["sandbox"];
    if debug_flag {
        args.push("--debug");
    }
    args.extend(["create", "--name", name]);

    // --load-local-template is required for locally built images
    if !template_image.is_empty() && template_image != BASE_TEMPLATE_IMAGE {
        args.extend(["--load-local-template", "--template", template_image]);
    }

    args.extend(["claude", workspace_str.as_str()]);

    info!(
        name = %name,
        workspace = %workspace_str,
        template = %template_image,
        "sandbox:creating"
    );

    Cmd::new("docker")
        .args(&args)
        .run_interactive()
        .context("docker sandbox create failed")
}

/// Remove a sandbox by id or name.
pub fn remove_sandbox(id: &str) -> Result<()> {
    info!(id = %id, "sandbox:removing");
    Cmd::new("docker")
        .args(&["sandbox", "rm", id])
        .run()
        .context("docker sandbox rm failed")?;
    Ok(())
}

impl Backend for SandboxBackend<'_> {
    fn kind(&self) -> BackendKind {
        BackendKind::Sandbox
    }

    fn run(&self, opts: &RunOptions) -> Result<()> {
        let name = opts
            .project
            .instance_name
            .clone()
            .unwrap_or_else(|| generate_instance_name(opts.workspace));

        // Global defaults first, then project profiles, then session extras
        let profiles = merge_profiles(
            &merge_profiles(&opts.global.default_profiles, &opts.project.profiles),
            &opts.profiles,
        );

        info!(
            name = %name,
            workspace = %opts.workspace.display(),
            profiles = ?profiles,
            "sandbox:preparing to run"
        );

        // Host configuration may have changed since the unit last started,
        // so the handoff directory is rewritten on every run.
        handoff::prepare(
            opts.workspace,
            self.config,
            opts.project,
            opts.checked_in,
            BackendKind::Sandbox,
        )
        .context("Failed to prepare handoff directory")?;

        let existing = match find_by_name(&name) {
            Ok(existing) => existing,
            Err(e) => {
                debug!(error = %e, "sandbox:failed to check for existing unit");
                None
            }
        };

        match existing {
            None => {
                // Build the template only when actually creating a unit
                let builder = TemplateBuilder::new(&profiles);
                let template_image = builder
                    .build(opts.force_rebuild)
                    .context("Failed to build template image")?;

                println!("Creating sandbox '{}'...", name);
                match create_sandbox(&name, opts.workspace, &template_image, opts.debug) {
                    Ok(()) => println!("Sandbox '{}' created", name),
                    // Create may fail because a concurrent invocation won
                    // the race; if the unit exists now, that is success and
                    // the run below attaches to it.
                    Err(e) => match find_by_name(&name) {
                        Ok(Some(_)) => {
                            info!(name = %name, "sandbox:created concurrently, attaching");
                            println!("Sandbox '{}' already exists", name);
                        }
                        _ => return Err(e),
                    },
                }
            }
            Some(sb) => {
                println!("Using existing sandbox '{}'", name);
                info!(name = %name, id = %sb.id, status = %sb.status, "sandbox:already exists");
            }
        }

        let mut args: Vec<&str> = vec!["sandbox"];
        if opts.debug {
            args.push("--debug");
        }
        args.extend(["run", name.as_str()]);

        println!("Starting sandbox '{}'...", name);
        Cmd::new("docker")
            .args(&args)
            .run_interactive()
            .context("docker sandbox run failed")?;

        info!("sandbox:exited successfully");
        Ok(())
    }

    fn shell(&self, workspace: &Path) -> Result<()> {
        if is_inside_sandbox() {
            bail!(
                "you are already inside a sandbox\n\
                 Use 'bash' to open a new shell, or exit and run 'agentbox shell' from the host"
            );
        }

        let abs = absolute(workspace)?;
        let info = self
            .find_running(&abs)?
            .ok_or_else(|| {
                anyhow!(
                    "no sandbox is running for workspace: {}\nStart one first with: agentbox run",
                    abs.display()
                )
            })?;

        info!(id = %info.id, workspace = %abs.display(), "sandbox:connecting shell");

        Cmd::new("docker")
            .args(&["sandbox", "exec", "-it", &info.id, "bash"])
            .run_interactive()
            .context("docker sandbox exec failed")
    }

    fn stop(&self, workspace: &Path, remove: bool) -> Result<Option<InstanceInfo>> {
        let abs = absolute(workspace)?;
        let Some(info) = self.find_running(&abs)? else {
            debug!(workspace = %abs.display(), "sandbox:nothing running to stop");
            return Ok(None);
        };

        info!(id = %info.id, name = %info.name, "sandbox:stopping");
        Cmd::new("docker")
            .args(&["sandbox", "stop", &info.id])
            .run()
            .context("docker sandbox stop failed")?;

        if remove {
            remove_sandbox(&info.id)?;
        }

        Ok(Some(info))
    }

    fn find(&self, workspace: &Path) -> Result<Option<InstanceInfo>> {
        Ok(find_for_workspace(workspace)?.map(|sb| sb.to_info()))
    }

    fn find_running(&self, workspace: &Path) -> Result<Option<InstanceInfo>> {
        let Some(info) = self.find(workspace)? else {
            return Ok(None);
        };
        if info.status != InstanceStatus::Running {
            debug!(id = %info.id, status = %info.status, "sandbox:found but not running");
            return Ok(None);
        }
        Ok(Some(info))
    }

    fn list(&self) -> Result<Vec<InstanceInfo>> {
        Ok(list_sandboxes()?.iter().map(|sb| sb.to_info()).collect())
    }

    fn remove(&self, id: &str) -> Result<()> {
        remove_sandbox(id)
    }

    fn save_cache(&self, workspace: &Path) -> Result<()> {
        statecache::save_cache(workspace, self)
    }

    fn cleanup(&self, workspace: &Path) -> Result<()> {
        let abs = absolute(workspace)?;
        let handoff_dir = abs.join(handoff::HANDOFF_DIR);
        if handoff_dir.exists() {
            std::fs::remove_dir_all(&handoff_dir).with_context(|| {
                format!("Failed to remove handoff directory {}", handoff_dir.display())
            })?;
            info!(path = %handoff_dir.display(), "sandbox:handoff directory removed");
        }
        Ok(())
    }

    fn pins_mounts(&self) -> bool {
        // docker sandbox units remember their mount set from creation time
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_sandbox() {
        let output = "SANDBOX ID                                                         TEMPLATE                               NAME                               WORKSPACE                                                  STATUS    CREATED\n\
9bce5b789ffd7460195a5c3d7aac9e5dc181c04f1c50135392e3f2d220a765c5   docker/sandbox-templates:claude-code   claude-sandbox-2026-01-27-103821   /Users/dev/work/eth-uni-demo                               running   2026-01-27 15:38:21\n";

        let sandboxes = parse_sandbox_ls(output).unwrap();
        assert_eq!(sandboxes.len(), 1);
        assert_eq!(
            sandboxes[0],
            DockerSandbox {
                id: "9bce5b789ffd7460195a5c3d7aac9e5dc181c04f1c50135392e3f2d220a765c5".into(),
                image: "docker/sandbox-templates:claude-code".into(),
                name: "claude-sandbox-2026-01-27-103821".into(),
                workspace: "/Users/dev/work/eth-uni-demo".into(),
                status: "running".into(),
            }
        );
    }

    #[test]
    fn parse_header_only() {
        let output = "SANDBOX ID   TEMPLATE   NAME   WORKSPACE   STATUS   CREATED\n";
        assert!(parse_sandbox_ls(output).unwrap().is_empty());
    }

    #[test]
    fn parse_dash_workspace_is_empty() {
        let output = "SANDBOX ID   TEMPLATE     NAME         WORKSPACE   STATUS    CREATED\n\
abc          base:latest  my-sandbox   -           stopped   2026-02-01 10:00:00\n";
        let sandboxes = parse_sandbox_ls(output).unwrap();
        assert_eq!(sandboxes[0].workspace, "");
        assert_eq!(sandboxes[0].status, "stopped");
    }

    #[test]
    fn parse_missing_column_is_error() {
        let output = "SANDBOX ID   TEMPLATE   NAME\nabc   img   foo\n";
        let err = parse_sandbox_ls(output).unwrap_err();
        assert!(err.to_string().contains("WORKSPACE"));
    }
}
