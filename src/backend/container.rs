//! Standard Docker container backend.
//!
//! Persistence is achieved with a named volume keyed by a hash of the
//! workspace path, mounted at the agent's state-home. The volume is created
//! lazily on the first successful run and destroyed only by an explicit full
//! teardown.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::backend::{
    Backend, BackendKind, InstanceInfo, InstanceStatus, RunOptions, generate_instance_name,
    is_inside_sandbox, merge_profiles,
};
use crate::cmd::Cmd;
use crate::config::{GlobalConfig, absolute, parse_volume_spec, workspace_hash};
use crate::handoff;
use crate::template::TemplateBuilder;

/// Environment variable overriding the Docker socket path to bind-mount.
pub const DOCKER_SOCKET_ENV: &str = "AGENTBOX_DOCKER_SOCKET";

/// The agent's state-home inside the container.
const CONTAINER_STATE_HOME: &str = "/home/agent/.claude";

pub struct ContainerBackend<'a> {
    config: &'a GlobalConfig,
}

impl<'a> ContainerBackend<'a> {
    pub fn new(config: &'a GlobalConfig) -> Self {
        Self { config }
    }

    /// Content-addressed name of the persistence volume for a workspace.
    fn volume_name(&self, workspace: &Path) -> String {
        let abs = absolute(workspace).unwrap_or_else(|_| workspace.to_path_buf());
        format!("agentbox-state-{}", workspace_hash(&abs))
    }

    /// Create the persistence volume when it does not exist yet.
    fn ensure_volume(&self, volume: &str) -> Result<()> {
        let exists = Cmd::new("docker")
            .args(&["volume", "inspect", volume])
            .run_as_check()?;
        if exists {
            debug!(volume = %volume, "container:volume already exists");
            return Ok(());
        }

        info!(volume = %volume, "container:creating persistence volume");
        Cmd::new("docker")
            .args(&["volume", "create", volume])
            .run()
            .context("docker volume create failed")?;
        Ok(())
    }

    fn remove_volume(&self, workspace: &Path) -> Result<()> {
        let volume = self.volume_name(workspace);
        info!(volume = %volume, "container:removing persistence volume");
        Cmd::new("docker")
            .args(&["volume", "rm", &volume])
            .run()
            .context("docker volume rm failed")?;
        Ok(())
    }

    /// Assemble the `docker run` arguments for a fresh container.
    fn build_run_args(
        &self,
        name: &str,
        workspace: &Path,
        image: &str,
        volume: &str,
        opts: &RunOptions,
    ) -> Vec<String> {
        let workspace_str = workspace.display().to_string();
        let mut args: Vec<String> = vec![
            "run".into(),
            "-it".into(),
            "--name".into(),
            name.to_string(),
        ];

        // Host uid/gid mapping keeps workspace files from ending up
        // root-owned.
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        args.push("--user".into());
        args.push(format!("{}:{}", uid, gid));

        // Mirror mount: workspace at the same path on both sides
        args.push("-v".into());
        args.push(format!("{}:{}", workspace_str, workspace_str));

        // Persistence volume for the agent state-home
        args.push("-v".into());
        args.push(format!("{}:{}", volume, CONTAINER_STATE_HOME));

        args.push("-w".into());
        args.push(workspace_str.clone());

        // The in-container runner locates the workspace through this
        args.push("-e".into());
        args.push(format!("WORKSPACE_DIR={}", workspace_str));

        // SSH keys, read-only, when present
        if let Some(home) = home::home_dir() {
            let ssh = home.join(".ssh");
            if ssh.exists() {
                args.push("-v".into());
                args.push(format!("{}:/home/agent/.ssh:ro", ssh.display()));
            }
        }

        if opts.mount_docker_socket {
            match docker_socket_path() {
                Some(socket) => {
                    debug!(path = %socket.display(), "container:mounting docker socket");
                    args.push("-v".into());
                    args.push(format!("{}:/var/run/docker.sock", socket.display()));
                }
                None => warn!("container:docker socket requested but no socket found"),
            }
        }

        // Extra volumes from configuration; bad specs and missing host paths
        // are skipped with a warning rather than aborting the run
        for spec in &opts.project.volumes {
            let (host, dest, read_only) = match parse_volume_spec(spec, "project config") {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(spec = %spec, error = %e, "container:skipping invalid volume");
                    continue;
                }
            };
            if !Path::new(&host).exists() {
                warn!(host = %host, dest = %dest, "container:volume host path not found, skipping");
                continue;
            }
            let mut mount = format!("{}:{}", host, dest);
            if read_only {
                mount.push_str(":ro");
            }
            args.push("-v".into());
            args.push(mount);
        }

        // Agent settings files, read-only, when present
        for settings in ["settings.json", "settings.local.json"] {
            let path = self.config.agent_home.join(settings);
            if path.exists() {
                args.push("-v".into());
                args.push(format!(
                    "{}:{}/{}:ro",
                    path.display(),
                    CONTAINER_STATE_HOME,
                    settings
                ));
            }
        }

        args.push(image.to_string());
        args
    }
}

#[derive(Debug, Deserialize)]
struct ContainerRow {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "State")]
    state: String,
}

/// Query `docker ps -a` rows matching a name filter.
fn ps_rows(filter: &str) -> Result<Vec<ContainerRow>> {
    let output = Cmd::new("docker")
        .args(&["ps", "-a", "--filter", filter, "--format", "{{json .}}"])
        .run_and_capture_stdout()
        .context("docker ps failed")?;

    let mut rows = Vec::new();
    for line in output.lines().filter(|l| !l.is_empty()) {
        match serde_json::from_str::<ContainerRow>(line) {
            Ok(row) => rows.push(row),
            Err(e) => debug!(line = %line, error = %e, "container:unparsable ps row"),
        }
    }
    Ok(rows)
}

/// Inspect a container's bind mounts and return the workspace mirror mount
/// (source == destination), if any.
fn container_workspace(id: &str) -> Option<PathBuf> {
    let output = Cmd::new("docker")
        .args(&[
            "inspect",
            id,
            "--format",
            "{{range .Mounts}}{{if eq .Type \"bind\"}}{{.Source}}:{{.Destination}}\n{{end}}{{end}}",
        ])
        .run_and_capture_stdout()
        .ok()?;

    for line in output.lines() {
        let Some((source, dest)) = line.split_once(':') else {
            continue;
        };
        if source == dest && source.starts_with('/') {
            return Some(PathBuf::from(source));
        }
    }
    None
}

/// The Docker socket path to bind-mount. The env override wins; otherwise
/// platform-specific candidates are probed.
fn docker_socket_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(DOCKER_SOCKET_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
        warn!(path = %path.display(), "container:socket override path does not exist");
    }

    let mut candidates: Vec<PathBuf> = Vec::new();
    if cfg!(target_os = "macos")
        && let Some(home) = home::home_dir()
    {
        candidates.push(home.join(".docker").join("run").join("docker.sock"));
    }
    candidates.push(PathBuf::from("/var/run/docker.sock"));

    candidates.into_iter().find(|p| p.exists())
}

impl Backend for ContainerBackend<'_> {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    fn run(&self, opts: &RunOptions) -> Result<()> {
        let abs = absolute(opts.workspace)?;
        let name = generate_instance_name(&abs);
        // Global defaults first, then project profiles, then session extras
        let profiles = merge_profiles(
            &merge_profiles(&opts.global.default_profiles, &opts.project.profiles),
            &opts.profiles,
        );

        info!(
            name = %name,
            workspace = %abs.display(),
            profiles = ?profiles,
            "container:preparing to run"
        );

        handoff::prepare(
            &abs,
            opts.global,
            opts.project,
            opts.checked_in,
            BackendKind::Container,
        )
        .context("Failed to prepare handoff directory")?;

        let existing = match self.find(&abs) {
            Ok(existing) => existing,
            Err(e) => {
                debug!(error = %e, "container:failed to check for existing unit");
                None
            }
        };

        if let Some(existing) = existing {
            return match existing.status {
                InstanceStatus::Running => {
                    println!("Attaching to running container '{}'...", name);
                    Cmd::new("docker")
                        .args(&["attach", &name])
                        .run_interactive()
                        .context("docker attach failed")
                }
                _ => {
                    println!("Starting existing container '{}'...", name);
                    Cmd::new("docker")
                        .args(&["start", "-ai", &name])
                        .run_interactive()
                        .context("docker start failed")
                }
            };
        }

        // No unit yet: build the template and create one
        let builder = TemplateBuilder::new(&profiles);
        let image = builder
            .build(opts.force_rebuild)
            .context("Failed to build template image")?;

        println!("Creating container '{}'...", name);
        info!(name = %name, image = %image, "container:creating");

        let volume = self.volume_name(&abs);
        self.ensure_volume(&volume)
            .context("Failed to create persistence volume")?;

        let args = self.build_run_args(&name, &abs, &image, &volume, opts);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        debug!(args = ?args, "container:executing docker run");
        println!("Starting container '{}'...", name);

        Cmd::new("docker")
            .args(&arg_refs)
            .run_interactive()
            .context("docker run failed")?;

        info!("container:exited successfully");
        Ok(())
    }

    fn shell(&self, workspace: &Path) -> Result<()> {
        if is_inside_sandbox() {
            bail!(
                "you are already inside a container\n\
                 Use 'bash' to open a new shell, or exit and run 'agentbox shell' from the host"
            );
        }

        let abs = absolute(workspace)?;
        let info = self.find_running(&abs)?.ok_or_else(|| {
            anyhow!(
                "no container is running for workspace: {}\nStart one first with: agentbox run",
                abs.display()
            )
        })?;

        info!(id = %info.id, workspace = %abs.display(), "container:connecting shell");

        Cmd::new("docker")
            .args(&["exec", "-it", &info.id, "bash"])
            .run_interactive()
            .context("docker exec failed")
    }

    fn stop(&self, workspace: &Path, remove: bool) -> Result<Option<InstanceInfo>> {
        let abs = absolute(workspace)?;
        let Some(info) = self.find_running(&abs)? else {
            debug!(workspace = %abs.display(), "container:nothing running to stop");
            return Ok(None);
        };

        info!(id = %info.id, name = %info.name, "container:stopping");
        Cmd::new("docker")
            .args(&["stop", &info.id])
            .run()
            .context("docker stop failed")?;

        if remove {
            info!(id = %info.id, "container:removing");
            Cmd::new("docker")
                .args(&["rm", &info.id])
                .run()
                .context("docker rm failed")?;
        }

        Ok(Some(info))
    }

    fn find(&self, workspace: &Path) -> Result<Option<InstanceInfo>> {
        let abs = absolute(workspace)?;
        let name = generate_instance_name(&abs);
        let filter = format!("name=^{}$", name);

        let rows = match ps_rows(&filter) {
            Ok(rows) => rows,
            Err(e) => {
                debug!(error = %e, "container:docker ps failed");
                return Ok(None);
            }
        };

        let Some(row) = rows.into_iter().next() else {
            // Fallback: scan bind mounts of all agentbox containers for a
            // workspace match, resolving symlinks on both sides
            let real = std::fs::canonicalize(&abs).unwrap_or_else(|_| abs.clone());
            for row in ps_rows("name=^agentbox-").unwrap_or_default() {
                if let Some(ws) = container_workspace(&row.id) {
                    let ws_real = std::fs::canonicalize(&ws).unwrap_or_else(|_| ws.clone());
                    if ws == abs || ws_real == real {
                        return Ok(Some(InstanceInfo {
                            id: row.id,
                            name: row.names,
                            status: InstanceStatus::parse(&row.state),
                            image: row.image,
                            workspace: abs,
                            backend: BackendKind::Container,
                        }));
                    }
                }
            }
            return Ok(None);
        };

        Ok(Some(InstanceInfo {
            id: row.id,
            name: row.names,
            status: InstanceStatus::parse(&row.state),
            image: row.image,
            workspace: abs,
            backend: BackendKind::Container,
        }))
    }

    fn find_running(&self, workspace: &Path) -> Result<Option<InstanceInfo>> {
        let Some(info) = self.find(workspace)? else {
            return Ok(None);
        };
        if info.status != InstanceStatus::Running {
            debug!(id = %info.id, status = %info.status, "container:found but not running");
            return Ok(None);
        }
        Ok(Some(info))
    }

    fn list(&self) -> Result<Vec<InstanceInfo>> {
        let rows = ps_rows("name=^agentbox-")?;
        let mut infos = Vec::new();
        for row in rows {
            let workspace = container_workspace(&row.id).unwrap_or_default();
            infos.push(InstanceInfo {
                id: row.id,
                name: row.names,
                status: InstanceStatus::parse(&row.state),
                image: row.image,
                workspace,
                backend: BackendKind::Container,
            });
        }
        Ok(infos)
    }

    fn remove(&self, id: &str) -> Result<()> {
        info!(id = %id, "container:removing");

        // Stop first in case it is running; the container may already be
        // stopped, so the result is ignored
        let _ = Cmd::new("docker").args(&["stop", id]).run();

        Cmd::new("docker")
            .args(&["rm", id])
            .run()
            .context("docker rm failed")?;
        Ok(())
    }

    fn save_cache(&self, _workspace: &Path) -> Result<()> {
        // The named volume mounted at the state-home persists across
        // restarts; there is nothing to snapshot.
        debug!("container:named volume provides persistence, cache save skipped");
        Ok(())
    }

    fn cleanup(&self, workspace: &Path) -> Result<()> {
        let abs = absolute(workspace)?;

        let handoff_dir = abs.join(handoff::HANDOFF_DIR);
        if handoff_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&handoff_dir) {
                warn!(path = %handoff_dir.display(), error = %e, "container:failed to remove handoff directory");
            } else {
                info!(path = %handoff_dir.display(), "container:handoff directory removed");
            }
        }

        // The volume may not exist; teardown continues regardless
        if let Err(e) = self.remove_volume(&abs) {
            warn!(error = %e, "container:failed to remove persistence volume");
        }

        Ok(())
    }

    fn pins_mounts(&self) -> bool {
        // Run arguments are re-derived whenever a container is created, so a
        // fresh run always reflects current configuration.
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;

    #[test]
    fn volume_name_is_stable_per_workspace() {
        let config = GlobalConfig::default();
        let backend = ContainerBackend::new(&config);
        let a = backend.volume_name(Path::new("/tmp/project-a"));
        let b = backend.volume_name(Path::new("/tmp/project-b"));
        assert!(a.starts_with("agentbox-state-"));
        assert_ne!(a, b);
        assert_eq!(a, backend.volume_name(Path::new("/tmp/project-a")));
    }

    #[test]
    fn run_args_include_workspace_and_volume() {
        let config = GlobalConfig {
            agent_home: PathBuf::from("/nonexistent/.claude"),
            ..Default::default()
        };
        let backend = ContainerBackend::new(&config);
        let project = ProjectConfig::default();
        let opts = RunOptions {
            workspace: Path::new("/tmp/proj"),
            profiles: vec![],
            force_rebuild: false,
            debug: false,
            mount_docker_socket: false,
            global: &config,
            project: &project,
            checked_in: None,
        };

        let args = backend.build_run_args("agentbox-proj", Path::new("/tmp/proj"), "img:1", "vol", &opts);
        assert!(args.contains(&"/tmp/proj:/tmp/proj".to_string()));
        assert!(args.contains(&format!("vol:{}", CONTAINER_STATE_HOME)));
        assert!(args.contains(&"WORKSPACE_DIR=/tmp/proj".to_string()));
        assert_eq!(args.last().unwrap(), "img:1");
    }

    #[test]
    fn run_args_skip_invalid_and_missing_volumes() {
        let config = GlobalConfig {
            agent_home: PathBuf::from("/nonexistent/.claude"),
            ..Default::default()
        };
        let backend = ContainerBackend::new(&config);
        let project = ProjectConfig {
            volumes: vec!["bad-spec".into(), "/definitely/missing:/x".into()],
            ..Default::default()
        };
        let opts = RunOptions {
            workspace: Path::new("/tmp/proj"),
            profiles: vec![],
            force_rebuild: false,
            debug: false,
            mount_docker_socket: false,
            global: &config,
            project: &project,
            checked_in: None,
        };

        let args = backend.build_run_args("agentbox-proj", Path::new("/tmp/proj"), "img:1", "vol", &opts);
        assert!(!args.iter().any(|a| a.contains("bad-spec")));
        assert!(!args.iter().any(|a| a.contains("/definitely/missing")));
    }
}
