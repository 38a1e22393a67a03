//! Mount drift detection.
//!
//! Units that remember their mount set from creation time can drift from the
//! mounts the current configuration would produce. Expected mounts are
//! derived purely from configuration; actual mounts come from the running
//! unit's metadata. Only missing mounts are actionable: a mount present on
//! the unit but absent from the expectation is not a problem.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::cmd::Cmd;
use crate::config::{GlobalConfig, ProjectConfig, parse_volume_spec};

/// A bind mount: host source, destination inside the unit, read-only flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub read_only: bool,
}

impl VolumeMount {
    pub fn rw(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            read_only: false,
        }
    }

    pub fn ro(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            read_only: true,
        }
    }
}

/// The result of comparing expected against actual mounts.
#[derive(Debug, Default)]
pub struct MountDiff {
    /// Expected mounts with no matching destination+source on the unit
    pub missing: Vec<VolumeMount>,
}

/// Derive the mounts the current configuration would produce, independent of
/// any running unit. Optional host paths (settings files, SSH keys) are only
/// expected when they exist on the host.
pub fn expected_mounts(
    global: &GlobalConfig,
    project: &ProjectConfig,
    workspace: &Path,
) -> Vec<VolumeMount> {
    let mut mounts = Vec::new();

    // Workspace mirror mount
    mounts.push(VolumeMount::rw(workspace, workspace));

    for settings in ["settings.json", "settings.local.json"] {
        let path = global.agent_home.join(settings);
        if path.exists() {
            mounts.push(VolumeMount::ro(
                path,
                PathBuf::from("/home/agent/.claude").join(settings),
            ));
        }
    }

    if let Some(home) = home::home_dir() {
        let ssh = home.join(".ssh");
        if ssh.exists() {
            mounts.push(VolumeMount::ro(ssh, "/home/agent/.ssh"));
        }
    }

    for spec in &project.volumes {
        let Ok((host, dest, read_only)) = parse_volume_spec(spec, "project config") else {
            continue;
        };
        if !Path::new(&host).exists() {
            continue;
        }
        mounts.push(VolumeMount {
            source: PathBuf::from(host),
            destination: PathBuf::from(dest),
            read_only,
        });
    }

    mounts
}

#[derive(Debug, Deserialize)]
struct InspectMount {
    #[serde(rename = "Type")]
    mount_type: String,
    #[serde(rename = "Source", default)]
    source: String,
    #[serde(rename = "Destination", default)]
    destination: String,
    #[serde(rename = "RW", default)]
    rw: bool,
}

/// Query the bind mounts a unit actually has from its inspect metadata.
pub fn actual_mounts(unit_id: &str) -> Result<Vec<VolumeMount>> {
    let output = Cmd::new("docker")
        .args(&["inspect", unit_id, "--format", "{{json .Mounts}}"])
        .run_and_capture_stdout()
        .context("docker inspect failed")?;

    let rows: Vec<InspectMount> =
        serde_json::from_str(&output).context("Failed to parse docker inspect mounts")?;

    Ok(rows
        .into_iter()
        .filter(|m| m.mount_type == "bind")
        .map(|m| VolumeMount {
            source: PathBuf::from(m.source),
            destination: PathBuf::from(m.destination),
            read_only: !m.rw,
        })
        .collect())
}

/// Compare expected and actual mounts, reporting only the missing ones.
///
/// Source comparison tolerates symlink differences: both sides are resolved
/// before the equality check, because host bind-mount sources commonly
/// differ from their canonical form.
pub fn diff(expected: &[VolumeMount], actual: &[VolumeMount]) -> MountDiff {
    let mut missing = Vec::new();

    for want in expected {
        let found = actual.iter().any(|have| {
            have.destination == want.destination && same_source(&have.source, &want.source)
        });
        if !found {
            missing.push(want.clone());
        }
    }

    debug!(
        expected = expected.len(),
        actual = actual.len(),
        missing = missing.len(),
        "mounts:diff computed"
    );
    MountDiff { missing }
}

fn same_source(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    let a_real = std::fs::canonicalize(a).unwrap_or_else(|_| a.to_path_buf());
    let b_real = std::fs::canonicalize(b).unwrap_or_else(|_| b.to_path_buf());
    a_real == b_real
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn diff_reports_only_missing_mounts() {
        let expected = vec![
            VolumeMount::rw("/src/a", "/x"),
            VolumeMount::rw("/src/b", "/y"),
        ];
        let actual = vec![VolumeMount::rw("/src/a", "/x")];

        let diff = diff(&expected, &actual);
        assert_eq!(diff.missing, vec![VolumeMount::rw("/src/b", "/y")]);
    }

    #[test]
    fn diff_ignores_extra_actual_mounts() {
        let expected = vec![VolumeMount::rw("/src/a", "/x")];
        let actual = vec![
            VolumeMount::rw("/src/a", "/x"),
            VolumeMount::rw("/something/else", "/z"),
        ];

        assert!(diff(&expected, &actual).missing.is_empty());
    }

    #[test]
    fn diff_matches_sources_through_symlinks() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("real");
        std::fs::create_dir_all(&target).unwrap();
        let link = temp.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let expected = vec![VolumeMount::rw(link, "/x")];
        let actual = vec![VolumeMount::rw(target, "/x")];

        assert!(diff(&expected, &actual).missing.is_empty());
    }

    #[test]
    fn diff_same_destination_different_source_is_missing() {
        let expected = vec![VolumeMount::rw("/src/a", "/x")];
        let actual = vec![VolumeMount::rw("/src/other", "/x")];

        assert_eq!(diff(&expected, &actual).missing.len(), 1);
    }

    #[test]
    fn expected_mounts_always_include_workspace() {
        let global = GlobalConfig {
            agent_home: PathBuf::from("/nonexistent/.claude"),
            ..Default::default()
        };
        let project = ProjectConfig::default();
        let mounts = expected_mounts(&global, &project, Path::new("/tmp/proj"));

        assert!(mounts.contains(&VolumeMount::rw("/tmp/proj", "/tmp/proj")));
    }

    #[test]
    fn expected_mounts_include_existing_config_volumes() {
        let temp = TempDir::new().unwrap();
        let host_dir = temp.path().join("data");
        std::fs::create_dir_all(&host_dir).unwrap();

        let global = GlobalConfig {
            agent_home: PathBuf::from("/nonexistent/.claude"),
            ..Default::default()
        };
        let project = ProjectConfig {
            volumes: vec![
                format!("{}:/data:ro", host_dir.display()),
                "/missing/host:/nope".to_string(),
            ],
            ..Default::default()
        };

        let mounts = expected_mounts(&global, &project, Path::new("/tmp/proj"));
        assert!(mounts.contains(&VolumeMount::ro(host_dir, "/data")));
        assert!(!mounts.iter().any(|m| m.destination == Path::new("/nope")));
    }
}
