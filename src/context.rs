//! Project context document assembly.
//!
//! `CLAUDE.md` and `AGENTS.md` files are collected from the filesystem root
//! down to the workspace, concatenated with per-file source banners, and
//! prefixed with embedded operational guidance for the active backend. The
//! in-sandbox runner installs the result into the agent's state-home.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::backend::BackendKind;
use crate::config::absolute;

/// Context file names collected during the upward walk.
const CONTEXT_FILE_NAMES: [&str; 2] = ["CLAUDE.md", "AGENTS.md"];

/// Guidance about the MicroVM sandbox environment.
const SANDBOX_CONTEXT: &str = include_str!("context/sandbox.md");

/// Guidance about the plain container environment.
const CONTAINER_CONTEXT: &str = include_str!("context/container.md");

fn backend_context(backend: BackendKind) -> &'static str {
    match backend {
        BackendKind::Sandbox => SANDBOX_CONTEXT,
        BackendKind::Container => CONTAINER_CONTEXT,
    }
}

/// Walk up from `start_dir` collecting every context file, returning the
/// paths ordered from the filesystem root down to `start_dir`.
pub fn discover_context_files(start_dir: &Path) -> Result<Vec<PathBuf>> {
    let abs = absolute(start_dir)?;

    let mut found = Vec::new();
    let mut dir = abs.clone();
    loop {
        for name in CONTEXT_FILE_NAMES {
            let candidate = dir.join(name);
            if candidate.exists() {
                debug!(path = %candidate.display(), "context:found file");
                found.push(candidate);
            }
        }
        if !dir.pop() {
            break;
        }
    }

    found.reverse();

    info!(
        start_dir = %abs.display(),
        count = found.len(),
        "context:discovered files"
    );
    Ok(found)
}

/// Concatenate context files with source banners, prepending the embedded
/// guidance for the active backend.
pub fn concatenate(files: &[PathBuf], backend: BackendKind) -> Result<String> {
    let mut out = String::new();

    let guidance = backend_context(backend);
    out.push_str("# ==================================================\n");
    out.push_str(&format!(
        "# Source: agentbox (embedded {} backend instructions)\n",
        backend
    ));
    out.push_str("# ==================================================\n\n");
    out.push_str(guidance);
    if !guidance.ends_with('\n') {
        out.push('\n');
    }

    for path in files {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        out.push_str("\n\n");
        out.push_str("# ==================================================\n");
        out.push_str(&format!("# Source: {}\n", path.display()));
        out.push_str("# ==================================================\n\n");
        out.push_str(&content);
        if !content.is_empty() && !content.ends_with('\n') {
            out.push('\n');
        }

        debug!(path = %path.display(), bytes = content.len(), "context:concatenated file");
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn discovery_orders_root_to_workspace() {
        let temp = TempDir::new().unwrap();
        let level1 = temp.path().join("level1");
        let level2 = level1.join("level2");
        let level3 = level2.join("level3");
        fs::create_dir_all(&level3).unwrap();

        let root_claude = temp.path().join("CLAUDE.md");
        let level1_claude = level1.join("CLAUDE.md");
        let level2_agents = level2.join("AGENTS.md");
        let level3_claude = level3.join("CLAUDE.md");
        for (path, body) in [
            (&root_claude, "# root"),
            (&level1_claude, "# level1"),
            (&level2_agents, "# level2 agents"),
            (&level3_claude, "# level3"),
        ] {
            fs::write(path, body).unwrap();
        }

        let files = discover_context_files(&level3).unwrap();
        assert_eq!(
            files,
            vec![root_claude, level1_claude, level2_agents, level3_claude]
        );
    }

    #[test]
    fn concatenation_carries_sources_and_guidance() {
        let temp = TempDir::new().unwrap();
        let file1 = temp.path().join("file1.md");
        let file2 = temp.path().join("file2.md");
        fs::write(&file1, "Content 1").unwrap();
        fs::write(&file2, "Content 2").unwrap();

        let result =
            concatenate(&[file1.clone(), file2.clone()], BackendKind::Sandbox).unwrap();

        assert!(result.contains(&format!("Source: {}", file1.display())));
        assert!(result.contains(&format!("Source: {}", file2.display())));
        assert!(result.contains("Content 1"));
        assert!(result.contains("Content 2"));
        assert!(result.contains("embedded sandbox backend instructions"));
    }

    #[test]
    fn empty_file_list_still_gets_guidance() {
        let result = concatenate(&[], BackendKind::Container).unwrap();
        assert!(result.contains("embedded container backend instructions"));
    }
}
