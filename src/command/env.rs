//! `agentbox env`: manage env specs shared with the sandbox.
//!
//! A spec is `NAME=VALUE` for an explicit value or a bare `NAME` for host
//! passthrough, resolved when the handoff directory is prepared.

use std::path::PathBuf;

use anyhow::{Result, bail};

use crate::command::{WorkspaceContext, resolve_workspace};
use crate::config::{GlobalConfig, ProjectConfig};
use crate::envs::{ResolvedEnv, env_name, merge_envs};

pub fn list(workspace: Option<PathBuf>) -> Result<()> {
    let ctx = WorkspaceContext::load(workspace.as_deref(), None)?;

    let checked_in_envs = ctx
        .checked_in
        .as_ref()
        .map(|c| c.config.envs.as_slice())
        .unwrap_or(&[]);
    let (_, resolved) = merge_envs(&ctx.global.envs, &ctx.project.envs, checked_in_envs);

    if resolved.is_empty() {
        println!("No environment variables configured.");
        println!("Use 'agentbox env add NAME=VALUE' or 'agentbox env add --global NAME' to add one.");
        return Ok(());
    }

    println!("Environment variables:");
    println!();
    print_resolved(&resolved, "  ");
    Ok(())
}

fn print_resolved(resolved: &[ResolvedEnv], prefix: &str) {
    let mut has_passthrough = false;
    let mut has_unset = false;

    for entry in resolved {
        let name = env_name(&entry.spec);
        let source_tag = format!("  [{}]", entry.source);

        if let Some((_, value)) = entry.spec.split_once('=') {
            println!("{}{}={}{}", prefix, name, value, source_tag);
        } else {
            match std::env::var(name) {
                Ok(value) => {
                    println!("{}{}={}  (from host*){}", prefix, name, value, source_tag);
                    has_passthrough = true;
                }
                Err(_) => {
                    println!(
                        "{}{}  (not set on host, will be empty in sandbox){}",
                        prefix, name, source_tag
                    );
                    has_unset = true;
                }
            }
        }
    }

    if has_passthrough || has_unset {
        println!();
    }
    if has_passthrough {
        println!(
            "{}* Value resolved from current host environment; may differ at 'agentbox run' time.",
            prefix
        );
    }
    if has_unset {
        println!(
            "{}Hint: set missing variables on your host or use 'agentbox env add NAME=VALUE' to set an explicit value.",
            prefix
        );
    }
}

pub fn add(workspace: Option<PathBuf>, specs: Vec<String>, global: bool) -> Result<()> {
    if global {
        add_global(specs)
    } else {
        add_project(workspace, specs)
    }
}

fn add_global(specs: Vec<String>) -> Result<()> {
    let mut config = GlobalConfig::load()?;
    upsert(&mut config.envs, &specs, "global")?;
    config.save()?;
    println!("Environment changes take effect on the next 'agentbox run' (no --recreate needed).");
    Ok(())
}

fn add_project(workspace: Option<PathBuf>, specs: Vec<String>) -> Result<()> {
    let workspace = resolve_workspace(workspace.as_deref())?;
    let global = GlobalConfig::load()?;
    let (mut project, _) = ProjectConfig::load(&global, &workspace)?;

    upsert(&mut project.envs, &specs, "project")?;
    project.save(&global, &workspace)?;
    println!("Environment changes take effect on the next 'agentbox run' (no --recreate needed).");
    Ok(())
}

/// Insert or replace specs by variable name, keeping list order.
fn upsert(envs: &mut Vec<String>, specs: &[String], scope: &str) -> Result<()> {
    for spec in specs {
        let name = env_name(spec);
        if name.is_empty() {
            bail!("invalid environment variable: {:?}", spec);
        }

        match envs.iter().position(|e| env_name(e) == name) {
            Some(idx) => {
                envs[idx] = spec.clone();
                println!("Updated '{}' ({})", name, scope);
            }
            None => {
                envs.push(spec.clone());
                println!("Added '{}' ({})", name, scope);
            }
        }
    }
    Ok(())
}

pub fn remove(workspace: Option<PathBuf>, names: Vec<String>, global: bool) -> Result<()> {
    if global {
        let mut config = GlobalConfig::load()?;
        if drain(&mut config.envs, &names, "global") == 0 {
            println!("No matching global environment variables found.");
            return Ok(());
        }
        config.save()?;
    } else {
        let workspace = resolve_workspace(workspace.as_deref())?;
        let global_config = GlobalConfig::load()?;
        let (mut project, _) = ProjectConfig::load(&global_config, &workspace)?;
        if drain(&mut project.envs, &names, "project") == 0 {
            println!("No matching project environment variables found.");
            return Ok(());
        }
        project.save(&global_config, &workspace)?;
    }

    println!("Environment changes take effect on the next 'agentbox run' (no --recreate needed).");
    Ok(())
}

/// Remove specs whose name matches, returning how many were dropped.
fn drain(envs: &mut Vec<String>, names: &[String], scope: &str) -> usize {
    let mut removed = 0;
    envs.retain(|spec| {
        let matched = names.iter().any(|n| n == env_name(spec));
        if matched {
            println!("Removed '{}' ({})", env_name(spec), scope);
            removed += 1;
        }
        !matched
    });
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn upsert_replaces_by_name() {
        let mut envs = specs(&["FOO=old", "BAR"]);
        upsert(&mut envs, &specs(&["FOO=new", "BAZ=1"]), "test").unwrap();
        assert_eq!(envs, specs(&["FOO=new", "BAR", "BAZ=1"]));
    }

    #[test]
    fn upsert_rejects_empty_name() {
        let mut envs = Vec::new();
        assert!(upsert(&mut envs, &specs(&["=oops"]), "test").is_err());
    }

    #[test]
    fn drain_removes_by_name_only() {
        let mut envs = specs(&["FOO=1", "BAR=2", "TOKEN"]);
        let removed = drain(&mut envs, &specs(&["FOO", "TOKEN"]), "test");
        assert_eq!(removed, 2);
        assert_eq!(envs, specs(&["BAR=2"]));
    }
}
