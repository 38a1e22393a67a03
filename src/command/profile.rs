//! `agentbox profile`: inspect and edit the project's profile list.

use std::path::PathBuf;

use anyhow::{Result, bail};
use console::style;

use crate::command::{WorkspaceContext, resolve_workspace};
use crate::config::{GlobalConfig, ProjectConfig};
use crate::profiles::{BUILTIN_PROFILES, get_profile};

pub fn list(workspace: Option<PathBuf>) -> Result<()> {
    let ctx = WorkspaceContext::load(workspace.as_deref(), None)?;

    println!("Available profiles:");
    println!();
    for profile in BUILTIN_PROFILES {
        let marker = if ctx.project.profiles.iter().any(|p| p == profile.name) {
            style("*").green().to_string()
        } else {
            " ".to_string()
        };
        println!("  {} {:<12} {}", marker, profile.name, profile.description);
        if !profile.dependencies.is_empty() {
            println!("      depends on: {}", profile.dependencies.join(", "));
        }
    }
    println!();
    println!("* = enabled for this project");
    Ok(())
}

pub fn add(workspace: Option<PathBuf>, names: Vec<String>) -> Result<()> {
    let workspace = resolve_workspace(workspace.as_deref())?;
    let global = GlobalConfig::load()?;
    let (mut project, _) = ProjectConfig::load(&global, &workspace)?;

    for name in &names {
        if get_profile(name).is_none() {
            bail!("unknown profile: {}", name);
        }
        if project.profiles.contains(name) {
            println!("Profile '{}' already enabled", name);
        } else {
            project.profiles.push(name.clone());
            println!("Added profile '{}'", name);
        }
    }

    project.save(&global, &workspace)?;
    println!("Profile changes take effect when the unit is recreated (agentbox run --recreate).");
    Ok(())
}

pub fn remove(workspace: Option<PathBuf>, names: Vec<String>) -> Result<()> {
    let workspace = resolve_workspace(workspace.as_deref())?;
    let global = GlobalConfig::load()?;
    let (mut project, _) = ProjectConfig::load(&global, &workspace)?;

    let mut removed = 0;
    for name in &names {
        let before = project.profiles.len();
        project.profiles.retain(|p| p != name);
        if project.profiles.len() < before {
            println!("Removed profile '{}'", name);
            removed += 1;
        } else {
            println!("Profile '{}' was not enabled", name);
        }
    }

    if removed > 0 {
        project.save(&global, &workspace)?;
        println!("Profile changes take effect when the unit is recreated (agentbox run --recreate).");
    }
    Ok(())
}
