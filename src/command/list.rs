//! `agentbox list`: all units from both backends in one table.

use anyhow::{Context, Result};
use tabled::{Table, Tabled, settings::Style};
use tracing::debug;

use crate::backend::{self, BackendKind, InstanceInfo};
use crate::config::{GlobalConfig, list_projects};

#[derive(Tabled)]
struct Row {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "BACKEND")]
    backend: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "WORKSPACE")]
    workspace: String,
    #[tabled(rename = "IMAGE")]
    image: String,
}

impl From<&InstanceInfo> for Row {
    fn from(info: &InstanceInfo) -> Self {
        Self {
            name: info.name.clone(),
            backend: info.backend.to_string(),
            status: info.status.to_string(),
            workspace: info.workspace.display().to_string(),
            image: info.image.clone(),
        }
    }
}

pub fn run() -> Result<()> {
    let global = GlobalConfig::load().context("Failed to load config")?;

    let mut infos: Vec<InstanceInfo> = Vec::new();
    for kind in [BackendKind::Sandbox, BackendKind::Container] {
        let backend = backend::get(kind, &global);
        match backend.list() {
            Ok(mut list) => infos.append(&mut list),
            // One backend being unavailable should not hide the other
            Err(e) => debug!(backend = %kind, error = %e, "list:backend listing failed"),
        }
    }

    if infos.is_empty() {
        println!("No units found. Start one with: agentbox run");
    } else {
        let rows: Vec<Row> = infos.iter().map(Row::from).collect();
        let mut table = Table::new(rows);
        table.with(Style::blank());
        println!("{}", table);
    }

    // Known projects may have no unit at all; show them so stale state can
    // be found and cleaned
    let projects = list_projects(&global)?;
    if !projects.is_empty() {
        println!();
        println!("Known projects:");
        for project in &projects {
            let profiles = if project.config.profiles.is_empty() {
                String::from("-")
            } else {
                project.config.profiles.join(", ")
            };
            println!(
                "  {}  {}  (profiles: {})",
                project.hash,
                project.workspace_path.display(),
                profiles
            );
        }
    }

    Ok(())
}
