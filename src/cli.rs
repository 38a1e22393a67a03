use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};

use crate::backend::BackendKind;
use crate::command;
use crate::entrypoint;

#[derive(Parser)]
#[command(
    name = "agentbox",
    version,
    about = "Runs Claude Code in disposable Docker sandboxes with shared host configuration"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the agent in an isolated unit for this workspace
    Run {
        /// Backend to use (overrides configured backends)
        #[arg(long, value_enum)]
        backend: Option<BackendKind>,

        /// Additional profiles for this session
        #[arg(long = "profile")]
        profiles: Vec<String>,

        /// Remove the existing unit and rebuild the template image
        #[arg(long)]
        recreate: bool,

        /// Mount the Docker socket into the unit (container backend)
        #[arg(long)]
        docker_socket: bool,

        /// Workspace directory (default: current directory)
        #[arg(short, long)]
        workspace: Option<PathBuf>,

        /// Enable debug mode for the external tool
        #[arg(long)]
        debug: bool,
    },

    /// Open a shell in the running unit
    Shell {
        #[arg(long, value_enum)]
        backend: Option<BackendKind>,

        #[arg(short, long)]
        workspace: Option<PathBuf>,
    },

    /// Stop the unit for this workspace
    Stop {
        #[arg(long, value_enum)]
        backend: Option<BackendKind>,

        #[arg(short, long)]
        workspace: Option<PathBuf>,

        /// Also remove the unit after stopping
        #[arg(long)]
        remove: bool,
    },

    /// List units across all backends
    List,

    /// Remove the unit, backend resources, and stored project data
    Clean {
        #[arg(long, value_enum)]
        backend: Option<BackendKind>,

        #[arg(short, long)]
        workspace: Option<PathBuf>,

        /// Also remove cached template images
        #[arg(long)]
        templates: bool,
    },

    /// Manage tool profiles for this project
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Manage environment variables shared with the sandbox
    Env {
        #[command(subcommand)]
        action: EnvAction,
    },

    /// In-sandbox entrypoint: set up from the handoff directory, then exec
    /// the agent
    #[command(hide = true)]
    Entrypoint {
        /// Arguments forwarded to the agent
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ProfileAction {
    /// List available profiles and which are enabled
    List {
        #[arg(short, long)]
        workspace: Option<PathBuf>,
    },
    /// Enable profiles for this project
    Add {
        #[arg(required = true)]
        names: Vec<String>,

        #[arg(short, long)]
        workspace: Option<PathBuf>,
    },
    /// Disable profiles for this project
    Remove {
        #[arg(required = true)]
        names: Vec<String>,

        #[arg(short, long)]
        workspace: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum EnvAction {
    /// List env specs with their resolved values and sources
    List {
        #[arg(short, long)]
        workspace: Option<PathBuf>,
    },
    /// Add env specs (NAME for host passthrough, NAME=VALUE for explicit)
    Add {
        #[arg(required = true)]
        specs: Vec<String>,

        /// Add to the global config (shared across all projects)
        #[arg(long)]
        global: bool,

        #[arg(short, long)]
        workspace: Option<PathBuf>,
    },
    /// Remove env specs by name
    Remove {
        #[arg(required = true)]
        names: Vec<String>,

        /// Remove from the global config
        #[arg(long)]
        global: bool,

        #[arg(short, long)]
        workspace: Option<PathBuf>,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            backend,
            profiles,
            recreate,
            docker_socket,
            workspace,
            debug,
        } => command::run::run(command::run::RunArgs {
            backend,
            profiles,
            recreate,
            docker_socket,
            workspace,
            debug,
        }),
        Commands::Shell { backend, workspace } => command::shell::run(workspace, backend),
        Commands::Stop {
            backend,
            workspace,
            remove,
        } => command::stop::run(workspace, backend, remove),
        Commands::List => command::list::run(),
        Commands::Clean {
            backend,
            workspace,
            templates,
        } => command::clean::run(workspace, backend, templates),
        Commands::Profile { action } => match action {
            ProfileAction::List { workspace } => command::profile::list(workspace),
            ProfileAction::Add { names, workspace } => command::profile::add(workspace, names),
            ProfileAction::Remove { names, workspace } => {
                command::profile::remove(workspace, names)
            }
        },
        Commands::Env { action } => match action {
            EnvAction::List { workspace } => command::env::list(workspace),
            EnvAction::Add {
                specs,
                global,
                workspace,
            } => command::env::add(workspace, specs, global),
            EnvAction::Remove {
                names,
                global,
                workspace,
            } => command::env::remove(workspace, names, global),
        },
        Commands::Entrypoint { args } => entrypoint::run(&args),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut std::io::stdout());
            Ok(())
        }
    }
}
