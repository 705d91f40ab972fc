use crate::config::Config;
use crate::gateway::{self, AppState};
use crate::registry::ToolRegistry;
use crate::store::{ListFilter, ToolStore};
use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "toolforge", version, about = "Self-extending tool-use agent runtime")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway (default).
    Serve {
        /// Override the configured listen port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Answer a single question from the command line and exit.
    Query {
        question: String,
        #[arg(long)]
        max_iterations: Option<usize>,
        /// Skip container isolation for tool executions.
        #[arg(long)]
        no_sandbox: bool,
    },
    /// List registered and stored tools.
    Tools,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            let mut config = config;
            if let Some(port) = port {
                config.server.port = port;
            }
            gateway::serve(config).await
        }
        Commands::Query {
            question,
            max_iterations,
            no_sandbox,
        } => {
            let state = AppState::from_config(config)?;
            let mut opts = crate::agent::QueryOptions::from_config(&state.config.agent);
            if let Some(n) = max_iterations {
                opts.max_iterations = n.max(1);
            }
            if no_sandbox {
                opts.use_sandbox = false;
            }
            let outcome = state.agent_loop().process(&question, &opts, None).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Tools => {
            let registry = ToolRegistry::open(config.storage.tools_dir.clone())?;
            let status = registry.availability_status().await;
            println!("Registry tools ({} available):", status.available_tools);
            for name in &status.available_tool_names {
                println!("  {name}");
            }
            for name in &status.unavailable_tool_names {
                println!("  {name} (unavailable)");
            }

            let store = ToolStore::open(&config.storage.db_path)?;
            let stored = store.list(&ListFilter::default())?;
            println!("Stored tools ({}):", stored.len());
            for tool in stored {
                let mut flags = Vec::new();
                if !tool.is_active {
                    flags.push("inactive");
                }
                if tool.is_bugged {
                    flags.push("bugged");
                }
                let suffix = if flags.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", flags.join(", "))
                };
                println!("  #{} {}{suffix}", tool.id, tool.name);
            }
            Ok(())
        }
    }
}
