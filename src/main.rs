use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use env_logger::Env;
use log::{info, warn};
use netemu::config::{ServerConfig, NETWORK_FILENAME, SERVER_CONFIG_FILE};
use netemu::link::IpRoute2;
use netemu::registry::{EngineContext, ProjectRegistry};
use netemu::topology::check_topology;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Network emulation engine: containers and switches wired into topologies
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the server configuration YAML file
    #[arg(short, long, default_value = SERVER_CONFIG_FILE)]
    config: PathBuf,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the topology of a project directory
    Check {
        project: PathBuf,

        /// Print the errors as a JSON array
        #[arg(long)]
        json: bool,
    },
    /// Load and run a project, then close it when Enter is pressed
    Run {
        project: PathBuf,

        /// Print configuration messages as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write the default server configuration
    InitConfig { path: PathBuf },
}

fn load_server_config(path: &Path) -> Result<ServerConfig> {
    if !path.exists() {
        warn!("Server configuration {:?} not found, using defaults", path);
        return Ok(ServerConfig::default());
    }
    ServerConfig::load(path)
        .wrap_err_with(|| format!("Failed to load server configuration '{}'", path.display()))
}

fn check(project: &Path, json: bool) -> Result<()> {
    let report = check_topology(&project.join(NETWORK_FILENAME), &IpRoute2::new());
    let errors: Vec<String> = report.errors.iter().map(|e| e.to_string()).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&errors)?);
    } else if errors.is_empty() {
        println!("Topology is valid");
    } else {
        println!("Topology is not valid:");
        for error in &errors {
            println!("\t{}", error);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(eyre!("{} validation error(s)", errors.len()))
    }
}

fn run(config: ServerConfig, project: &Path, json: bool) -> Result<()> {
    let ctx = EngineContext::system(config).wrap_err("Failed to initialise the engine")?;
    let registry = ProjectRegistry::new(Arc::new(ctx));

    let project = registry
        .open(project)
        .wrap_err_with(|| format!("Unable to open project '{}'", project.display()))?;
    info!("Project {} opened", project.id);

    let result = project.topology().run();
    let messages = match result {
        Ok(messages) => messages,
        Err(e) => {
            registry.close_all();
            return Err(e).wrap_err("Unable to run the topology");
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
    } else {
        for msg in &messages {
            println!("[{}]", msg.node);
            for line in &msg.messages {
                println!("  {}", line);
            }
        }
    }

    println!("Topology {} running, press Enter to close it", project.id);
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    registry
        .close(&project.id)
        .wrap_err("Error when closing the project")?;
    info!("Project {} closed", project.id);
    Ok(())
}

fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    let args = Args::parse();

    env_logger::Builder::from_env(Env::default().default_filter_or(args.log_level.as_str()))
        .init();

    match args.command {
        Command::Check { project, json } => check(&project, json),
        Command::Run { project, json } => {
            let config = load_server_config(&args.config)?;
            run(config, &project, json)
        }
        Command::InitConfig { path } => {
            ServerConfig::write_default(&path)
                .wrap_err_with(|| format!("Failed to write '{}'", path.display()))?;
            info!("Default server configuration written to {:?}", path);
            Ok(())
        }
    }
}
