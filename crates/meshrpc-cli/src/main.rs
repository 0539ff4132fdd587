//! # MeshRPC CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Invoke a service from the routes in meshrpc.toml (prints raw JSON)
//! meshrpc call Echo --params '{"text": "hi"}'
//!
//! # Invoke a service at explicit addresses
//! meshrpc call Echo -a 127.0.0.1:9001 -a 127.0.0.1:9002 --routing-key user-1
//!
//! # List configured routes
//! meshrpc routes --config ./meshrpc.toml
//!
//! # Validate a config file
//! meshrpc check --config ./meshrpc.toml
//! ```
//!
//! Logs go to stderr so `call` output can be piped to other tools.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;
use meshrpc_cli::call::CallOptions;
use meshrpc_cli::{call, load_config, routes};

#[derive(FromArgs)]
/// MeshRPC - client for mesh services
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Call(CallArgs),
    Routes(RoutesArgs),
    Check(CheckArgs),
}

/// Arguments for invoking a service.
///
/// The call goes through the full client path: route resolution, health
/// filtering, failover and the service's recovery strategy.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// invoke a service and print the JSON result
struct CallArgs {
    /// service id to invoke
    #[argh(positional)]
    service: String,

    /// JSON parameters (defaults to {})
    #[argh(option, short = 'p', default = "\"{}\".into()")]
    params: String,

    /// config file (defaults to ./meshrpc.toml when present)
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// address serving the service, replacing its configured route; repeatable
    #[argh(option, short = 'a', long = "address")]
    addresses: Vec<String>,

    /// routing key for hash selection
    #[argh(option, short = 'k', long = "routing-key")]
    routing_key: Option<String>,

    /// overall deadline in milliseconds, failover included
    #[argh(option, short = 't', long = "timeout-ms")]
    timeout_ms: Option<u64>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "routes")]
/// list the routes declared in the config
struct RoutesArgs {
    /// config file (defaults to ./meshrpc.toml when present)
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "check")]
/// validate the config and print effective service commands
struct CheckArgs {
    /// config file (defaults to ./meshrpc.toml when present)
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // `call` only reports warnings by default so its output stays quiet.
    let default_level = match cli.command {
        Commands::Call(_) => "warn",
        _ => "info",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Call(args) => {
            let config = load_config(args.config.as_deref())?;
            let options = CallOptions {
                service_id: args.service,
                params: args.params,
                routing_key: args.routing_key,
                timeout: args.timeout_ms.map(Duration::from_millis),
                addresses: args.addresses,
            };
            let result = call::run(config, &options).await?;
            println!("{}", serde_json::to_string(&result)?);
            Ok(())
        }
        Commands::Routes(args) => {
            let config = load_config(args.config.as_deref())?;
            print!("{}", routes::render_routes(&config)?);
            Ok(())
        }
        Commands::Check(args) => {
            let config = load_config(args.config.as_deref())?;
            tracing::info!(routes = config.routes.len(), commands = config.commands.len(), "config is valid");
            print!("{}", routes::render_commands(&config)?);
            Ok(())
        }
    }
}
