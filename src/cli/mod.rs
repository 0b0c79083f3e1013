//! Command-line interface parsing and handling
//!
//! This module handles parsing command-line arguments and executing the appropriate commands.

pub mod chat;
pub mod serve;
pub mod tool_list;

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::cli::chat::run_chat;
use crate::cli::serve::{run_server, ServeOptions};
use crate::cli::tool_list::list_tools;
use crate::core::config::data::{path_display, Config};

#[derive(Parser, Debug)]
#[command(name = "toolweave")]
#[command(version, about = "Tool-calling chat client and JSON-RPC tool server")]
#[command(
    long_about = "toolweave serves tools over JSON-RPC (SSE + HTTP POST, or stdio) and runs \
a chat loop that lets a language model call tools on the configured servers.\n\n\
Environment Variables:\n\
  OPENAI_API_KEY      API key for the chat model (name configurable via [model] api_key_env)\n\
  TOOLWEAVE_API_KEY   Bearer key required by `toolweave serve` (overrides [server] api_key)\n\
  RUST_LOG            Log filter (overrides --log-level)"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "toolweave=trace"
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Append logs to this file instead of stderr
    #[arg(short = 'l', long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Serve the built-in tools
    Serve {
        /// Address to bind (overrides [server] host)
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (overrides [server] port)
        #[arg(short, long)]
        port: Option<u16>,
        /// Serve one JSON-RPC message per line on stdin/stdout instead of HTTP
        #[arg(long)]
        stdio: bool,
        /// Disable API-key authentication even if a key is configured
        #[arg(long)]
        no_auth: bool,
    },
    /// Connect to the configured tool servers and list their tools
    Tools,
    /// Chat with the model; answers a single prompt when one is given (default)
    Chat {
        #[arg(trailing_var_arg = true)]
        prompt: Vec<String>,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    let level = args.log_level.as_deref().or(config.log_level.as_deref());
    crate::logging::init(level, args.log_file.as_deref())?;

    match args.command.unwrap_or(Commands::Chat { prompt: Vec::new() }) {
        Commands::Serve {
            host,
            port,
            stdio,
            no_auth,
        } => {
            run_server(
                &config,
                ServeOptions {
                    host,
                    port,
                    stdio,
                    no_auth,
                },
            )
            .await
        }
        Commands::Tools => list_tools(&config).await,
        Commands::Chat { prompt } => {
            let prompt = (!prompt.is_empty()).then(|| prompt.join(" "));
            run_chat(&config, prompt).await
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, Box<dyn Error>> {
    match path {
        Some(path) => {
            if !path.exists() {
                eprintln!("⚠️  Config file {} not found; using defaults", path_display(path));
            }
            Ok(Config::load_from_path(path)?)
        }
        None => Ok(Config::load()?),
    }
}
