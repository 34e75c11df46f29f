//! snipbox CLI - run snippets locally or against a snipboxd server

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use snipbox_core::protocol::{RunRequest, RunResponse, StatusReport};
use snipbox_core::{Coordinator, SandboxConfig};
use std::io::Read;
use std::path::PathBuf;

const DEFAULT_URL: &str = "http://127.0.0.1:8000";

#[derive(Parser)]
#[command(name = "snipbox")]
#[command(author, version, about = "Sandboxed execution of untrusted code snippets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute code through a running snipboxd
    Exec {
        /// Code to execute (or - for stdin)
        code: String,

        /// Server URL
        #[arg(short, long, env = "SNIPBOX_URL", default_value = DEFAULT_URL)]
        url: String,
    },

    /// Get server slot usage
    Status {
        #[arg(short, long, env = "SNIPBOX_URL", default_value = DEFAULT_URL)]
        url: String,
    },

    /// Check that the server is up
    Ping {
        #[arg(short, long, env = "SNIPBOX_URL", default_value = DEFAULT_URL)]
        url: String,
    },

    /// Run code directly in this process (no server)
    Run {
        /// Code to execute (or - for stdin)
        code: String,

        /// Interpreter binary
        #[arg(short, long, default_value = "node")]
        interpreter: PathBuf,

        /// Wall-clock limit in milliseconds
        #[arg(short, long, default_value = "5000")]
        timeout: u64,

        /// Memory limit in MB
        #[arg(short, long, default_value = "256")]
        memory: u64,

        /// Allow network access
        #[arg(long)]
        network: bool,

        /// Print the raw outcome as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("snipbox=warn".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let success = match cli.command {
        Commands::Exec { code, url } => exec(&url, read_code(code)?).await?,
        Commands::Status { url } => {
            let status: StatusReport = reqwest::get(endpoint(&url, "status"))
                .await
                .context("connecting to snipboxd")?
                .error_for_status()?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            true
        }
        Commands::Ping { url } => {
            let body = reqwest::get(endpoint(&url, "health"))
                .await
                .context("connecting to snipboxd")?
                .error_for_status()?
                .text()
                .await?;
            println!("{body}");
            true
        }
        Commands::Run {
            code,
            interpreter,
            timeout,
            memory,
            network,
            json,
        } => {
            let config = SandboxConfig::builder()
                .interpreter(interpreter)
                .wall_clock_ms(timeout)
                .memory_limit_mb(memory)
                .allow_network(network)
                .build();
            let coordinator = Coordinator::new(config)?;
            let outcome = coordinator.execute(&read_code(code)?).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
                outcome.is_success(coordinator.policy())
            } else {
                print_response(&RunResponse::from_outcome(&outcome, coordinator.policy()))
            }
        }
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

async fn exec(url: &str, code: String) -> Result<bool> {
    let response = reqwest::Client::new()
        .post(endpoint(url, "run"))
        .json(&RunRequest { code })
        .send()
        .await
        .context("connecting to snipboxd")?;

    let status = response.status();
    let body: RunResponse = response
        .json()
        .await
        .with_context(|| format!("unexpected response ({status})"))?;
    Ok(print_response(&body))
}

/// Print output to stdout and the error to stderr; returns `success`
fn print_response(response: &RunResponse) -> bool {
    print!("{}", response.output);
    if let Some(error) = &response.error {
        eprintln!("{}", error.trim_end());
    }
    response.success
}

fn read_code(code: String) -> Result<String> {
    if code != "-" {
        return Ok(code);
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("reading code from stdin")?;
    if buf.is_empty() {
        bail!("no code on stdin");
    }
    Ok(buf)
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{path}", base.trim_end_matches('/'))
}
