use std::io::Read;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "burnbox", about = "burnbox: one-time secret sharing", version)]
struct Cli {
    /// burnbox server URL (default: http://localhost:8080 or $BURNBOX_SERVER)
    #[arg(long, env = "BURNBOX_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Admin bearer token for `prune` ($BURNBOX_ADMIN_TOKEN)
    #[arg(long, env = "BURNBOX_ADMIN_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the burnbox HTTP server
    Serve {
        /// Port to listen on (default: $BURNBOX_PORT or 8080)
        #[arg(long, env = "BURNBOX_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $BURNBOX_HOST or 0.0.0.0)
        #[arg(long, env = "BURNBOX_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Store a secret and print its one-time code
    Create {
        /// Secret content; read from stdin when omitted
        content: Option<String>,
    },
    /// Redeem a code, printing the secret and destroying it
    Redeem {
        /// Access code
        code: String,
    },
    /// Delete all expired secrets immediately
    Prune,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("BURNBOX_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,

        Commands::Create { content } => {
            let content = match content {
                Some(c) => c,
                None => read_stdin()?,
            };
            cmd_create(&cli.server, &content).await
        }

        Commands::Redeem { code } => cmd_redeem(&cli.server, &code).await,

        Commands::Prune => {
            let token = cli
                .token
                .context("--token / BURNBOX_ADMIN_TOKEN is required for this command")?;
            cmd_prune(&cli.server, &token).await
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let cfg = burnbox_server::ServerConfig {
        host,
        port,
        ..burnbox_server::ServerConfig::from_env()?
    };
    burnbox_server::run(cfg).await
}

async fn cmd_create(server: &str, content: &str) -> Result<()> {
    let client = Client::new();
    let resp = client
        .post(format!("{}/secrets", server.trim_end_matches('/')))
        .json(&serde_json::json!({ "content": content }))
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;
    if !status.is_success() {
        anyhow::bail!("{}", error_message(&json, status));
    }

    let code = json["code"].as_str().context("response has no code")?;
    println!("{code}");
    if let Some(exp) = json["expires_at"].as_i64() {
        let secs_left = exp - unix_now();
        eprintln!("expires in {}", format_duration(secs_left.max(0) as u64));
    }
    Ok(())
}

async fn cmd_redeem(server: &str, code: &str) -> Result<()> {
    let client = Client::new();
    let resp = client
        .post(format!("{}/secrets/redeem", server.trim_end_matches('/')))
        .json(&serde_json::json!({ "code": code }))
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;
    if !status.is_success() {
        anyhow::bail!("{}", error_message(&json, status));
    }

    let content = json["content"].as_str().context("response has no content")?;
    println!("{content}");
    Ok(())
}

async fn cmd_prune(server: &str, token: &str) -> Result<()> {
    let client = Client::new();
    let resp = client
        .post(format!("{}/prune", server.trim_end_matches('/')))
        .bearer_auth(token)
        .send()
        .await
        .context("HTTP request failed")?;

    if resp.status().is_success() {
        let json: Value = resp.json().await?;
        let n = json["pruned"].as_u64().unwrap_or(0);
        println!("pruned {n} expired secret(s)");
    } else {
        let status = resp.status();
        anyhow::bail!("server returned {status}");
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn read_stdin() -> Result<String> {
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("read secret from stdin")?;
    Ok(buf)
}

fn error_message(json: &Value, status: reqwest::StatusCode) -> String {
    json["error"]
        .as_str()
        .map(str::to_owned)
        .unwrap_or_else(|| format!("server returned {status}"))
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn format_duration(secs: u64) -> String {
    if secs >= 86400 {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}
