use clap::Parser;
use safe_chain_proxy::env::utf8_vars;
use safe_chain_proxy::{MalwareList, ProxyConfig, ProxySession};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::process::Command;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Run a package manager behind a proxy that blocks known-malicious
/// package downloads.
#[derive(Parser, Debug)]
#[command(name = "safe-chain-proxy", version, about)]
struct Cli {
  /// Malware feed snapshot: a JSON array of
  /// {"package_name", "version", "reason"} objects
  #[arg(long, env = "SAFE_CHAIN_MALWARE_FEED")]
  malware_feed: Option<PathBuf>,

  /// Directory holding the proxy root CA [default: ~/.safe-chain/certs]
  #[arg(long, env = "SAFE_CHAIN_CA_DIR")]
  ca_dir: Option<PathBuf>,

  /// Command to run, e.g. `npm install lodash`
  #[arg(last = true, required = true)]
  command: Vec<String>,
}

fn init_logging() {
  let filter = EnvFilter::try_from_env("SAFE_CHAIN_LOG")
    .unwrap_or_else(|_| EnvFilter::new("safe_chain_proxy=warn"));
  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false),
    )
    .init();
}

async fn load_malware_list(path: Option<PathBuf>) -> safe_chain_proxy::Result<MalwareList> {
  match path {
    Some(path) => {
      let list = MalwareList::from_path(&path).await?;
      tracing::info!("loaded {} malware entries from {}", list.len(), path.display());
      Ok(list)
    }
    None => {
      tracing::warn!("no malware feed given, downloads are not checked against any list");
      Ok(MalwareList::new())
    }
  }
}

async fn run(cli: Cli) -> safe_chain_proxy::Result<ExitCode> {
  let database = load_malware_list(cli.malware_feed).await?;
  let mut config = ProxyConfig::from_env();
  if let Some(ca_dir) = cli.ca_dir {
    config.ca_storage_path = ca_dir;
  }
  let mut session = ProxySession::start(config, Arc::new(database)).await?;

  let (program, args) = match cli.command.split_first() {
    Some(split) => split,
    None => {
      session.stop().await;
      return Ok(ExitCode::from(2));
    }
  };
  let env = session.merge_env(utf8_vars(std::env::vars_os()));
  let status = Command::new(program)
    .args(args)
    .env_clear()
    .envs(env)
    .status()
    .await;
  session.stop().await;

  let status = match status {
    Ok(status) => status,
    Err(e) => {
      tracing::error!("failed to run {}: {}", program, e);
      return Ok(ExitCode::from(127));
    }
  };
  if !session.verify_no_malicious_packages() {
    return Ok(ExitCode::FAILURE);
  }
  let code = status.code().unwrap_or(1);
  Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

#[tokio::main]
async fn main() -> ExitCode {
  init_logging();
  let cli = Cli::parse();
  match run(cli).await {
    Ok(code) => code,
    Err(e) => {
      eprintln!("safe-chain-proxy: {}", e);
      ExitCode::FAILURE
    }
  }
}
