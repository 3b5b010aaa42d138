//! switchboard-daemon: runs the coordination core behind the HTTP surface.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use switchboard_core::config::{load_config, CoreConfig};
use switchboard_core::store::{JsonStore, MemoryStore, Store};
use switchboard_core::Conductor;
use switchboard_http::SharedState;

#[derive(Parser, Debug)]
#[command(name = "switchboard-daemon")]
#[command(version)]
#[command(about = "Remote control plane for command-line agent sessions")]
struct Args {
    /// Config file (defaults to <data-dir>/config.json)
    #[arg(short, long, env = "SWITCHBOARD_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding sessions, requests, tasks and chat history
    #[arg(long, env = "SWITCHBOARD_DATA_DIR", default_value = ".switchboard")]
    data_dir: PathBuf,

    #[arg(long, env = "SWITCHBOARD_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(short, long, env = "SWITCHBOARD_PORT", default_value_t = 7433)]
    port: u16,

    /// Default log filter; RUST_LOG takes precedence
    #[arg(long, env = "SWITCHBOARD_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Keep everything in memory (nothing survives a restart)
    #[arg(long)]
    memory: bool,

    /// Bearer token required by the HTTP surface
    #[arg(long, env = "SWITCHBOARD_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

impl Args {
    fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| self.data_dir.join("config.json"))
    }

    fn addr(&self) -> Result<SocketAddr, String> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| format!("Invalid address {}:{}: {}", self.host, self.port, e))
    }

    fn store(&self) -> Arc<dyn Store> {
        if self.memory {
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(JsonStore::new(&self.data_dir))
        }
    }
}

async fn build_conductor(args: &Args, config: CoreConfig) -> Result<Conductor, Box<dyn std::error::Error>> {
    let conductor = Conductor::builder()
        .config(config)
        .store(args.store())
        .build();
    conductor.load().await?;
    Ok(conductor)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Cannot listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let config = load_config(&args.config_path())?;
    let addr = args.addr()?;

    if args.memory {
        log::info!("Using in-memory store");
    } else {
        log::info!("Using data directory {}", args.data_dir.display());
    }
    let conductor = build_conductor(&args, config).await?;

    if args.token.is_none() && !addr.ip().is_loopback() {
        log::warn!("Listening on {} without an auth token", addr);
    }
    let state = SharedState::new(conductor).with_auth_token(args.token.clone());

    switchboard_http::serve(Arc::new(state), addr, shutdown_signal()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::SessionId;
    use tempfile::tempdir;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["switchboard-daemon"]).unwrap();
        assert_eq!(args.host, "127.0.0.1");
        assert_eq!(args.port, 7433);
        assert_eq!(args.log_level, "info");
        assert!(!args.memory);
        assert_eq!(args.config_path(), PathBuf::from(".switchboard/config.json"));
        assert!(args.addr().unwrap().ip().is_loopback());
    }

    #[test]
    fn explicit_config_wins() {
        let args = Args::try_parse_from([
            "switchboard-daemon",
            "--config",
            "/etc/switchboard.json",
            "--data-dir",
            "/var/lib/switchboard",
        ])
        .unwrap();
        assert_eq!(args.config_path(), PathBuf::from("/etc/switchboard.json"));
    }

    #[test]
    fn bad_host_is_rejected() {
        let args = Args::try_parse_from(["switchboard-daemon", "--host", "not a host"]).unwrap();
        assert!(args.addr().is_err());
    }

    #[tokio::test]
    async fn json_store_survives_restart() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().to_str().unwrap();
        let args = Args::try_parse_from(["switchboard-daemon", "--data-dir", data_dir]).unwrap();
        let sid = SessionId::from("s1");

        let first = build_conductor(&args, CoreConfig::default()).await.unwrap();
        first.control.register(&sid, "/work/app", None).await.unwrap();

        let second = build_conductor(&args, CoreConfig::default()).await.unwrap();
        assert_eq!(second.get_session(&sid).await.unwrap().project_dir, "/work/app");
    }

    #[tokio::test]
    async fn memory_store_starts_empty() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().to_str().unwrap();
        let args =
            Args::try_parse_from(["switchboard-daemon", "--memory", "--data-dir", data_dir]).unwrap();
        let sid = SessionId::from("s1");

        let first = build_conductor(&args, CoreConfig::default()).await.unwrap();
        first.control.register(&sid, "/work/app", None).await.unwrap();

        let second = build_conductor(&args, CoreConfig::default()).await.unwrap();
        assert!(second.get_session(&sid).await.is_err());
    }
}
