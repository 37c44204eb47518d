//! Haxorport client CLI.
//!
//! Exposes local HTTP and TCP services through the haxorport broker and
//! maintains the client configuration file.

mod config_file;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use haxorport_client::{Client, ClientConfig, Tunnel, TunnelSpec};
use haxorport_proto::{TunnelAuth, TunnelType};

use config_file::ConfigStore;

/// Haxorport client - HTTP and TCP tunneling.
#[derive(Parser, Debug)]
#[command(name = "haxorport")]
#[command(about = "Expose local services to the internet through the haxorport broker")]
#[command(version)]
struct Cli {
    /// Path to the configuration file (default: ~/.haxorport/config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Expose a local HTTP service
    Http {
        /// Local port to expose
        #[arg(short, long)]
        port: u16,

        /// Requested subdomain under the base domain
        #[arg(short, long)]
        subdomain: Option<String>,

        /// Protect the tunnel with basic auth, as user:password
        #[arg(long, value_name = "USER:PASS")]
        basic_auth: Option<String>,

        /// Protect the tunnel with a required header, as Name:Value
        #[arg(long, value_name = "NAME:VALUE")]
        header_auth: Option<String>,
    },

    /// Expose a local TCP service
    Tcp {
        /// Local port to expose
        #[arg(short, long)]
        port: u16,

        /// Requested remote port on the broker
        #[arg(long)]
        remote_port: Option<u16>,

        /// Local address to forward to (default 127.0.0.1)
        #[arg(long)]
        local_addr: Option<String>,
    },

    /// Inspect or modify the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Install the authentication token into the configuration file
    AuthToken {
        /// Token issued by haxorport.online
        token: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Set a configuration value
    Set { key: String, value: String },
    /// Print a single configuration value
    Get { key: String },
    /// Print the resolved configuration
    Show,
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let store = ConfigStore::new(cli.config.clone())?;
    let mut config = store.load()?;

    match cli.command {
        Command::Config { action } => match action {
            ConfigAction::Set { key, value } => {
                config_file::set_value(&mut config, &key, &value)?;
                store.save(&config)?;
                println!("{key} = {value}");
                Ok(())
            }
            ConfigAction::Get { key } => {
                println!("{}", config_file::get_value(&config, &key)?);
                Ok(())
            }
            ConfigAction::Show => {
                print!("{}", serde_yaml::to_string(&config)?);
                Ok(())
            }
        },
        Command::AuthToken { token } => {
            config.auth_token = token;
            config.auth_enabled = true;
            store.save(&config)?;
            println!("Token installed in {}", store.path().display());
            Ok(())
        }
        Command::Http {
            port,
            subdomain,
            basic_auth,
            header_auth,
        } => {
            init_logging(&config)?;
            let mut spec = TunnelSpec::http(port, subdomain);
            spec.auth = parse_tunnel_auth(basic_auth, header_auth)?;
            run_tunnel(config, spec).await
        }
        Command::Tcp {
            port,
            remote_port,
            local_addr,
        } => {
            init_logging(&config)?;
            let mut spec = TunnelSpec::tcp(port, remote_port);
            if let Some(local_addr) = local_addr {
                spec.local_addr = local_addr;
            }
            run_tunnel(config, spec).await
        }
    }
}

/// Connect, register, and serve until interrupted or fatally failed.
async fn run_tunnel(config: ClientConfig, spec: TunnelSpec) -> Result<()> {
    let client = Client::new(config);

    client
        .session()
        .on_authenticated(|| info!("authenticated with broker"));

    // First connect is fatal on failure so misconfiguration surfaces
    // immediately; the supervisor takes over afterwards.
    client.connect().await?;

    let tunnel = client.register(spec).await?;
    announce(&tunnel);

    for tunnel in client.register_configured().await {
        announce(&tunnel);
    }

    client.run_with_reconnect();

    let session = Arc::clone(client.session());
    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutting down");
            client.shutdown().await;
            Ok(())
        }
        err = session.fatal_error() => {
            error!("fatal session error: {err}");
            client.shutdown().await;
            Err(err.into())
        }
    }
}

fn announce(tunnel: &Tunnel) {
    match tunnel.tunnel_type() {
        TunnelType::Http => {
            println!();
            println!("Tunnel {} is up", tunnel.id);
            println!("  Local:  http://127.0.0.1:{}", tunnel.spec.local_port);
            if let Some(url) = &tunnel.url {
                println!("  Public: {url}");
            }
            println!();
        }
        TunnelType::Tcp => {
            println!();
            println!("Tunnel {} is up", tunnel.id);
            println!(
                "  Local:  {}:{}",
                tunnel.spec.local_addr, tunnel.spec.local_port
            );
            if let Some(remote_port) = tunnel.remote_port {
                println!("  Remote: port {remote_port}");
            }
            println!();
        }
    }
}

fn parse_tunnel_auth(
    basic: Option<String>,
    header: Option<String>,
) -> Result<Option<TunnelAuth>> {
    if basic.is_some() && header.is_some() {
        return Err(anyhow!("--basic-auth and --header-auth are mutually exclusive"));
    }

    if let Some(basic) = basic {
        let (username, password) = basic
            .split_once(':')
            .ok_or_else(|| anyhow!("--basic-auth expects user:password"))?;
        return Ok(Some(TunnelAuth::Basic {
            username: username.to_string(),
            password: password.to_string(),
        }));
    }

    if let Some(header) = header {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| anyhow!("--header-auth expects Name:Value"))?;
        return Ok(Some(TunnelAuth::Header {
            header_name: name.trim().to_string(),
            header_value: value.trim().to_string(),
        }));
    }

    Ok(None)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

fn init_logging(config: &ClientConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(config.log_level.as_str()))?;

    let registry = tracing_subscriber::registry().with(filter);

    if config.log_file.is_empty() {
        registry.with(tracing_subscriber::fmt::layer()).init();
    } else {
        let file = std::fs::File::options()
            .create(true)
            .append(true)
            .open(&config.log_file)
            .with_context(|| format!("failed to open log file {}", config.log_file))?;
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
            .init();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_flag_parses() {
        let auth = parse_tunnel_auth(Some("admin:hunter2".to_string()), None)
            .unwrap()
            .unwrap();
        assert_eq!(
            auth,
            TunnelAuth::Basic {
                username: "admin".to_string(),
                password: "hunter2".to_string(),
            }
        );
    }

    #[test]
    fn header_auth_flag_parses() {
        let auth = parse_tunnel_auth(None, Some("X-Api-Key: secret".to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(
            auth,
            TunnelAuth::Header {
                header_name: "X-Api-Key".to_string(),
                header_value: "secret".to_string(),
            }
        );
    }

    #[test]
    fn auth_flags_are_mutually_exclusive() {
        assert!(parse_tunnel_auth(
            Some("a:b".to_string()),
            Some("X:y".to_string())
        )
        .is_err());
        assert!(parse_tunnel_auth(Some("no-colon".to_string()), None).is_err());
        assert!(parse_tunnel_auth(None, None).unwrap().is_none());
    }
}
