//! VoidLink relay server
//!
//! Public-facing endpoint of the VoidLink tunnel system: accepts desktop
//! client control connections, relays Minecraft, web-map HTTP and voice
//! UDP traffic to them, and restores registered tunnels from a manifest at
//! startup.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use voidlink_auth::{JwtClaims, JwtValidator};
use voidlink_lib::{RelayConfig, TunnelRegistration, TunnelRelay};

/// VoidLink relay - expose Minecraft servers behind NAT
#[derive(Parser, Debug)]
#[command(name = "voidlink-relay")]
#[command(about = "VoidLink relay - expose Minecraft servers behind NAT")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    server_args: ServerArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mint an HS256 client token for a tunnel
    GenerateToken {
        /// JWT secret (must match the relay's --jwt-secret)
        #[arg(long, env = "VOIDLINK_JWT_SECRET")]
        secret: String,

        /// Tunnel id the token is issued for
        #[arg(long)]
        tunnel_id: String,

        /// Token validity in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Control port for desktop client connections
    #[arg(long, default_value = "0.0.0.0:7001")]
    control_addr: SocketAddr,

    /// Shared Minecraft proxy port
    #[arg(long, default_value = "0.0.0.0:25565")]
    mc_addr: SocketAddr,

    /// Shared HTTP proxy port (web-map dashboards)
    #[arg(long, default_value = "0.0.0.0:8081")]
    http_addr: SocketAddr,

    /// Base domain subdomains are routed over (e.g. "eu.example.com")
    #[arg(long, env = "VOIDLINK_DOMAIN", default_value = "eu.example.com")]
    domain: String,

    /// JWT secret for authenticating clients
    #[arg(long, env = "VOIDLINK_JWT_SECRET")]
    jwt_secret: Option<String>,

    /// Public UDP port pool (format: "20000-30000")
    #[arg(long, default_value = "20000-30000")]
    udp_port_range: String,

    /// Tunnel manifest to register at startup (TOML)
    #[arg(long)]
    tunnels: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Startup manifest: the tunnels the admin layer persisted as active.
#[derive(Debug, Deserialize)]
struct TunnelManifest {
    #[serde(default)]
    tunnels: Vec<TunnelRegistration>,
}

fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

fn parse_port_range(range: &str) -> Result<RangeInclusive<u16>> {
    let (lo, hi) = range
        .split_once('-')
        .with_context(|| format!("invalid port range {range:?}, expected \"low-high\""))?;
    let lo: u16 = lo.trim().parse().context("invalid low port")?;
    let hi: u16 = hi.trim().parse().context("invalid high port")?;
    anyhow::ensure!(lo <= hi, "port range is inverted: {range:?}");
    Ok(lo..=hi)
}

fn generate_token(secret: &str, tunnel_id: &str, hours: i64) -> Result<()> {
    let claims = JwtClaims::new(tunnel_id.to_string(), chrono::Duration::hours(hours));
    let token = JwtValidator::encode(secret.as_bytes(), &claims)
        .context("Failed to encode token")?;

    println!("{token}");
    Ok(())
}

async fn serve(args: ServerArgs) -> Result<()> {
    let secret = args
        .jwt_secret
        .context("a JWT secret is required (--jwt-secret or VOIDLINK_JWT_SECRET)")?;

    let config = RelayConfig {
        control_addr: args.control_addr,
        mc_addr: args.mc_addr,
        http_addr: args.http_addr,
        domain: args.domain.clone(),
        udp_port_range: parse_port_range(&args.udp_port_range)?,
    };

    let validator = Arc::new(JwtValidator::new(secret.as_bytes()));
    let relay = TunnelRelay::new(config, validator);

    relay.start().await.context("Failed to start relay")?;
    info!("VoidLink relay up (domain: {})", args.domain);

    if let Some(path) = args.tunnels {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read tunnel manifest {}", path.display()))?;
        let manifest: TunnelManifest =
            toml::from_str(&raw).context("Failed to parse tunnel manifest")?;

        for reg in manifest.tunnels {
            info!(
                tunnel_id = %reg.tunnel_id,
                subdomain = %reg.subdomain,
                "Restoring tunnel from manifest"
            );
            relay.register(reg).await;
        }
    } else {
        warn!("No tunnel manifest given; waiting for registrations");
    }

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    relay.shutdown();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::GenerateToken {
            secret,
            tunnel_id,
            hours,
        }) => generate_token(&secret, &tunnel_id, hours),
        None => {
            setup_logging(&cli.server_args.log_level);
            serve(cli.server_args).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_parses() {
        assert_eq!(parse_port_range("20000-30000").unwrap(), 20000..=30000);
        assert_eq!(parse_port_range("25000 - 25010").unwrap(), 25000..=25010);
        assert!(parse_port_range("30000-20000").is_err());
        assert!(parse_port_range("20000").is_err());
        assert!(parse_port_range("a-b").is_err());
    }

    #[test]
    fn manifest_parses() {
        let manifest: TunnelManifest = toml::from_str(
            r#"
            [[tunnels]]
            tunnel_id = "t1"
            subdomain = "happy-cat"
            mc_local_port = 25565
            udp_local_port = 24454
            udp_public_port = 20777

            [[tunnels]]
            tunnel_id = "t2"
            subdomain = "alpha"
            mc_local_port = 25565
            http_local_port = 8123
            udp_local_port = 24454
            "#,
        )
        .unwrap();

        assert_eq!(manifest.tunnels.len(), 2);
        assert_eq!(manifest.tunnels[0].http_local_port, None);
        assert_eq!(manifest.tunnels[1].http_local_port, Some(8123));
        assert_eq!(manifest.tunnels[0].udp_public_port, Some(20777));
    }
}
