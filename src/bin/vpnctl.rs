//! vpnctl - VPN profile tool
//!
//! Lists, inspects, imports and deletes stored system VPN profiles without a
//! running service. Secrets are sealed on import and never printed.

use clap::{Parser, Subcommand};
use libnetvpn::error::{VpnError, VpnResult};
use libnetvpn::vpn::binder::BASE_USER_RANGE;
use libnetvpn::{ConfigStore, ServiceConfig, SysVpnConfig};
use std::path::PathBuf;
use std::process;
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "vpnctl")]
#[command(version)]
#[command(about = "VPN profile tool - manage stored system VPN configurations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Service configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Keep the record store and keys under this directory instead
    #[arg(long, conflicts_with = "config")]
    root: Option<PathBuf>,

    /// Owner of the profiles; defaults to the user of the calling uid
    #[arg(short, long)]
    user: Option<i32>,

    /// Output format: text, json
    #[arg(short = 'o', long, default_value = "text")]
    output: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List stored profiles of the user
    List,
    /// Show one profile without its secrets
    Show { vpn_id: String },
    /// Import a profile from a JSON file and print its id
    Import { file: PathBuf },
    /// Delete a stored profile
    Delete { vpn_id: String },
    /// Print the default service configuration
    DefaultConfig,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(false).init();
}

fn service_config(cli: &Cli) -> VpnResult<ServiceConfig> {
    match (&cli.config, &cli.root) {
        (Some(path), _) => ServiceConfig::load(path),
        (None, Some(root)) => Ok(ServiceConfig::with_root(root)),
        (None, None) => Ok(ServiceConfig::default()),
    }
}

fn current_user() -> i32 {
    let uid = unsafe { libc::getuid() };
    i32::try_from(uid / BASE_USER_RANGE).unwrap_or(0)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(cli: &Cli) -> VpnResult<()> {
    if let Commands::DefaultConfig = cli.command {
        let text = toml::to_string_pretty(&ServiceConfig::default())
            .map_err(|e| VpnError::InvalidConfig(format!("Failed to serialize config: {}", e)))?;
        print!("{}", text);
        return Ok(());
    }

    let config = service_config(cli)?;
    let store = ConfigStore::open(&config)?;
    let user = cli.user.unwrap_or_else(current_user);
    debug!("Using profiles of user {}", user);
    let json = cli.output == "json";

    match &cli.command {
        Commands::List => {
            let summaries = store.load_all(user).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else if summaries.is_empty() {
                println!("No VPN profiles for user {}", user);
            } else {
                for s in summaries {
                    println!("{:<38} {:<24} {}", s.vpn_id, s.vpn_name, s.vpn_type);
                }
            }
        }
        Commands::Show { vpn_id } => {
            let profile = store.load(vpn_id).await?;
            if json {
                let value = serde_json::json!({
                    "vpn_id": profile.vpn_id,
                    "vpn_name": profile.vpn_name,
                    "vpn_type": profile.vpn_type.to_string(),
                    "vpn_address": profile.vpn_address,
                    "user_id": profile.user_id,
                    "save_login": profile.save_login,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("id:       {}", profile.vpn_id);
                println!("name:     {}", profile.vpn_name);
                println!("type:     {}", profile.vpn_type);
                println!("server:   {}", profile.vpn_address);
                println!("user id:  {}", profile.user_id);
                println!("login:    {}", if profile.user_name.is_empty() { "none" } else { "stored" });
            }
        }
        Commands::Import { file } => {
            let content = tokio::fs::read_to_string(file).await?;
            let mut profile: SysVpnConfig = serde_json::from_str(&content)?;
            if profile.vpn_id.is_empty() {
                profile.vpn_id = uuid::Uuid::new_v4().to_string();
            }
            if let Some(user) = cli.user {
                profile.user_id = user;
            }
            store.save(&profile).await?;
            println!("{}", profile.vpn_id);
        }
        Commands::Delete { vpn_id } => {
            store.delete(vpn_id).await?;
            println!("Deleted {}", vpn_id);
        }
        Commands::DefaultConfig => {}
    }
    Ok(())
}
