use clap::Parser;
use ldap_wire::config::Config;
use ldap_wire::sasl::{PreferenceOrder, Sasl};
use ldap_wire::{LdapClient, SaslBindRequest};
use std::path::PathBuf;
use tracing::{info, error};
use anyhow::{Context, Result};

#[derive(Parser)]
#[command(name = "ldap-wire")]
#[command(about = "LDAPv3 client - connects, negotiates a SASL bind and optionally asks Who Am I")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Server URL (overrides config; e.g. ldap://localhost:389 or ldaps://dc1:636)
    #[arg(short, long, value_name = "URL")]
    url: Option<String>,

    /// SASL mechanism (overrides config). Without one, the mechanism is picked from the root DSE.
    #[arg(short, long, value_name = "NAME")]
    mechanism: Option<String>,

    /// Authentication identity (PLAIN)
    #[arg(long)]
    username: Option<String>,

    /// Password (PLAIN). Prefer the config file or the LDAP_WIRE_PASSWORD env var.
    #[arg(long)]
    password: Option<String>,

    /// Authorization identity to assume (PLAIN, EXTERNAL)
    #[arg(long)]
    authzid: Option<String>,

    /// Upgrade the connection with StartTLS before binding
    #[arg(long)]
    starttls: bool,

    /// Issue the Who Am I extended operation after the bind
    #[arg(long)]
    whoami: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Configuration source: file {:?}", path);
            Config::from_file(path)?
        }
        None => Config::default(),
    };
    if let Some(url) = &args.url {
        config.connection.url = url.clone();
    }
    if args.starttls {
        config.connection.starttls = true;
    }
    if let Some(mechanism) = &args.mechanism {
        config.bind.mechanism = Some(mechanism.clone());
    }
    let password = args
        .password
        .clone()
        .or_else(|| std::env::var("LDAP_WIRE_PASSWORD").ok());
    for (key, value) in [
        ("username", args.username.clone()),
        ("password", password),
        ("authzid", args.authzid.clone()),
    ] {
        if let Some(value) = value {
            config.bind.options.insert(key.to_string(), value);
        }
    }
    Ok(config)
}

async fn run(config: Config, whoami: bool) -> Result<()> {
    let mut client = LdapClient::connect(&config.connection)
        .await
        .with_context(|| format!("Connect to {}", config.connection.url))?;

    let mut sasl = Sasl::new();
    if !config.bind.preference.is_empty() {
        sasl = sasl.with_selector(Box::new(PreferenceOrder::new(config.bind.preference.clone())));
    }
    client = client.with_sasl(sasl);

    let request = SaslBindRequest::new(config.bind.mechanism.clone(), config.bind.options.clone())
        .with_timeout(config.connection.timeout());
    let outcome = client.sasl_bind(request).await.context("SASL bind")?;
    info!(
        "Bound with {} after {} round(s) (security layer: {})",
        outcome.mechanism, outcome.rounds, outcome.security_layer
    );

    if whoami {
        let identity = client.whoami().await.context("Who Am I")?;
        if identity.is_empty() {
            println!("anonymous");
        } else {
            println!("{}", identity);
        }
    }

    client.unbind().await.context("Unbind")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_wire={},info", log_level))
        .init();

    let config = load_config(&args)?;
    info!("Configuration loaded:");
    info!("  URL: {}", config.connection.url);
    info!("  StartTLS: {}", config.connection.starttls);
    info!(
        "  Mechanism: {}",
        config.bind.mechanism.as_deref().unwrap_or("(automatic)")
    );

    if let Err(e) = run(config, args.whoami).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
    Ok(())
}
