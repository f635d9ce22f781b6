// Point d'entrée - lance le proxy Kerberos local
use anyhow::Context;
use backon::{ExponentialBuilder, Retryable};
use clap::Parser;
use kerberos_proxy::{Config, NegotiationError, ProxyServer, TokenCache};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(
    name = "kerberos-proxy",
    version,
    about = "Proxy local qui authentifie les requêtes auprès d'un proxy Kerberos"
)]
struct Cli {
    /// Fichier de configuration TOML (défaut: <config_dir>/kerberos-proxy/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Proxy upstream au format host:port
    #[arg(short, long)]
    upstream: Option<String>,

    /// Port d'écoute local
    #[arg(short, long)]
    port: Option<u16>,

    /// Ne pas négocier de jeton avant d'accepter des connexions
    #[arg(long, default_value_t = false)]
    no_prefetch: bool,

    /// Niveau de log (RUST_LOG reste prioritaire)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Charger la configuration puis appliquer la ligne de commande
    let (mut config, source) = Config::load(cli.config.as_deref())?;
    if let Some(upstream) = &cli.upstream {
        config.set_upstream(upstream)?;
    }
    if let Some(port) = cli.port {
        config.listen_port = port;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if cli.no_prefetch {
        config.prefetch_token = false;
    }
    config.validate().context("Configuration invalide")?;

    let _guard = init_tracing(&config);
    tracing::info!("Démarrage de kerberos-proxy");
    match &source {
        Some(path) => tracing::info!("Configuration chargée depuis {:?}", path),
        None => tracing::info!("Aucun fichier de configuration, valeurs par défaut"),
    }
    tracing::info!("Principal de service: {}", config.principal());

    let primitive = kerberos_proxy::system_primitive()?;
    let tokens = Arc::new(kerberos_proxy::token_cache(&config, primitive));

    if config.prefetch_token {
        prefetch_token(&tokens, config.startup_retries).await?;
    }

    let mut server = ProxyServer::new(config, Arc::clone(&tokens));
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    server.stop().await?;
    Ok(())
}

fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    match &config.log_file {
        Some(log_file_path) => {
            let file_appender = tracing_appender::rolling::never(
                log_file_path.parent().unwrap_or_else(|| std::path::Path::new(".")),
                log_file_path.file_name().unwrap_or_default(),
            );
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            tracing_subscriber::fmt()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_env_filter(filter)
                .init();
            tracing::info!("Fichier de logs: {:?}", log_file_path);
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

// Seul échec de négociation fatal: aucun jeton après toutes les tentatives de démarrage.
async fn prefetch_token(tokens: &TokenCache, retries: usize) -> anyhow::Result<()> {
    let token = (|| async { tokens.get_token().await })
        .retry(
            ExponentialBuilder::default()
                .with_min_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(10))
                .with_max_times(retries),
        )
        .notify(|err: &NegotiationError, dur: Duration| {
            tracing::warn!("Obtention du jeton impossible ({}), nouvel essai dans {:?}", err, dur);
        })
        .await
        .context("Impossible d'obtenir un jeton Kerberos au démarrage")?;

    tracing::info!("Jeton Kerberos #{} obtenu", token.generation());
    Ok(())
}
