// Application configuration
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    // Proxy upstream (authentification Kerberos obligatoire)
    pub upstream_host: String,
    pub upstream_port: u16,

    // Écoute locale
    pub listen_host: String,
    pub listen_port: u16,

    // SPN cible, par défaut HTTP/<upstream_host>. Forme Kerberos `service/host` attendue
    // par cross-krb5 (KRB5_PRINCIPAL), et non la forme GSS `HTTP@host`.
    pub service_principal: Option<String>,
    // Cible du CONNECT de sonde pendant une négociation en plusieurs tours
    pub probe_authority: Option<String>,

    // Timeouts (en secondes)
    pub connect_timeout: u64,
    pub socket_timeout: u64,
    pub negotiate_timeout: u64,
    pub client_header_timeout: u64,

    // Pool de connexions upstream
    pub pool_idle_timeout: u64,
    pub pool_max_idle_per_scheme: usize,

    // Limites (en octets)
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,

    // Démarrage
    pub startup_retries: usize,
    pub prefetch_token: bool,

    // Logging
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            upstream_host: String::new(),
            upstream_port: 8080,
            listen_host: "127.0.0.1".to_string(),
            listen_port: 3129,
            service_principal: None,
            probe_authority: None,
            connect_timeout: 5,
            socket_timeout: 30,
            negotiate_timeout: 15,
            client_header_timeout: 30,
            pool_idle_timeout: 60,
            pool_max_idle_per_scheme: 8,
            max_header_bytes: 64 * 1024,
            max_body_bytes: 16 * 1024 * 1024,
            startup_retries: 3,
            prefetch_token: true,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Config {
    /// Charge la configuration depuis `path`, ou depuis l'emplacement par défaut.
    /// Un fichier absent à l'emplacement par défaut donne la configuration par défaut.
    /// Renvoie aussi le fichier effectivement lu, à journaliser une fois le logging prêt.
    pub fn load(path: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default_path = Self::config_path()?;
                if !default_path.exists() {
                    return Ok((Self::default(), None));
                }
                default_path
            }
        };

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Unable to read configuration {:?}", config_path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid configuration {:?}", config_path))?;

        Ok((config, Some(config_path)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.upstream_host.trim().is_empty() {
            anyhow::bail!("upstream_host est vide");
        }
        if self.upstream_port == 0 {
            anyhow::bail!("upstream_port doit être non nul");
        }
        let timeouts = [
            ("connect_timeout", self.connect_timeout),
            ("socket_timeout", self.socket_timeout),
            ("negotiate_timeout", self.negotiate_timeout),
            ("client_header_timeout", self.client_header_timeout),
            ("pool_idle_timeout", self.pool_idle_timeout),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            anyhow::bail!("{} doit être non nul", name);
        }
        if self.max_header_bytes < 1024 {
            anyhow::bail!("max_header_bytes trop petit: {}", self.max_header_bytes);
        }
        Ok(())
    }

    /// Applique une valeur `host:port` passée en ligne de commande.
    pub fn set_upstream(&mut self, value: &str) -> Result<()> {
        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("upstream attendu au format host:port, reçu '{}'", value))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("port upstream invalide '{}'", port))?;
        self.upstream_host = host.to_string();
        self.upstream_port = port;
        Ok(())
    }

    pub fn upstream_addr(&self) -> String {
        format!("{}:{}", self.upstream_host, self.upstream_port)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub fn principal(&self) -> String {
        self.service_principal
            .clone()
            .unwrap_or_else(|| format!("HTTP/{}", self.upstream_host))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout)
    }

    pub fn negotiate_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiate_timeout)
    }

    pub fn client_header_timeout(&self) -> Duration {
        Duration::from_secs(self.client_header_timeout)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Unable to find configuration directory"))?;

        Ok(config_dir.join("kerberos-proxy").join("config.toml"))
    }
}
