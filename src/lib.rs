//! Proxy local qui ajoute un jeton Kerberos/SPNEGO aux requêtes envoyées
//! vers un proxy d'entreprise authentifiant.

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod proxy;
pub mod relay;
pub mod token;
pub mod tunnel;
pub mod upstream;

use std::sync::Arc;

pub use auth::{CredentialToken, NegotiationEngine, SecurityContext, SecurityPrimitive, StepOutput};
pub use config::Config;
pub use error::{NegotiationError, ProxyError};
pub use proxy::ProxyServer;
pub use token::TokenCache;

/// Cache de jetons pour l'upstream configuré, les tours intermédiaires passant par une sonde CONNECT.
pub fn token_cache(config: &Config, primitive: Arc<dyn SecurityPrimitive>) -> TokenCache {
    let transport = Arc::new(upstream::UpstreamProbe::new(config));
    let engine = NegotiationEngine::new(config.principal(), primitive, transport);
    TokenCache::new(Arc::new(engine), config.negotiate_timeout())
}

/// Primitive GSSAPI du système, disponible avec la feature `gssapi`.
pub fn system_primitive() -> anyhow::Result<Arc<dyn SecurityPrimitive>> {
    #[cfg(feature = "gssapi")]
    {
        Ok(Arc::new(auth::gssapi::Krb5Primitive))
    }

    #[cfg(not(feature = "gssapi"))]
    {
        anyhow::bail!("binaire compilé sans la feature `gssapi`: aucune primitive Kerberos disponible")
    }
}
