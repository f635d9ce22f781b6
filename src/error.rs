// Erreurs du proxy et traduction en réponses client
use thiserror::Error;

pub type ProxyResult<T> = Result<T, ProxyError>;

/// Échec d'une négociation SPNEGO. Clonable car partagé entre tous les
/// appelants qui attendent la même négociation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("negotiation failed: {reason}")]
pub struct NegotiationError {
    pub reason: String,
}

impl NegotiationError {
    pub fn new(reason: impl Into<String>) -> Self {
        NegotiationError {
            reason: reason.into(),
        }
    }

    pub fn timeout() -> Self {
        NegotiationError::new("timeout")
    }

    pub fn is_timeout(&self) -> bool {
        self.reason == "timeout"
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("upstream proxy still requires authentication after renegotiation")]
    AuthenticationRejectedTwice,

    #[error("upstream proxy unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("upstream proxy timed out: {0}")]
    UpstreamTimeout(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Statut HTTP renvoyé au client, `None` quand il n'y a plus personne à qui répondre.
    pub fn status(&self) -> Option<(u16, &'static str)> {
        match self {
            ProxyError::Negotiation(_) | ProxyError::AuthenticationRejectedTwice => {
                Some((407, "Proxy Authentication Required"))
            }
            ProxyError::UpstreamUnreachable(_) => Some((502, "Bad Gateway")),
            ProxyError::UpstreamTimeout(_) => Some((504, "Gateway Timeout")),
            ProxyError::MalformedRequest(_) => Some((400, "Bad Request")),
            ProxyError::Io(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_client_statuses() {
        assert_eq!(
            ProxyError::from(NegotiationError::new("no ticket")).status(),
            Some((407, "Proxy Authentication Required"))
        );
        assert_eq!(ProxyError::AuthenticationRejectedTwice.status().map(|s| s.0), Some(407));
        assert_eq!(ProxyError::UpstreamUnreachable("reset".into()).status().map(|s| s.0), Some(502));
        assert_eq!(ProxyError::UpstreamTimeout("connect".into()).status().map(|s| s.0), Some(504));
        assert_eq!(ProxyError::MalformedRequest("line".into()).status().map(|s| s.0), Some(400));
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert_eq!(ProxyError::from(io).status(), None);
    }

    #[test]
    fn timeout_is_recognisable() {
        assert!(NegotiationError::timeout().is_timeout());
        assert!(!NegotiationError::new("denied").is_timeout());
    }
}
