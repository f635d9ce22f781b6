// Négociation SPNEGO avec le proxy upstream
use crate::error::NegotiationError;
use base64::Engine;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Nombre maximal d'allers-retours avec l'upstream pour une négociation.
pub const MAX_ROUNDS: usize = 5;

/// Valeur prête à être placée dans `Proxy-Authorization`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialToken {
    value: String,
    issued_at: Instant,
    generation: u64,
}

impl CredentialToken {
    pub fn new(value: String, generation: u64) -> Self {
        CredentialToken {
            value,
            issued_at: Instant::now(),
            generation,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    pub token: Vec<u8>,
    pub done: bool,
}

/// Contexte de sécurité en cours d'établissement.
pub trait SecurityContext: Send {
    /// `input` vaut `None` au premier appel, puis le jeton renvoyé par l'upstream.
    fn step(&mut self, input: Option<&[u8]>) -> Result<StepOutput, NegotiationError>;
}

/// Primitive GSSAPI/SSPI externe.
pub trait SecurityPrimitive: Send + Sync {
    fn initialize(&self, principal: &str) -> Result<Box<dyn SecurityContext>, NegotiationError>;
}

/// Réponse de l'upstream à un jeton intermédiaire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamVerdict {
    /// 407 accompagné d'un jeton de continuation.
    Continue(Vec<u8>),
    /// Jeton accepté, avec éventuellement un jeton final (authentification mutuelle).
    Accepted(Option<Vec<u8>>),
    /// 407 sans jeton exploitable.
    Rejected(u16),
}

/// Canal d'une négociation: l'upstream associe le contexte Negotiate à la connexion,
/// tous les tours d'un même handshake passent donc par la même session.
pub trait ChallengeSession: Send {
    fn exchange<'a>(
        &'a mut self,
        authorization: &'a str,
    ) -> BoxFuture<'a, Result<UpstreamVerdict, NegotiationError>>;
}

/// Ouvre les sessions qui transportent les jetons intermédiaires vers l'upstream.
pub trait ChallengeTransport: Send + Sync {
    fn open(&self) -> BoxFuture<'_, Result<Box<dyn ChallengeSession>, NegotiationError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    NotStarted,
    AwaitingUpstreamContinuation,
    Established,
    Failed,
}

#[derive(Debug)]
struct NegotiationSession {
    principal: String,
    buffer: Vec<u8>,
    phase: NegotiationPhase,
    round: usize,
}

impl NegotiationSession {
    fn new(principal: &str) -> Self {
        NegotiationSession {
            principal: principal.to_string(),
            buffer: Vec::new(),
            phase: NegotiationPhase::NotStarted,
            round: 0,
        }
    }

    fn record(&mut self, output: &StepOutput) {
        if !output.token.is_empty() {
            self.buffer = output.token.clone();
        }
    }

    fn fail(&mut self, reason: impl Into<String>) -> NegotiationError {
        self.phase = NegotiationPhase::Failed;
        let reason = reason.into();
        tracing::warn!(
            "Négociation SPNEGO échouée pour {} (tour {}): {}",
            self.principal,
            self.round,
            reason
        );
        NegotiationError::new(reason)
    }
}

pub struct NegotiationEngine {
    principal: String,
    primitive: Arc<dyn SecurityPrimitive>,
    transport: Arc<dyn ChallengeTransport>,
    issued: AtomicU64,
}

impl NegotiationEngine {
    pub fn new(
        principal: String,
        primitive: Arc<dyn SecurityPrimitive>,
        transport: Arc<dyn ChallengeTransport>,
    ) -> Self {
        NegotiationEngine {
            principal,
            primitive,
            transport,
            issued: AtomicU64::new(0),
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Déroule le handshake complet et renvoie le jeton `Negotiate <base64>`.
    pub async fn negotiate(&self) -> Result<CredentialToken, NegotiationError> {
        let mut session = NegotiationSession::new(&self.principal);
        tracing::debug!("Début de la négociation SPNEGO pour {}", session.principal);

        let primitive = Arc::clone(&self.primitive);
        let principal = self.principal.clone();
        let context = match blocking(move || primitive.initialize(&principal)).await {
            Ok(context) => context,
            Err(e) => return Err(session.fail(e.reason)),
        };

        let (mut context, mut output) = match step(context, None).await {
            Ok(stepped) => stepped,
            Err(e) => return Err(session.fail(e.reason)),
        };

        let mut channel: Option<Box<dyn ChallengeSession>> = None;
        loop {
            session.record(&output);

            if output.done {
                if session.buffer.is_empty() {
                    return Err(session.fail("primitive finished without producing a token"));
                }
                session.phase = NegotiationPhase::Established;
                break;
            }

            if session.round >= MAX_ROUNDS {
                return Err(session.fail(format!("no agreement after {} rounds", MAX_ROUNDS)));
            }
            session.round += 1;
            session.phase = NegotiationPhase::AwaitingUpstreamContinuation;

            // Connexion ouverte au premier tour puis conservée jusqu'à la fin du handshake.
            let mut current = match channel.take() {
                Some(current) => current,
                None => match self.transport.open().await {
                    Ok(opened) => opened,
                    Err(e) => return Err(session.fail(e.reason)),
                },
            };
            let authorization = encode_header(&output.token);
            let verdict = match current.exchange(&authorization).await {
                Ok(verdict) => verdict,
                Err(e) => return Err(session.fail(e.reason)),
            };
            channel = Some(current);

            match verdict {
                UpstreamVerdict::Continue(server_token) => {
                    tracing::debug!("Jeton de continuation reçu (tour {})", session.round);
                    (context, output) = match step(context, Some(server_token)).await {
                        Ok(stepped) => stepped,
                        Err(e) => return Err(session.fail(e.reason)),
                    };
                }
                UpstreamVerdict::Accepted(Some(server_token)) => {
                    // Jeton d'authentification mutuelle: le contexte doit l'accepter.
                    if let Err(e) = step(context, Some(server_token)).await {
                        return Err(session.fail(e.reason));
                    }
                    session.phase = NegotiationPhase::Established;
                    break;
                }
                UpstreamVerdict::Accepted(None) => {
                    session.phase = NegotiationPhase::Established;
                    break;
                }
                UpstreamVerdict::Rejected(status) => {
                    return Err(session.fail(format!("credential rejected by upstream ({})", status)));
                }
            }
        }

        debug_assert_eq!(session.phase, NegotiationPhase::Established);
        let generation = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            "Négociation SPNEGO établie pour {} en {} tour(s), jeton #{}",
            session.principal,
            session.round,
            generation
        );
        Ok(CredentialToken::new(encode_header(&session.buffer), generation))
    }
}

fn encode_header(token: &[u8]) -> String {
    format!(
        "Negotiate {}",
        base64::engine::general_purpose::STANDARD.encode(token)
    )
}

// Les appels GSSAPI peuvent contacter le KDC: hors du runtime async.
async fn blocking<T, F>(f: F) -> Result<T, NegotiationError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, NegotiationError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| NegotiationError::new(format!("negotiation task failed: {}", e)))?
}

async fn step(
    mut context: Box<dyn SecurityContext>,
    input: Option<Vec<u8>>,
) -> Result<(Box<dyn SecurityContext>, StepOutput), NegotiationError> {
    blocking(move || {
        let output = context.step(input.as_deref())?;
        Ok((context, output))
    })
    .await
}

/// Extrait le jeton `Negotiate` d'en-têtes `Proxy-Authenticate`.
///
/// `None`: pas de challenge Negotiate. `Some(None)`: challenge nu.
/// `Some(Some(token))`: jeton de continuation décodé.
pub fn negotiate_challenge<'a, I>(values: I) -> Option<Option<Vec<u8>>>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut found = None;

    for value in values {
        let Ok(value_str) = std::str::from_utf8(value) else {
            continue;
        };

        for part in value_str.split(',') {
            let trimmed = part.trim();
            let Some(scheme) = trimmed.get(..9) else {
                continue;
            };
            if !scheme.eq_ignore_ascii_case("negotiate") {
                continue;
            }

            let rest = &trimmed[9..];
            if !rest.is_empty() && !rest.starts_with(' ') {
                continue;
            }

            let token = rest.trim();
            if token.is_empty() {
                found.get_or_insert(None);
                continue;
            }

            if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(token) {
                return Some(Some(decoded));
            }
        }
    }

    found
}

#[cfg(feature = "gssapi")]
pub mod gssapi {
    //! Primitive adossée à la bibliothèque GSSAPI du système (SSPI sous Windows).
    use super::{SecurityContext, SecurityPrimitive, StepOutput};
    use crate::error::NegotiationError;
    use cross_krb5::{ClientCtx, InitiateFlags, PendingClientCtx, Step};

    pub struct Krb5Primitive;

    impl SecurityPrimitive for Krb5Primitive {
        fn initialize(&self, principal: &str) -> Result<Box<dyn SecurityContext>, NegotiationError> {
            if principal.trim().is_empty() {
                return Err(NegotiationError::new("empty service principal"));
            }
            Ok(Box::new(Krb5Context {
                principal: principal.to_string(),
                state: State::NotStarted,
            }))
        }
    }

    enum State {
        NotStarted,
        Pending(PendingClientCtx),
        Finished,
    }

    struct Krb5Context {
        principal: String,
        state: State,
    }

    impl SecurityContext for Krb5Context {
        fn step(&mut self, input: Option<&[u8]>) -> Result<StepOutput, NegotiationError> {
            match (std::mem::replace(&mut self.state, State::Finished), input) {
                (State::NotStarted, _) => {
                    let (pending, token) =
                        ClientCtx::new(InitiateFlags::empty(), None, &self.principal, None)
                            .map_err(|e| NegotiationError::new(format!("gssapi init: {}", e)))?;
                    let token = token.to_vec();
                    self.state = State::Pending(pending);
                    Ok(StepOutput { token, done: false })
                }
                (State::Pending(pending), Some(input)) => match pending.step(input) {
                    Ok(Step::Finished((_, token))) => Ok(StepOutput {
                        token: token.map(|t| t.to_vec()).unwrap_or_default(),
                        done: true,
                    }),
                    Ok(Step::Continue((pending, token))) => {
                        let token = token.to_vec();
                        self.state = State::Pending(pending);
                        Ok(StepOutput { token, done: false })
                    }
                    Err(e) => Err(NegotiationError::new(format!("gssapi step: {}", e))),
                },
                (State::Pending(pending), None) => {
                    self.state = State::Pending(pending);
                    Err(NegotiationError::new("continuation token required"))
                }
                (State::Finished, _) => Err(NegotiationError::new("security context already established")),
            }
        }
    }
}
