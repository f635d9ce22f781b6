// Cache du jeton Kerberos courant
use crate::auth::{CredentialToken, NegotiationEngine};
use crate::error::NegotiationError;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub type TokenResult = Result<Arc<CredentialToken>, NegotiationError>;

type PendingNegotiation = Shared<BoxFuture<'static, TokenResult>>;

#[derive(Default)]
struct CacheState {
    token: Option<Arc<CredentialToken>>,
    pending: Option<(u64, PendingNegotiation)>,
    attempts: u64,
}

/// Détient au plus un jeton valide et garantit qu'une seule négociation
/// est en cours à la fois; les appelants concurrents partagent son résultat.
pub struct TokenCache {
    engine: Arc<NegotiationEngine>,
    negotiate_timeout: Duration,
    state: Arc<Mutex<CacheState>>,
    negotiations: AtomicUsize,
}

impl TokenCache {
    pub fn new(engine: Arc<NegotiationEngine>, negotiate_timeout: Duration) -> Self {
        TokenCache {
            engine,
            negotiate_timeout,
            state: Arc::new(Mutex::new(CacheState::default())),
            negotiations: AtomicUsize::new(0),
        }
    }

    pub async fn get_token(&self) -> TokenResult {
        let pending = {
            let mut state = lock(&self.state);
            if let Some(token) = &state.token {
                return Ok(Arc::clone(token));
            }
            match &state.pending {
                Some((_, pending)) => pending.clone(),
                None => self.start_negotiation(&mut state),
            }
        };

        pending.await
    }

    pub fn invalidate(&self) {
        let mut state = lock(&self.state);
        if let Some(token) = state.token.take() {
            tracing::debug!("Jeton #{} invalidé", token.generation());
        }
    }

    pub async fn refresh(&self) -> TokenResult {
        self.invalidate();
        self.get_token().await
    }

    /// Comme `refresh`, mais n'invalide que si `stale` est toujours le jeton en cache.
    /// Plusieurs requêtes rejetées avec le même jeton déclenchent une seule renégociation.
    pub async fn renew(&self, stale: &CredentialToken) -> TokenResult {
        {
            let mut state = lock(&self.state);
            let is_current = state
                .token
                .as_ref()
                .is_some_and(|token| token.generation() == stale.generation());
            if is_current {
                tracing::info!(
                    "Jeton #{} refusé par l'upstream après {:?}, renégociation",
                    stale.generation(),
                    stale.issued_at().elapsed()
                );
                state.token = None;
            }
        }
        self.get_token().await
    }

    pub fn current(&self) -> Option<Arc<CredentialToken>> {
        lock(&self.state).token.clone()
    }

    pub fn negotiation_count(&self) -> usize {
        self.negotiations.load(Ordering::SeqCst)
    }

    fn start_negotiation(&self, state: &mut CacheState) -> PendingNegotiation {
        state.attempts += 1;
        let attempt = state.attempts;
        self.negotiations.fetch_add(1, Ordering::SeqCst);

        let engine = Arc::clone(&self.engine);
        let shared_state = Arc::clone(&self.state);
        let limit = self.negotiate_timeout;

        // Tâche détachée: la négociation aboutit même si l'appelant qui l'a lancée abandonne.
        let task = tokio::spawn(async move {
            let result = match tokio::time::timeout(limit, engine.negotiate()).await {
                Ok(Ok(token)) => Ok(Arc::new(token)),
                Ok(Err(e)) => Err(e),
                Err(_) => {
                    tracing::warn!(
                        "Négociation pour {} abandonnée après {:?}",
                        engine.principal(),
                        limit
                    );
                    Err(NegotiationError::timeout())
                }
            };

            let mut state = lock(&shared_state);
            if matches!(&state.pending, Some((id, _)) if *id == attempt) {
                state.pending = None;
                if let Ok(token) = &result {
                    state.token = Some(Arc::clone(token));
                }
            }
            result
        });

        let pending = async move {
            task.await.unwrap_or_else(|e| {
                Err(NegotiationError::new(format!("negotiation task failed: {}", e)))
            })
        }
        .boxed()
        .shared();

        state.pending = Some((attempt, pending.clone()));
        pending
    }
}

fn lock(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
