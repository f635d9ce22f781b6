// Relais des requêtes HTTP en clair vers l'upstream
use crate::error::{ProxyError, ProxyResult};
use crate::http::{copy_body, parse_response, read_head, response_framing, BodyFraming, InboundRequest, ResponseHead};
use crate::token::TokenCache;
use crate::tunnel::splice;
use crate::upstream::{UpstreamConnection, UpstreamPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

const RESPONSE_HEAD_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    KeepAlive,
    Close,
}

/// Réponse upstream dont seul l'en-tête a été lu.
pub(crate) struct UpstreamResponse {
    pub conn: UpstreamConnection,
    pub raw_head: Vec<u8>,
    pub head: ResponseHead,
}

/// Envoi authentifié vers l'upstream: un 407 déclenche une seule renégociation.
pub(crate) struct AuthenticatedSender {
    tokens: Arc<TokenCache>,
    pool: Arc<UpstreamPool>,
    socket_timeout: Duration,
}

impl AuthenticatedSender {
    pub fn new(tokens: Arc<TokenCache>, pool: Arc<UpstreamPool>, socket_timeout: Duration) -> Self {
        AuthenticatedSender {
            tokens,
            pool,
            socket_timeout,
        }
    }

    pub fn pool(&self) -> &UpstreamPool {
        &self.pool
    }

    /// `pooled` choisit entre une connexion du pool et une connexion neuve (tunnels).
    pub async fn send(&self, request: &InboundRequest, pooled: bool) -> ProxyResult<UpstreamResponse> {
        let scheme = request.scheme();
        let mut token = self.tokens.get_token().await?;
        let mut renewed = false;

        loop {
            let mut conn = if pooled {
                self.pool.checkout(scheme).await?
            } else {
                self.pool.connect(scheme).await?
            };

            let payload = request.encode(token.value());
            let written = async {
                conn.stream().write_all(&payload).await?;
                conn.stream().flush().await
            }
            .await;
            if let Err(e) = written {
                return Err(ProxyError::UpstreamUnreachable(format!(
                    "write to upstream connection #{} failed: {}",
                    conn.id(),
                    e
                )));
            }

            let (raw_head, head) = self.read_final_head(&mut conn).await?;
            if head.status != 407 {
                return Ok(UpstreamResponse { conn, raw_head, head });
            }

            // Le corps du 407 n'est pas lu: la connexion est abandonnée.
            drop(conn);
            if renewed {
                tracing::warn!(
                    "{} {}: jeton #{} refusé après renégociation",
                    request.head.method,
                    request.head.target,
                    token.generation()
                );
                return Err(ProxyError::AuthenticationRejectedTwice);
            }

            tracing::info!(
                "{} {}: 407 reçu avec le jeton #{}, nouvelle tentative",
                request.head.method,
                request.head.target,
                token.generation()
            );
            token = self.tokens.renew(&token).await?;
            renewed = true;
        }
    }

    // Les réponses 1xx intermédiaires (sauf 101) sont absorbées.
    async fn read_final_head(&self, conn: &mut UpstreamConnection) -> ProxyResult<(Vec<u8>, ResponseHead)> {
        loop {
            let raw = match tokio::time::timeout(self.socket_timeout, read_head(conn.stream(), RESPONSE_HEAD_LIMIT)).await {
                Ok(Ok(Some(raw))) => raw,
                Ok(Ok(None)) => {
                    return Err(ProxyError::UpstreamUnreachable(format!(
                        "upstream connection #{} closed before responding",
                        conn.id()
                    )))
                }
                Ok(Err(e)) => {
                    return Err(ProxyError::UpstreamUnreachable(format!(
                        "reading from upstream connection #{}: {}",
                        conn.id(),
                        e
                    )))
                }
                Err(_) => {
                    return Err(ProxyError::UpstreamTimeout(format!(
                        "no response within {:?}",
                        self.socket_timeout
                    )))
                }
            };

            let head = parse_response(&raw).map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))?;
            if (100..200).contains(&head.status) && head.status != 101 {
                continue;
            }
            return Ok((raw, head));
        }
    }
}

pub struct RequestRelay {
    sender: Arc<AuthenticatedSender>,
}

impl RequestRelay {
    pub(crate) fn new(sender: Arc<AuthenticatedSender>) -> Self {
        RequestRelay { sender }
    }

    /// Transmet la requête et recopie la réponse telle quelle vers le client.
    pub async fn relay<C>(&self, request: &InboundRequest, client: &mut C) -> ProxyResult<RelayOutcome>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let UpstreamResponse { mut conn, raw_head, head } = self.sender.send(request, true).await?;
        tracing::debug!(
            "{} {} -> {} (upstream #{})",
            request.head.method,
            request.head.target,
            head.status,
            conn.id()
        );

        client.write_all(&raw_head).await?;

        if head.status == 101 {
            client.flush().await?;
            splice(&mut *client, conn.into_stream()).await;
            return Ok(RelayOutcome::Close);
        }

        let framing = response_framing(&request.head.method, &head)?;
        copy_body(conn.stream(), client, framing).await?;
        client.flush().await?;

        let reusable = framing != BodyFraming::UntilClose && head.keep_alive();
        if reusable {
            self.sender.pool().checkin(conn);
        }
        if reusable && request.head.keep_alive() {
            Ok(RelayOutcome::KeepAlive)
        } else {
            Ok(RelayOutcome::Close)
        }
    }
}
