// Serveur proxy HTTP
use crate::config::Config;
use crate::error::ProxyError;
use crate::http::{
    parse_request, read_body, read_head, request_framing, write_simple_response, BodyFraming, InboundRequest,
    CONTINUE_RESPONSE,
};
use crate::relay::{AuthenticatedSender, RelayOutcome, RequestRelay};
use crate::token::TokenCache;
use crate::tunnel::TunnelHandler;
use crate::upstream::UpstreamPool;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

pub struct ProxyServer {
    config: Config,
    dispatcher: Arc<Dispatcher>,
    pool: Arc<UpstreamPool>,
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ProxyServer {
    pub fn new(config: Config, tokens: Arc<TokenCache>) -> Self {
        let pool = Arc::new(UpstreamPool::new(&config));
        let sender = Arc::new(AuthenticatedSender::new(
            tokens,
            Arc::clone(&pool),
            config.socket_timeout(),
        ));
        let dispatcher = Dispatcher {
            relay: RequestRelay::new(Arc::clone(&sender)),
            tunnel: TunnelHandler::new(sender, config.socket_timeout()),
            header_timeout: config.client_header_timeout(),
            max_header_bytes: config.max_header_bytes,
            max_body_bytes: config.max_body_bytes,
        };

        ProxyServer {
            config,
            dispatcher: Arc::new(dispatcher),
            pool,
            server_handle: None,
        }
    }

    pub fn pool(&self) -> &Arc<UpstreamPool> {
        &self.pool
    }

    pub async fn start(&mut self) -> Result<SocketAddr> {
        // Arrêter le serveur précédent s'il existe
        if self.server_handle.is_some() {
            self.stop().await?;
        }

        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Impossible d'écouter sur {}", addr))?;
        let local_addr = listener.local_addr()?;

        tracing::info!(
            "Proxy Kerberos en écoute sur {} -> upstream {}",
            local_addr,
            self.pool.addr()
        );

        let dispatcher = Arc::clone(&self.dispatcher);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, client_addr)) => {
                        tracing::debug!("Nouvelle connexion de {}", client_addr);
                        let dispatcher = Arc::clone(&dispatcher);
                        tokio::spawn(async move {
                            dispatcher.handle_connection(stream, client_addr).await;
                        });
                    }
                    Err(e) => {
                        // Typiquement EMFILE: on laisse le temps aux connexions de se fermer.
                        tracing::error!("Erreur accept: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        self.server_handle = Some(handle);
        Ok(local_addr)
    }

    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("Arrêt du serveur proxy");

        if let Some(handle) = self.server_handle.take() {
            handle.abort();
            let _ = handle.await;
            tracing::debug!("Tâche serveur annulée");
        }

        tracing::info!("Serveur proxy arrêté");
        Ok(())
    }
}

struct Dispatcher {
    relay: RequestRelay,
    tunnel: TunnelHandler,
    header_timeout: Duration,
    max_header_bytes: usize,
    max_body_bytes: usize,
}

impl Dispatcher {
    async fn handle_connection(&self, stream: TcpStream, client_addr: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let mut client = BufReader::new(stream);

        // Une itération par requête tant que la connexion reste en keep-alive.
        loop {
            let raw = match tokio::time::timeout(self.header_timeout, read_head(&mut client, self.max_header_bytes)).await {
                Ok(Ok(Some(raw))) => raw,
                Ok(Ok(None)) => {
                    tracing::debug!("Connexion fermée par {}", client_addr);
                    return;
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                    reject(&mut client, client_addr, &ProxyError::MalformedRequest(e.to_string())).await;
                    return;
                }
                Ok(Err(e)) => {
                    tracing::debug!("Erreur lecture depuis {}: {}", client_addr, e);
                    return;
                }
                Err(_) => {
                    tracing::debug!("Timeout lecture depuis {}", client_addr);
                    return;
                }
            };

            let head = match parse_request(&raw) {
                Ok(head) => head,
                Err(e) => {
                    reject(&mut client, client_addr, &e).await;
                    return;
                }
            };
            tracing::debug!("{} {} depuis {}", head.method, head.target, client_addr);

            if head.is_connect() {
                let request = InboundRequest { head, body: Bytes::new() };
                if let Err(e) = self.tunnel.tunnel(&request, &mut client).await {
                    reject(&mut client, client_addr, &e).await;
                }
                return;
            }

            let framing = match request_framing(&head) {
                Ok(framing) => framing,
                Err(e) => {
                    reject(&mut client, client_addr, &e).await;
                    return;
                }
            };
            if head.expects_continue() && framing != BodyFraming::Empty {
                if client.write_all(CONTINUE_RESPONSE).await.is_err() {
                    return;
                }
            }
            let body = match read_body(&mut client, framing, self.max_body_bytes).await {
                Ok(body) => body,
                Err(e) => {
                    reject(&mut client, client_addr, &e).await;
                    return;
                }
            };

            let request = InboundRequest { head, body };
            match self.relay.relay(&request, &mut client).await {
                Ok(RelayOutcome::KeepAlive) => continue,
                Ok(RelayOutcome::Close) => return,
                Err(e) => {
                    reject(&mut client, client_addr, &e).await;
                    return;
                }
            }
        }
    }
}

/// Traduit une erreur en réponse au client, sauf si celui-ci n'est plus joignable.
async fn reject<W>(client: &mut W, client_addr: SocketAddr, error: &ProxyError)
where
    W: AsyncWrite + Unpin,
{
    let Some((status, reason)) = error.status() else {
        tracing::debug!("Connexion {} interrompue: {}", client_addr, error);
        return;
    };

    match error {
        ProxyError::MalformedRequest(_) => tracing::info!("Requête invalide de {}: {}", client_addr, error),
        _ => tracing::warn!("Requête de {} en échec ({}): {}", client_addr, status, error),
    }

    let body = format!("{}\n", error);
    if let Err(e) = write_simple_response(client, status, reason, &body).await {
        tracing::debug!("Erreur envoi réponse {} à {}: {}", status, client_addr, e);
    }
}
