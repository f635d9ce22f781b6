// Tunnels CONNECT authentifiés
use crate::error::ProxyResult;
use crate::http::{copy_body, response_framing, InboundRequest, SUCCESS_CONNECT_RESPONSE};
use crate::relay::{AuthenticatedSender, UpstreamResponse};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub struct TunnelHandler {
    sender: Arc<AuthenticatedSender>,
    socket_timeout: Duration,
}

impl TunnelHandler {
    pub(crate) fn new(sender: Arc<AuthenticatedSender>, socket_timeout: Duration) -> Self {
        TunnelHandler {
            sender,
            socket_timeout,
        }
    }

    /// Établit le tunnel auprès de l'upstream puis relaie les octets jusqu'à fermeture.
    pub async fn tunnel<C>(&self, request: &InboundRequest, client: &mut C) -> ProxyResult<()>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let UpstreamResponse { mut conn, raw_head, head } = self.sender.send(request, false).await?;

        if !(200..300).contains(&head.status) {
            tracing::warn!("Tunnel vers {} refusé par l'upstream: {}", request.head.target, head.status);
            client.write_all(&raw_head).await?;
            let framing = response_framing(&request.head.method, &head)?;
            // Corps du refus transmis au mieux; la connexion sera fermée de toute façon.
            let _ = tokio::time::timeout(self.socket_timeout, copy_body(conn.stream(), client, framing)).await;
            client.flush().await?;
            return Ok(());
        }

        client.write_all(SUCCESS_CONNECT_RESPONSE).await?;
        client.flush().await?;

        tracing::info!("Tunnel établi vers {} (upstream #{})", request.head.target, conn.id());
        splice(client, conn.into_stream()).await;
        tracing::debug!("Tunnel vers {} fermé", request.head.target);
        Ok(())
    }
}

/// Relaie les octets dans les deux sens; dès qu'un côté se ferme, les deux sont fermés.
pub(crate) async fn splice<A, B>(client: A, upstream: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    tokio::select! {
        res = tokio::io::copy(&mut client_read, &mut upstream_write) => {
            match res {
                Ok(n) => tracing::debug!("Client->Upstream: {} bytes", n),
                Err(e) => tracing::debug!("Erreur Client->Upstream: {}", e),
            }
        }
        res = tokio::io::copy(&mut upstream_read, &mut client_write) => {
            match res {
                Ok(n) => tracing::debug!("Upstream->Client: {} bytes", n),
                Err(e) => tracing::debug!("Erreur Upstream->Client: {}", e),
            }
        }
    };

    let _ = client_write.shutdown().await;
    let _ = upstream_write.shutdown().await;
}
