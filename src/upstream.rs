// Connexions vers le proxy upstream
use crate::auth::{negotiate_challenge, ChallengeSession, ChallengeTransport, UpstreamVerdict};
use crate::config::Config;
use crate::error::{NegotiationError, ProxyError, ProxyResult};
use crate::http::{copy_body, parse_response, read_head, response_framing, BodyFraming, Scheme};
use backon::{ExponentialBuilder, Retryable};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const RESPONSE_HEAD_LIMIT: usize = 64 * 1024;

/// Connexion vers l'upstream, utilisée par une seule requête ou un seul tunnel à la fois.
#[derive(Debug)]
pub struct UpstreamConnection {
    id: u64,
    scheme: Scheme,
    stream: BufReader<TcpStream>,
    idle_since: Instant,
}

impl UpstreamConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stream(&mut self) -> &mut BufReader<TcpStream> {
        &mut self.stream
    }

    pub fn into_stream(self) -> BufReader<TcpStream> {
        self.stream
    }

    // Une connexion inactive ne doit ni avoir de données en attente ni avoir été fermée.
    fn is_reusable(&self) -> bool {
        if !self.stream.buffer().is_empty() {
            return false;
        }
        let mut probe = [0u8; 1];
        matches!(
            self.stream.get_ref().try_read(&mut probe),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock
        )
    }
}

/// Pool de connexions vers l'unique upstream, indexé par schéma cible.
pub struct UpstreamPool {
    addr: String,
    connect_timeout: Duration,
    idle_timeout: Duration,
    max_idle_per_scheme: usize,
    idle: Mutex<HashMap<Scheme, Vec<UpstreamConnection>>>,
    opened: AtomicU64,
}

impl UpstreamPool {
    pub fn new(config: &Config) -> Self {
        UpstreamPool {
            addr: config.upstream_addr(),
            connect_timeout: config.connect_timeout(),
            idle_timeout: config.pool_idle_timeout(),
            max_idle_per_scheme: config.pool_max_idle_per_scheme,
            idle: Mutex::new(HashMap::new()),
            opened: AtomicU64::new(0),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Réutilise une connexion inactive du même schéma, sinon en ouvre une nouvelle.
    pub async fn checkout(&self, scheme: Scheme) -> ProxyResult<UpstreamConnection> {
        while let Some(conn) = self.pop_idle(scheme) {
            if conn.idle_since.elapsed() < self.idle_timeout && conn.is_reusable() {
                tracing::debug!("Réutilisation connexion upstream #{} ({})", conn.id, scheme.as_str());
                return Ok(conn);
            }
            tracing::debug!("Connexion upstream #{} expirée, fermeture", conn.id);
        }
        self.connect(scheme).await
    }

    /// Rend une connexion après un échange complet; au-delà de la limite elle est fermée.
    pub fn checkin(&self, mut conn: UpstreamConnection) {
        conn.idle_since = Instant::now();
        let mut idle = self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = idle.entry(conn.scheme).or_default();
        if slot.len() < self.max_idle_per_scheme {
            slot.push(conn);
        }
    }

    pub fn idle_count(&self, scheme: Scheme) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&scheme)
            .map_or(0, Vec::len)
    }

    pub fn opened_count(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    /// Ouvre toujours une nouvelle connexion (tunnels, sondes de négociation).
    pub async fn connect(&self, scheme: Scheme) -> ProxyResult<UpstreamConnection> {
        let stream = connect_with_retry(&self.addr, self.connect_timeout).await?;
        let id = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!("Connexion upstream #{} ouverte vers {} ({})", id, self.addr, scheme.as_str());
        Ok(UpstreamConnection {
            id,
            scheme,
            stream: BufReader::new(stream),
            idle_since: Instant::now(),
        })
    }

    fn pop_idle(&self, scheme: Scheme) -> Option<UpstreamConnection> {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_mut(&scheme)
            .and_then(Vec::pop)
    }
}

/// Connexion TCP bornée dans le temps, avec quelques nouvelles tentatives rapprochées.
pub(crate) async fn connect_with_retry(addr: &str, limit: Duration) -> ProxyResult<TcpStream> {
    let attempt = || async { TcpStream::connect(addr).await };
    let retried = attempt
        .retry(
            ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(1))
                .with_max_times(2),
        )
        .notify(|err: &io::Error, dur: Duration| {
            tracing::debug!("Connexion à {} échouée ({}), nouvel essai dans {:?}", addr, err, dur);
        });

    match tokio::time::timeout(limit, retried).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(ProxyError::UpstreamUnreachable(format!("{}: {}", addr, e))),
        Err(_) => Err(ProxyError::UpstreamTimeout(format!(
            "connection to {} not established within {:?}",
            addr, limit
        ))),
    }
}

/// Transporte les jetons intermédiaires par un `CONNECT` de sonde vers l'upstream.
pub struct UpstreamProbe {
    addr: String,
    authority: String,
    connect_timeout: Duration,
    socket_timeout: Duration,
}

impl UpstreamProbe {
    pub fn new(config: &Config) -> Self {
        UpstreamProbe {
            addr: config.upstream_addr(),
            authority: config
                .probe_authority
                .clone()
                .unwrap_or_else(|| config.upstream_addr()),
            connect_timeout: config.connect_timeout(),
            socket_timeout: config.socket_timeout(),
        }
    }
}

impl ChallengeTransport for UpstreamProbe {
    fn open(&self) -> BoxFuture<'_, Result<Box<dyn ChallengeSession>, NegotiationError>> {
        Box::pin(async move {
            let stream = connect_with_retry(&self.addr, self.connect_timeout)
                .await
                .map_err(|e| NegotiationError::new(e.to_string()))?;
            tracing::debug!("Connexion de négociation ouverte vers {}", self.addr);
            Ok(Box::new(ProbeSession {
                stream: BufReader::new(stream),
                authority: self.authority.clone(),
                socket_timeout: self.socket_timeout,
                reusable: true,
            }) as Box<dyn ChallengeSession>)
        })
    }
}

/// Connexion keep-alive qui porte tous les tours d'un même handshake.
struct ProbeSession {
    stream: BufReader<TcpStream>,
    authority: String,
    socket_timeout: Duration,
    reusable: bool,
}

impl ProbeSession {
    async fn send(&mut self, authorization: &str) -> Result<UpstreamVerdict, NegotiationError> {
        if !self.reusable {
            return Err(NegotiationError::new(
                "upstream closed the negotiation connection between rounds",
            ));
        }

        let request = format!(
            "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Authorization: {authorization}\r\nProxy-Connection: Keep-Alive\r\n\r\n",
            authority = self.authority,
            authorization = authorization,
        );
        self.stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| NegotiationError::new(format!("probe write failed: {}", e)))?;

        let raw = match tokio::time::timeout(self.socket_timeout, read_head(&mut self.stream, RESPONSE_HEAD_LIMIT)).await {
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => return Err(NegotiationError::new("upstream closed the probe connection")),
            Ok(Err(e)) => return Err(NegotiationError::new(format!("probe read failed: {}", e))),
            Err(_) => return Err(NegotiationError::timeout()),
        };
        let head = parse_response(&raw).map_err(|e| NegotiationError::new(e.to_string()))?;
        let challenge = negotiate_challenge(head.header_values("proxy-authenticate"));
        tracing::debug!("Sonde de négociation: statut {}", head.status);

        if head.status == 407 {
            // Le corps du challenge doit être consommé avant le tour suivant.
            let framing = response_framing("CONNECT", &head)
                .map_err(|e| NegotiationError::new(e.to_string()))?;
            let drained = tokio::time::timeout(
                self.socket_timeout,
                copy_body(&mut self.stream, &mut tokio::io::sink(), framing),
            )
            .await;
            if !matches!(drained, Ok(Ok(_))) {
                self.reusable = false;
            }
            self.reusable &= framing != BodyFraming::UntilClose && head.keep_alive();
        } else {
            self.reusable = false;
        }

        Ok(match (head.status, challenge) {
            (407, Some(Some(token))) => UpstreamVerdict::Continue(token),
            (407, _) => UpstreamVerdict::Rejected(407),
            (_, Some(Some(token))) => UpstreamVerdict::Accepted(Some(token)),
            _ => UpstreamVerdict::Accepted(None),
        })
    }
}

impl ChallengeSession for ProbeSession {
    fn exchange<'a>(
        &'a mut self,
        authorization: &'a str,
    ) -> BoxFuture<'a, Result<UpstreamVerdict, NegotiationError>> {
        Box::pin(self.send(authorization))
    }
}
