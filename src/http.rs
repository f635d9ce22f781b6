// Lecture et écriture des messages HTTP/1.x échangés par le proxy
use crate::error::{ProxyError, ProxyResult};
use bytes::Bytes;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) const SUCCESS_CONNECT_RESPONSE: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
pub(crate) const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

const MAX_HEADERS: usize = 128;

// En-têtes adressés à ce proxy, jamais transmis à l'upstream.
const PROXY_HOP_HEADERS: [&str; 3] = ["proxy-authorization", "proxy-connection", "expect"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: u8,
    pub headers: Vec<Header>,
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        find_header(&self.headers, name)
    }

    pub fn expects_continue(&self) -> bool {
        self.header("expect")
            .is_some_and(|value| value.eq_ignore_ascii_case(b"100-continue"))
    }

    pub fn keep_alive(&self) -> bool {
        keep_alive(self.version, &self.headers)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub version: u8,
    pub headers: Vec<Header>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        find_header(&self.headers, name)
    }

    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.headers
            .iter()
            .filter(move |header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_slice())
    }

    pub fn keep_alive(&self) -> bool {
        keep_alive(self.version, &self.headers)
    }
}

/// Requête client, avec son corps déjà lu pour pouvoir la rejouer.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub head: RequestHead,
    pub body: Bytes,
}

impl InboundRequest {
    /// Schéma de la cible: `https` pour CONNECT et les URI `https://`.
    pub fn scheme(&self) -> Scheme {
        if self.head.is_connect() || starts_with_ignore_case(&self.head.target, "https://") {
            Scheme::Https
        } else {
            Scheme::Http
        }
    }

    /// Sérialise la requête vers l'upstream avec un unique `Proxy-Authorization`.
    pub fn encode(&self, authorization: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(
            format!(
                "{} {} HTTP/1.{}\r\n",
                self.head.method, self.head.target, self.head.version
            )
            .as_bytes(),
        );

        for header in &self.head.headers {
            if PROXY_HOP_HEADERS
                .iter()
                .any(|hop| header.name.eq_ignore_ascii_case(hop))
            {
                continue;
            }
            out.extend_from_slice(header.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(&header.value);
            out.extend_from_slice(b"\r\n");
        }

        if self.head.is_connect() && self.head.header("host").is_none() {
            out.extend_from_slice(format!("Host: {}\r\n", self.head.target).as_bytes());
        }
        out.extend_from_slice(format!("Proxy-Authorization: {}\r\n", authorization).as_bytes());
        if self.head.is_connect() {
            out.extend_from_slice(b"Proxy-Connection: Keep-Alive\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

/// Lit un en-tête HTTP complet (jusqu'à la ligne vide).
/// `None` si la connexion est fermée proprement avant le premier octet.
pub async fn read_head<R>(reader: &mut R, max_bytes: usize) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::with_capacity(1024);

    loop {
        let read = (&mut *reader)
            .take((max_bytes + 1 - raw.len()) as u64)
            .read_until(b'\n', &mut raw)
            .await?;

        if read == 0 {
            if raw.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside message head",
            ));
        }
        if raw.len() > max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message head exceeds {} bytes", max_bytes),
            ));
        }
        // Lignes vides tolérées avant la ligne de requête (RFC 9112 §2.2).
        if raw == b"\r\n" || raw == b"\n" {
            raw.clear();
            continue;
        }
        if raw.ends_with(b"\r\n\r\n") || raw.ends_with(b"\n\n") {
            return Ok(Some(raw));
        }
    }
}

/// Valide la ligne de requête puis analyse les en-têtes.
pub fn parse_request(raw: &[u8]) -> ProxyResult<RequestHead> {
    let line_end = raw
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| ProxyError::MalformedRequest("missing request line".into()))?;
    let line = std::str::from_utf8(&raw[..line_end])
        .map_err(|_| ProxyError::MalformedRequest("request line is not valid UTF-8".into()))?
        .trim_end_matches('\r');
    validate_request_line(line)?;

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyError::MalformedRequest("incomplete request head".into()))
        }
        Err(e) => return Err(ProxyError::MalformedRequest(e.to_string())),
    }

    Ok(RequestHead {
        method: req.method.unwrap_or_default().to_string(),
        target: req.path.unwrap_or_default().to_string(),
        version: req.version.unwrap_or(1),
        headers: collect_headers(req.headers),
    })
}

fn validate_request_line(line: &str) -> ProxyResult<()> {
    let malformed = |reason: &str| ProxyError::MalformedRequest(format!("{}: {:?}", reason, line));

    let parts: Vec<&str> = line.split(' ').collect();
    let [method, target, version] = parts.as_slice() else {
        return Err(malformed("expected METHOD TARGET VERSION"));
    };

    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_uppercase() || b == b'-' || b == b'_') {
        return Err(malformed("invalid method"));
    }
    if *version != "HTTP/1.1" && *version != "HTTP/1.0" {
        return Err(malformed("unsupported version"));
    }

    if *method == "CONNECT" {
        let (host, port) = target
            .rsplit_once(':')
            .ok_or_else(|| malformed("CONNECT target must be host:port"))?;
        if host.is_empty() || port.parse::<u16>().map_or(true, |p| p == 0) {
            return Err(malformed("CONNECT target must be host:port"));
        }
    } else {
        let rest = if starts_with_ignore_case(target, "http://") {
            &target[7..]
        } else if starts_with_ignore_case(target, "https://") {
            &target[8..]
        } else {
            return Err(malformed("proxy requests need an absolute http(s) URI"));
        };
        if rest.is_empty() || rest.starts_with('/') {
            return Err(malformed("absolute URI without authority"));
        }
    }

    Ok(())
}

pub fn parse_response(raw: &[u8]) -> io::Result<ResponseHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    match res.parse(raw) {
        Ok(httparse::Status::Complete(_)) => Ok(ResponseHead {
            status: res.code.unwrap_or_default(),
            version: res.version.unwrap_or(1),
            headers: collect_headers(res.headers),
        }),
        Ok(httparse::Status::Partial) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "incomplete response head",
        )),
        Err(e) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid response head: {}", e),
        )),
    }
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<Header> {
    headers
        .iter()
        .map(|header| Header {
            name: header.name.to_string(),
            value: header.value.to_vec(),
        })
        .collect()
}

fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.as_slice())
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

fn has_token(value: &[u8], token: &str) -> bool {
    String::from_utf8_lossy(value)
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

fn keep_alive(version: u8, headers: &[Header]) -> bool {
    let connection = headers
        .iter()
        .filter(|header| {
            header.name.eq_ignore_ascii_case("connection")
                || header.name.eq_ignore_ascii_case("proxy-connection")
        })
        .map(|header| header.value.as_slice());

    let mut keep = version >= 1;
    for value in connection {
        if has_token(value, "close") {
            return false;
        }
        if has_token(value, "keep-alive") {
            keep = true;
        }
    }
    keep
}

fn is_chunked(headers: &[Header]) -> bool {
    headers
        .iter()
        .filter(|header| header.name.eq_ignore_ascii_case("transfer-encoding"))
        .any(|header| has_token(&header.value, "chunked"))
}

fn content_length(headers: &[Header]) -> io::Result<Option<u64>> {
    match find_header(headers, "content-length") {
        None => Ok(None),
        Some(value) => std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid Content-Length")),
    }
}

pub fn request_framing(head: &RequestHead) -> ProxyResult<BodyFraming> {
    if is_chunked(&head.headers) {
        return Ok(BodyFraming::Chunked);
    }
    match content_length(&head.headers) {
        Ok(Some(0)) | Ok(None) => Ok(BodyFraming::Empty),
        Ok(Some(length)) => Ok(BodyFraming::Length(length)),
        Err(e) => Err(ProxyError::MalformedRequest(e.to_string())),
    }
}

pub fn response_framing(method: &str, head: &ResponseHead) -> io::Result<BodyFraming> {
    if method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&head.status)
        || head.status == 204
        || head.status == 304
        || (method == "CONNECT" && (200..300).contains(&head.status))
    {
        return Ok(BodyFraming::Empty);
    }
    if is_chunked(&head.headers) {
        return Ok(BodyFraming::Chunked);
    }
    Ok(match content_length(&head.headers)? {
        Some(0) => BodyFraming::Empty,
        Some(length) => BodyFraming::Length(length),
        None => BodyFraming::UntilClose,
    })
}

/// Lit le corps brut de la requête (encodage chunked conservé tel quel).
pub async fn read_body<R>(reader: &mut R, framing: BodyFraming, max_bytes: usize) -> ProxyResult<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    match framing {
        BodyFraming::Empty | BodyFraming::UntilClose => {}
        BodyFraming::Length(length) => {
            if length > max_bytes as u64 {
                return Err(ProxyError::MalformedRequest(format!(
                    "request body of {} bytes exceeds the {} bytes limit",
                    length, max_bytes
                )));
            }
            body.resize(length as usize, 0);
            reader.read_exact(&mut body).await?;
        }
        BodyFraming::Chunked => {
            let mut limited = (&mut *reader).take(max_bytes as u64 + 1);
            match copy_chunked(&mut limited, &mut body).await {
                Ok(_) => {}
                Err(_) if body.len() > max_bytes => {
                    return Err(ProxyError::MalformedRequest(format!(
                        "chunked request body exceeds the {} bytes limit",
                        max_bytes
                    )))
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    return Err(ProxyError::MalformedRequest(e.to_string()))
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(Bytes::from(body))
}

/// Recopie un corps de réponse en respectant son découpage. Renvoie le nombre d'octets copiés.
pub async fn copy_body<R, W>(reader: &mut R, writer: &mut W, framing: BodyFraming) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::Empty => Ok(0),
        BodyFraming::Length(length) => {
            let copied = tokio::io::copy_buf(&mut (&mut *reader).take(length), writer).await?;
            if copied < length {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("body truncated after {} of {} bytes", copied, length),
                ));
            }
            Ok(copied)
        }
        BodyFraming::Chunked => copy_chunked(reader, writer).await,
        BodyFraming::UntilClose => tokio::io::copy_buf(reader, writer).await,
    }
}

async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;
    let mut line = Vec::with_capacity(32);

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "chunked body truncated"));
        }
        writer.write_all(&line).await?;
        copied += line.len() as u64;

        let size = chunk_size(&line)?;
        if size == 0 {
            break;
        }

        // Données du chunk suivies de CRLF.
        let expected = size + 2;
        let data = tokio::io::copy_buf(&mut (&mut *reader).take(expected), writer).await?;
        copied += data;
        if data < expected {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "chunk truncated"));
        }
    }

    // Trailers éventuels jusqu'à la ligne vide finale.
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "chunked trailer truncated"));
        }
        writer.write_all(&line).await?;
        copied += line.len() as u64;
        if line == b"\r\n" || line == b"\n" {
            return Ok(copied);
        }
    }
}

fn chunk_size(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size line"))?;
    let size = text.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(size, 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("invalid chunk size {:?}", size)))
}

/// Réponse générée par le proxy lui-même; la connexion est ensuite fermée.
pub async fn write_simple_response<W>(writer: &mut W, status: u16, reason: &str, body: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}
