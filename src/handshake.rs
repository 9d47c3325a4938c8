use crate::{pool, Error, Server};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::BytesMut;
use std::collections::HashMap;
use std::io::{self, Write as _};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use url::Url;

const SWITCHING_PROTOCOLS: &str = "HTTP/1.1 101 Switching Protocols";
const SEC_WEBSOCKET_ACCEPT_UUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Derives the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut sha = pool::SHA1S.acquire();
    sha.update(key.as_bytes());
    sha.update(SEC_WEBSOCKET_ACCEPT_UUID.as_bytes());
    let digest = sha.digest().bytes();
    pool::SHA1S.release(sha);
    BASE64.encode(digest)
}

/// Picks the subprotocol for a response: the first client offer that the
/// server supports, otherwise the first client offer, otherwise nothing.
pub fn select_protocol<'a>(offered: &'a str, supported: &[String]) -> Option<&'a str> {
    let offers: Vec<&str> = offered
        .split(',')
        .map(str::trim)
        .filter(|offer| !offer.is_empty())
        .collect();
    let first = *offers.first()?;
    offers
        .into_iter()
        .find(|offer| supported.iter().any(|accept| accept == offer))
        .or(Some(first))
}

/// Compares an `Origin` header against the configured origin, matching
/// `scheme://host[:port]` case-insensitively.
pub fn origin_allowed(allowed: &Url, origin: &str) -> bool {
    let mut scratch = pool::BUFFERS.acquire();
    scratch.extend_from_slice(allowed.scheme().as_bytes());
    scratch.extend_from_slice(b"://");
    if let Some(host) = allowed.host_str() {
        scratch.extend_from_slice(host.as_bytes());
    }
    if let Some(port) = allowed.port() {
        let _ = write!(scratch, ":{}", port);
    }
    let matches = scratch.eq_ignore_ascii_case(origin.as_bytes());
    pool::BUFFERS.release(scratch);
    matches
}

/// Reads the upgrade request up to its blank line. A client may pipeline
/// its first frame behind the request in the same write; whatever the
/// buffered reader has consumed past the delimiter is returned so the
/// connection's frame parser starts from those bytes instead of losing
/// them.
async fn read_request(
    stream: &mut (impl AsyncRead + Unpin),
) -> Result<(Vec<u8>, BytesMut), Error> {
    const CRLF_CRLF: &[u8] = b"\r\n\r\n";

    let mut request = Vec::new();

    let mut buf_reader = BufReader::new(stream);
    while !request.ends_with(CRLF_CRLF) {
        if buf_reader.read_until(b'\n', &mut request).await? == 0 {
            return Err(Error::Io(io::ErrorKind::UnexpectedEof.into()));
        }
    }

    let readahead = BytesMut::from(buf_reader.buffer());
    Ok((request, readahead))
}

async fn reject(
    stream: &mut (impl AsyncWrite + Unpin),
    status_line: &str,
    err: Error,
) -> Result<BytesMut, Error> {
    let response = format!("HTTP/1.1 {}\r\n\r\n", status_line);
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Err(err)
}

/// Performs the server side of the opening handshake on a raw stream.
///
/// Validates the upgrade request against the endpoint configuration and
/// answers `101 Switching Protocols` with the accept key and any negotiated
/// subprotocol. Returns the bytes already read past the request (frame
/// data a client pipelined behind the handshake), which must be fed to the
/// connection's frame parser ahead of anything read from the stream.
pub async fn accept<S>(server: &Server, stream: &mut S) -> Result<BytesMut, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (request_bytes, readahead) = read_request(stream).await?;
    let request_str = std::str::from_utf8(&request_bytes)?;

    let mut headers = HashMap::new();
    for (i, line) in request_str.lines().enumerate() {
        if i == 0 {
            let mut split = line.split_ascii_whitespace();
            let (Some("GET"), Some(_), Some("HTTP/1.1")) =
                (split.next(), split.next(), split.next())
            else {
                return reject(
                    stream,
                    "400 Bad Request",
                    Error::UnexpectedRequest(line.into()),
                )
                .await;
            };
            continue;
        }

        if line.is_empty() {
            break;
        }

        let mut split = line.split(": ");

        let Some(header) = split.next() else {
            return Err(Error::InvalidHeaderLine(line.into()));
        };

        let Some(value) = split.next() else {
            return Err(Error::InvalidHeaderLine(line.into()));
        };

        headers.insert(header.to_lowercase(), value);
    }

    if headers.get("host").is_none() {
        return reject(
            stream,
            "400 Bad Request",
            Error::MissingOrInvalidHeader("Host"),
        )
        .await;
    }

    if headers
        .get("connection")
        .map(|connection| {
            connection
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        != Some(true)
    {
        return reject(
            stream,
            "400 Bad Request",
            Error::MissingOrInvalidHeader("Connection"),
        )
        .await;
    }

    if headers
        .get("upgrade")
        .map(|upgrade| upgrade.eq_ignore_ascii_case("websocket"))
        != Some(true)
    {
        return reject(
            stream,
            "400 Bad Request",
            Error::MissingOrInvalidHeader("Upgrade"),
        )
        .await;
    }

    if headers.get("sec-websocket-version").copied() != Some("13") {
        return reject(
            stream,
            "400 Bad Request",
            Error::MissingOrInvalidHeader("Sec-WebSocket-Version"),
        )
        .await;
    }

    let Some(key) = headers.get("sec-websocket-key") else {
        return reject(
            stream,
            "400 Bad Request",
            Error::MissingOrInvalidHeader("Sec-WebSocket-Key"),
        )
        .await;
    };

    if let Some(allowed) = server.allowed_origin() {
        let origin = headers.get("origin").copied().unwrap_or("");
        if !origin_allowed(allowed, origin) {
            return reject(
                stream,
                "403 Forbidden",
                Error::OriginNotAllowed(origin.into()),
            )
            .await;
        }
    }

    let mut response = format!(
        concat!(
            "{}\r\n",
            "Connection: Upgrade\r\n",
            "Upgrade: websocket\r\n",
            "Sec-WebSocket-Accept: {}\r\n",
        ),
        SWITCHING_PROTOCOLS,
        accept_key(key),
    );

    let offered = headers.get("sec-websocket-protocol").copied().unwrap_or("");
    if let Some(protocol) = select_protocol(offered, server.supported_protocols()) {
        response.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", protocol));
    }

    response.push_str("\r\n");

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    Ok(readahead)
}
