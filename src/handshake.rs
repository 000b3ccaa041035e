//! The HTTP Upgrade exchange, both sides.
//!
//! The engine owns buffering and the size limit; this module turns a
//! complete request or response head into a validated record and produces
//! the byte-exact messages for the other direction.

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::WS_GUID;

/// Maximum number of headers accepted in either direction.
const MAX_HEADERS: usize = 32;

/// A validated server-side upgrade request.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// Request path
    pub path: String,
    /// Host header value
    pub host: String,
    /// Sec-WebSocket-Key value, as sent by the client
    pub key: String,
    /// Origin header, if present
    pub origin: Option<String>,
    /// Requested subprotocols, in client preference order
    pub protocols: Vec<String>,
}

/// Outcome of validating a complete request head.
#[derive(Debug)]
pub enum ServerHandshake {
    /// The request is a well-formed WebSocket upgrade.
    Valid(UpgradeRequest),
    /// Well-formed HTTP that is not an acceptable upgrade; respond with
    /// `status` (400, 405, or 426) and tear down.
    Invalid { status: u16 },
}

/// The parsed head of a client-side handshake response.
#[derive(Debug)]
pub struct ResponseHead {
    /// HTTP status code
    pub status: u16,
    /// Sec-WebSocket-Accept value, if present
    pub accept: Option<String>,
    /// Negotiated subprotocol, if any
    pub protocol: Option<String>,
}

/// Generate a `Sec-WebSocket-Key`: base64 of 16 bytes from the OS RNG.
pub fn generate_key() -> String {
    let mut bytes = [0u8; 16];
    getrandom::fill(&mut bytes).expect("OS RNG unavailable");
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Compute the `Sec-WebSocket-Accept` token for a key:
/// base64(SHA-1(key || GUID)).
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Build the client upgrade request.
///
/// `host` carries the `host:port` form that goes into the Host header.
pub fn build_request(host: &str, path: &str, key: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(b"GET ");
    buf.put_slice(path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\nHost: ");
    buf.put_slice(host.as_bytes());
    buf.put_slice(b"\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: ");
    buf.put_slice(key.as_bytes());
    buf.put_slice(b"\r\nSec-WebSocket-Version: 13\r\n\r\n");
    buf.freeze()
}

/// Validate a complete upgrade request head.
///
/// `head` must contain the full request including the terminating blank
/// line. Malformed HTTP is an `Err`; well-formed HTTP that is not an
/// acceptable upgrade comes back as [`ServerHandshake::Invalid`] with the
/// status to deny with: 405 for a non-GET verb, 426 for a version other
/// than 13, 400 for a missing Host/Upgrade/Connection/Key.
pub fn parse_request(head: &[u8]) -> Result<ServerHandshake> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(Error::InvalidHttp("truncated request head")),
        Err(_) => return Err(Error::InvalidHttp("unparseable request head")),
    }

    if req.method != Some("GET") {
        return Ok(ServerHandshake::Invalid { status: 405 });
    }

    let mut host = None;
    let mut key = None;
    let mut version = None;
    let mut origin = None;
    let mut protocols = Vec::new();
    let mut upgrade_websocket = false;
    let mut connection_upgrade = false;

    for header in req.headers.iter() {
        let value = match std::str::from_utf8(header.value) {
            Ok(v) => v.trim(),
            Err(_) => return Err(Error::InvalidHttp("header value is not UTF-8")),
        };

        match header.name.to_ascii_lowercase().as_str() {
            "host" => host = Some(value),
            "sec-websocket-key" => key = Some(value),
            "sec-websocket-version" => version = Some(value),
            "origin" => origin = Some(value),
            "sec-websocket-protocol" => {
                protocols.extend(value.split(',').map(|p| p.trim().to_owned()));
            }
            "upgrade" => {
                if value.to_ascii_lowercase().contains("websocket") {
                    upgrade_websocket = true;
                }
            }
            "connection" => {
                if value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
                {
                    connection_upgrade = true;
                }
            }
            _ => {}
        }
    }

    let (host, key) = match (host, key, upgrade_websocket, connection_upgrade) {
        (Some(h), Some(k), true, true) => (h, k),
        _ => return Ok(ServerHandshake::Invalid { status: 400 }),
    };

    if version != Some("13") {
        return Ok(ServerHandshake::Invalid { status: 426 });
    }

    Ok(ServerHandshake::Valid(UpgradeRequest {
        path: req.path.unwrap_or("/").to_owned(),
        host: host.to_owned(),
        key: key.to_owned(),
        origin: origin.map(str::to_owned),
        protocols,
    }))
}

/// Parse a complete handshake response head (client side).
pub fn parse_response(head: &[u8]) -> Result<ResponseHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);

    match res.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(Error::InvalidHttp("truncated response head"))
        }
        Err(_) => return Err(Error::InvalidHttp("unparseable response head")),
    }

    let status = res.code.ok_or(Error::InvalidHttp("missing status code"))?;

    let mut accept = None;
    let mut protocol = None;
    for header in res.headers.iter() {
        let value = match std::str::from_utf8(header.value) {
            Ok(v) => v.trim(),
            Err(_) => return Err(Error::InvalidHttp("header value is not UTF-8")),
        };
        match header.name.to_ascii_lowercase().as_str() {
            "sec-websocket-accept" => accept = Some(value.to_owned()),
            "sec-websocket-protocol" => protocol = Some(value.to_owned()),
            _ => {}
        }
    }

    Ok(ResponseHead {
        status,
        accept,
        protocol,
    })
}

/// Build the 101 Switching Protocols response.
pub fn build_accept_response(accept: &str, server_id: &str, protocol: Option<&str>) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\nServer: ");
    buf.put_slice(server_id.as_bytes());
    buf.put_slice(b"\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: ");
    buf.put_slice(accept.as_bytes());
    buf.put_slice(b"\r\n");
    if let Some(proto) = protocol {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(proto.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// HTML body sent with error responses.
const ERROR_BODY: &str = "<html><head><title>%errorCode% %errorString%</title></head>\
<body><h1>%errorCode% %errorString%</h1><hr/><i>%serverIdentifier%</i></body></html>";

/// Build an HTTP error response with the substituted HTML body.
pub fn build_error_response(status: u16, server_id: &str) -> Bytes {
    let reason = reason_phrase(status);
    let body = ERROR_BODY
        .replace("%errorCode%", &status.to_string())
        .replace("%errorString%", reason)
        .replace("%serverIdentifier%", server_id);

    let mut buf = BytesMut::with_capacity(128 + body.len());
    buf.put_slice(b"HTTP/1.1 ");
    buf.put_slice(status.to_string().as_bytes());
    buf.put_slice(b" ");
    buf.put_slice(reason.as_bytes());
    buf.put_slice(b"\r\nServer: ");
    buf.put_slice(server_id.as_bytes());
    buf.put_slice(b"\r\n\r\n");
    buf.put_slice(body.as_bytes());
    buf.put_slice(b"\r\n\r\n");
    buf.freeze()
}

/// Reason phrase for the status codes the server emits.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        _ => "Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_REQUEST: &[u8] = b"GET /chat HTTP/1.1\r\n\
Host: server.example.com\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\
\r\n";

    #[test]
    fn test_accept_key_rfc_vector() {
        // Test vector from RFC 6455 section 1.3
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_generate_key_shape() {
        let key = generate_key();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&key)
            .unwrap();
        assert_eq!(decoded.len(), 16);
        assert_ne!(generate_key(), key);
    }

    #[test]
    fn test_build_request_exact_bytes() {
        let req = build_request("h:80", "/x", "a2V5a2V5a2V5a2V5a2V5a2==");
        let expected = "GET /x HTTP/1.1\r\n\
Host: h:80\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: a2V5a2V5a2V5a2V5a2V5a2==\r\n\
Sec-WebSocket-Version: 13\r\n\r\n";
        assert_eq!(req.as_ref(), expected.as_bytes());
    }

    #[test]
    fn test_parse_valid_request() {
        let req = match parse_request(SAMPLE_REQUEST).unwrap() {
            ServerHandshake::Valid(req) => req,
            other => panic!("expected valid handshake, got {other:?}"),
        };
        assert_eq!(req.path, "/chat");
        assert_eq!(req.host, "server.example.com");
        assert_eq!(req.key, "dGhlIHNhbXBsZSBub25jZQ==");
        assert!(req.protocols.is_empty());
    }

    #[test]
    fn test_parse_request_header_case_and_tokens() {
        let head = b"GET / HTTP/1.1\r\n\
HOST: example.com\r\n\
upgrade: WebSocket\r\n\
CONNECTION: keep-alive, Upgrade\r\n\
SEC-WEBSOCKET-KEY: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\
Sec-WebSocket-Protocol: chat, superchat\r\n\
\r\n";
        let req = match parse_request(head).unwrap() {
            ServerHandshake::Valid(req) => req,
            other => panic!("expected valid handshake, got {other:?}"),
        };
        assert_eq!(req.protocols, vec!["chat", "superchat"]);
    }

    #[test]
    fn test_parse_request_denials() {
        let post = b"POST / HTTP/1.1\r\nHost: h\r\n\r\n";
        assert!(matches!(
            parse_request(post).unwrap(),
            ServerHandshake::Invalid { status: 405 }
        ));

        let no_key = b"GET / HTTP/1.1\r\n\
Host: h\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Version: 13\r\n\
\r\n";
        assert!(matches!(
            parse_request(no_key).unwrap(),
            ServerHandshake::Invalid { status: 400 }
        ));

        let no_upgrade = b"GET / HTTP/1.1\r\n\
Host: h\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\
\r\n";
        assert!(matches!(
            parse_request(no_upgrade).unwrap(),
            ServerHandshake::Invalid { status: 400 }
        ));

        let wrong_version = b"GET / HTTP/1.1\r\n\
Host: h\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 8\r\n\
\r\n";
        assert!(matches!(
            parse_request(wrong_version).unwrap(),
            ServerHandshake::Invalid { status: 426 }
        ));
    }

    #[test]
    fn test_parse_request_malformed() {
        assert!(parse_request(b"\x00\x01\x02\r\n\r\n").is_err());
    }

    #[test]
    fn test_parse_response() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
\r\n";
        let res = parse_response(head).unwrap();
        assert_eq!(res.status, 101);
        assert_eq!(res.accept.as_deref(), Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        let denied = b"HTTP/1.1 403 Forbidden\r\n\r\n";
        assert_eq!(parse_response(denied).unwrap().status, 403);
    }

    #[test]
    fn test_build_accept_response() {
        let res = build_accept_response("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=", "sockmux/1.0.0", None);
        let text = std::str::from_utf8(&res).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Server: sockmux/1.0.0\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert!(!text.contains("Sec-WebSocket-Protocol"));

        let res = build_accept_response("token", "id", Some("chat"));
        assert!(std::str::from_utf8(&res)
            .unwrap()
            .contains("Sec-WebSocket-Protocol: chat\r\n"));
    }

    #[test]
    fn test_build_error_response() {
        let res = build_error_response(426, "sockmux/1.0.0");
        let text = std::str::from_utf8(&res).unwrap();
        assert!(text.starts_with("HTTP/1.1 426 Upgrade Required\r\n"));
        assert!(text.contains("Server: sockmux/1.0.0\r\n"));
        assert!(text.contains("<h1>426 Upgrade Required</h1>"));
        assert!(text.contains("<i>sockmux/1.0.0</i>"));
        assert!(!text.contains("%errorCode%"));
        assert!(!text.contains("%errorString%"));
        assert!(!text.contains("%serverIdentifier%"));
    }
}
