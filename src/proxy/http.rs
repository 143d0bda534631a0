//! HTTP upstream plumbing: CONNECT tunnels and origin-form rewriting.
//!
//! A tunneling proxy (HTTPS traffic) gets a single CONNECT exchange and
//! then raw bytes. An HTTP proxy carrying origin traffic instead needs
//! every request head rewritten to absolute-form with `Proxy-Authorization`
//! and `X-Forwarded-*` injected; the [`OriginRewriter`] does that
//! incrementally so request pipelining and keep-alive both survive.

use std::io;
use std::net::IpAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

/// RFC 4648 base64 for the Basic auth blob; small enough to keep local.
fn base64(data: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let b = [
            chunk[0],
            chunk.get(1).copied().unwrap_or(0),
            chunk.get(2).copied().unwrap_or(0),
        ];
        let n = ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32;
        out.push(ALPHABET[(n >> 18) as usize & 63] as char);
        out.push(ALPHABET[(n >> 12) as usize & 63] as char);
        out.push(if chunk.len() > 1 {
            ALPHABET[(n >> 6) as usize & 63] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            ALPHABET[n as usize & 63] as char
        } else {
            '='
        });
    }
    out
}

pub fn basic_auth_header(user: &str, password: &str) -> String {
    format!("Basic {}", base64(format!("{}:{}", user, password).as_bytes()))
}

/// Establish a CONNECT tunnel through `upstream` toward `target`
/// (`host:port`). The stream carries raw bytes afterwards.
pub async fn connect_tunnel(
    upstream: &mut TcpStream,
    target: &str,
    auth: Option<&str>,
) -> io::Result<()> {
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(auth) = auth {
        request.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
    }
    request.push_str("\r\n");
    upstream.write_all(request.as_bytes()).await?;

    // Read the response head; anything but 2xx is a failed dial.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 8192 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "oversized CONNECT response",
            ));
        }
        let n = upstream.read(&mut byte).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed during CONNECT",
            ));
        }
        head.push(byte[0]);
    }
    let line = head.split(|&b| b == b'\r').next().unwrap_or_default();
    let status = line
        .split(|&b| b == b' ')
        .nth(1)
        .and_then(|s| std::str::from_utf8(s).ok())
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);
    if !(200..300).contains(&status) {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("proxy CONNECT returned {status}"),
        ));
    }
    Ok(())
}

#[derive(Debug)]
enum ParseState {
    /// Accumulating a request head until the blank line.
    Head,
    /// Passing a known-length body through.
    Body { remaining: u64 },
    /// Passing chunked transfer coding through: reading a size line.
    ChunkSize,
    /// Passing chunk payload (+ trailing CRLF) through.
    ChunkData { remaining: u64 },
    /// Passing trailers until the blank line.
    Trailers,
}

/// Incremental request-stream rewriter for an HTTP proxy upstream.
///
/// Tracks message framing so only request heads are touched; bodies pass
/// through byte-for-byte.
#[derive(Debug)]
pub struct OriginRewriter {
    /// `host:port` the guest was dialing; becomes the absolute-form target.
    target: String,
    auth: Option<String>,
    client_ip: IpAddr,
    state: ParseState,
    head: Vec<u8>,
}

impl OriginRewriter {
    pub fn new(target: String, auth: Option<String>, client_ip: IpAddr) -> Self {
        Self {
            target,
            auth,
            client_ip,
            state: ParseState::Head,
            head: Vec::new(),
        }
    }

    /// Feed guest bytes, appending the (possibly rewritten) upstream bytes
    /// to `out`.
    pub fn push(&mut self, mut input: &[u8], out: &mut Vec<u8>) {
        while !input.is_empty() {
            match &mut self.state {
                ParseState::Head => {
                    // Find the end of head across the carried buffer.
                    let start = self.head.len().saturating_sub(3);
                    self.head.extend_from_slice(input);
                    if let Some(pos) = find_subsequence(&self.head[start..], b"\r\n\r\n") {
                        let head_end = start + pos + 4;
                        let consumed_now = input.len() - (self.head.len() - head_end);
                        let head = std::mem::take(&mut self.head);
                        let (head_bytes, _) = head.split_at(head_end);
                        let body_state = self.rewrite_head(head_bytes, out);
                        self.state = body_state;
                        input = &input[consumed_now..];
                    } else {
                        // Whole input swallowed into the head buffer.
                        return;
                    }
                }
                ParseState::Body { remaining } => {
                    let take = (*remaining).min(input.len() as u64) as usize;
                    out.extend_from_slice(&input[..take]);
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        self.state = ParseState::Head;
                    }
                    input = &input[take..];
                }
                ParseState::ChunkSize => {
                    match input.iter().position(|&b| b == b'\n') {
                        Some(pos) => {
                            self.head.extend_from_slice(&input[..=pos]);
                            out.extend_from_slice(&self.head);
                            let line = std::mem::take(&mut self.head);
                            let size = parse_chunk_size(&line).unwrap_or(0);
                            self.state = if size == 0 {
                                ParseState::Trailers
                            } else {
                                // Chunk data plus its trailing CRLF.
                                ParseState::ChunkData { remaining: size + 2 }
                            };
                            input = &input[pos + 1..];
                        }
                        None => {
                            self.head.extend_from_slice(input);
                            return;
                        }
                    }
                }
                ParseState::ChunkData { remaining } => {
                    let take = (*remaining).min(input.len() as u64) as usize;
                    out.extend_from_slice(&input[..take]);
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        self.state = ParseState::ChunkSize;
                    }
                    input = &input[take..];
                }
                ParseState::Trailers => {
                    let start = self.head.len().saturating_sub(3);
                    self.head.extend_from_slice(input);
                    // An immediate CRLF ends the trailer section too.
                    if let Some(pos) = find_subsequence(&self.head[start..], b"\r\n\r\n")
                        .map(|p| start + p + 4)
                        .or_else(|| {
                            (self.head.len() >= 2 && &self.head[..2] == b"\r\n").then_some(2)
                        })
                    {
                        let consumed_now = input.len() - (self.head.len() - pos);
                        let trailer = std::mem::take(&mut self.head);
                        out.extend_from_slice(&trailer[..pos]);
                        self.state = ParseState::Head;
                        input = &input[consumed_now..];
                    } else {
                        return;
                    }
                }
            }
        }
    }

    /// Rewrite one request head to absolute-form and inject headers.
    /// Returns the parser state for the following body.
    fn rewrite_head(&self, head: &[u8], out: &mut Vec<u8>) -> ParseState {
        let text = String::from_utf8_lossy(head);
        let mut lines = text.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.splitn(3, ' ');
        let method = parts.next().unwrap_or_default();
        let path = parts.next().unwrap_or("/");
        let version = parts.next().unwrap_or("HTTP/1.1");

        // The request's own Host header names the authority; the dialed
        // address may be a virtual alias the proxy cannot resolve.
        let authority = text
            .split("\r\n")
            .skip(1)
            .find_map(|line| {
                line.split_once(':').and_then(|(name, value)| {
                    name.trim()
                        .eq_ignore_ascii_case("host")
                        .then(|| value.trim().to_string())
                })
            })
            .unwrap_or_else(|| self.target.clone());

        // Normalize: origin-form becomes absolute-form; anything already
        // absolute passes through untouched.
        let target = if path.starts_with("http://") || path.starts_with("https://") || path == "*" {
            path.to_string()
        } else {
            let path = if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{path}")
            };
            format!("http://{authority}{path}")
        };

        out.extend_from_slice(format!("{method} {target} {version}\r\n").as_bytes());

        let mut content_length: Option<u64> = None;
        let mut chunked = false;
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let lower = line.to_ascii_lowercase();
            if let Some(v) = lower.strip_prefix("content-length:") {
                content_length = v.trim().parse().ok();
            }
            if lower.starts_with("transfer-encoding:") && lower.contains("chunked") {
                chunked = true;
            }
            // Strip any client-supplied forwarding headers; ours are
            // authoritative.
            if lower.starts_with("proxy-authorization:")
                || lower.starts_with("x-forwarded-for:")
                || lower.starts_with("x-forwarded-proto:")
                || lower.starts_with("x-forwarded-host:")
            {
                trace!("dropping client-supplied proxy header");
                continue;
            }
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if let Some(auth) = &self.auth {
            out.extend_from_slice(format!("Proxy-Authorization: {auth}\r\n").as_bytes());
        }
        out.extend_from_slice(format!("X-Forwarded-For: {}\r\n", self.client_ip).as_bytes());
        out.extend_from_slice(b"X-Forwarded-Proto: http\r\n");
        out.extend_from_slice(format!("X-Forwarded-Host: {}\r\n", self.target).as_bytes());
        out.extend_from_slice(b"\r\n");

        if chunked {
            ParseState::ChunkSize
        } else {
            match content_length {
                Some(0) | None => ParseState::Head,
                Some(n) => ParseState::Body { remaining: n },
            }
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_chunk_size(line: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(line).ok()?;
    let size_part = text.trim().split(';').next()?;
    u64::from_str_radix(size_part, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter() -> OriginRewriter {
        OriginRewriter::new(
            "example.com:80".to_string(),
            Some(basic_auth_header("user", "pass")),
            "172.30.30.2".parse().unwrap(),
        )
    }

    #[test]
    fn rewrites_origin_form_to_absolute() {
        let mut rw = rewriter();
        let mut out = Vec::new();
        rw.push(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n", &mut out);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("GET http://example.com/index.html HTTP/1.1\r\n"));
        assert!(text.contains("Proxy-Authorization: Basic "));
        assert!(text.contains("X-Forwarded-For: 172.30.30.2\r\n"));
        assert!(text.contains("X-Forwarded-Proto: http\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
    }

    #[test]
    fn body_passes_through_and_next_head_is_rewritten() {
        let mut rw = rewriter();
        let mut out = Vec::new();
        rw.push(
            b"POST /a HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloGET /b HTTP/1.1\r\n\r\n",
            &mut out,
        );
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("POST http://example.com:80/a HTTP/1.1\r\n"));
        assert!(text.contains("\r\n\r\nhello"));
        assert!(text.contains("GET http://example.com:80/b HTTP/1.1\r\n"));
    }

    #[test]
    fn split_delivery_reassembles() {
        let mut rw = rewriter();
        let mut out = Vec::new();
        let request = b"GET /split HTTP/1.1\r\nHost: example.com\r\n\r\n";
        for chunk in request.chunks(7) {
            rw.push(chunk, &mut out);
        }
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("GET http://example.com/split HTTP/1.1\r\n"));
    }

    #[test]
    fn chunked_body_passes_through() {
        let mut rw = rewriter();
        let mut out = Vec::new();
        rw.push(
            b"POST /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
            &mut out,
        );
        let text = String::from_utf8(out.clone()).unwrap();
        assert!(text.contains("5\r\nhello\r\n0\r\n\r\n"));

        // Parser must be back at head state for the next request.
        rw.push(b"GET /after HTTP/1.1\r\n\r\n", &mut out);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("GET http://example.com:80/after HTTP/1.1\r\n"));
    }

    #[test]
    fn client_supplied_forwarding_headers_are_stripped() {
        let mut rw = rewriter();
        let mut out = Vec::new();
        rw.push(
            b"GET / HTTP/1.1\r\nX-Forwarded-For: 1.2.3.4\r\n\r\n",
            &mut out,
        );
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("1.2.3.4"));
        assert!(text.contains("X-Forwarded-For: 172.30.30.2\r\n"));
    }

    #[test]
    fn base64_known_vectors() {
        assert_eq!(base64(b"user:pass"), "dXNlcjpwYXNz");
        assert_eq!(base64(b"f"), "Zg==");
        assert_eq!(base64(b"fo"), "Zm8=");
    }
}
