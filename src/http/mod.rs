//! HTTP/1.1 plumbing shared by the client and server transports.
//!
//! The protocol needs exactly one shape of HTTP: a `POST` with a fully
//! buffered body, answered by a fully buffered response. Heads are parsed
//! with `httparse` and serialized by hand into the write buffer.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{codes, TsrpcError};

pub(crate) const HEADER_DATA_TYPE: &str = "X-TSRPC-DATA-TYPE";
pub(crate) const HEADER_PROTO_INFO: &str = "X-TSRPC-PROTO-INFO";

pub(crate) const CONTENT_TYPE_TEXT: &str = "application/json";
pub(crate) const CONTENT_TYPE_BUFFER: &str = "application/octet-stream";

const MAX_HEAD_SIZE: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;

/// A parsed request head; header names are lowercased.
#[derive(Debug)]
pub(crate) struct ReqHead {
    pub method: Method,
    pub path: String,
    headers: Vec<(String, String)>,
}

/// A parsed response head; header names are lowercased.
#[derive(Debug)]
pub(crate) struct ResHead {
    pub status: StatusCode,
    headers: Vec<(String, String)>,
}

impl ReqHead {
    /// Looks a header up by its lowercased name.
    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, name)
    }

    /// The declared body length, when present and numeric.
    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }

    /// Whether the peer wants the connection kept open afterwards.
    pub fn keep_alive(&self) -> bool {
        !matches!(self.header("connection"), Some(v) if v.eq_ignore_ascii_case("close"))
    }
}

impl ResHead {
    /// Looks a header up by its lowercased name.
    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, name)
    }

    /// The declared body length, when present and numeric.
    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

// ===== reading =====

/// Reads one request off the wire.
///
/// Returns `None` on a clean EOF before any bytes of a new request (the
/// keep-alive peer went away). Leftover bytes past the body stay in `buf`
/// for the next request on the connection.
pub(crate) async fn read_request<R>(
    io: &mut R,
    buf: &mut BytesMut,
) -> crate::Result<Option<(ReqHead, Bytes)>>
where
    R: AsyncRead + Unpin,
{
    let head = loop {
        if let Some(head) = parse_request(buf)? {
            break head;
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(TsrpcError::remote("Request head too large"));
        }
        let n = io
            .read_buf(buf)
            .await
            .map_err(|e| io_err("read request", e))?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(TsrpcError::remote("Connection closed mid-request"));
        }
    };
    let len = head.content_length().unwrap_or(0);
    let body = read_body_exact(io, buf, len).await?;
    Ok(Some((head, body)))
}

/// Reads one response off the wire. Without a `Content-Length`, the body
/// runs to EOF.
pub(crate) async fn read_response<R>(
    io: &mut R,
    buf: &mut BytesMut,
) -> crate::Result<(ResHead, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let head = loop {
        if let Some(head) = parse_response(buf)? {
            break head;
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(TsrpcError::network("Response head too large"));
        }
        let n = io
            .read_buf(buf)
            .await
            .map_err(|e| io_err("read response", e))?;
        if n == 0 {
            return Err(TsrpcError::network("Connection closed before response"));
        }
    };
    let body = match head.content_length() {
        Some(len) => read_body_exact(io, buf, len).await?,
        None => {
            // Connection: close delimited body.
            loop {
                let n = io
                    .read_buf(buf)
                    .await
                    .map_err(|e| io_err("read response body", e))?;
                if n == 0 {
                    break buf.split().freeze();
                }
            }
        }
    };
    Ok((head, body))
}

async fn read_body_exact<R>(
    io: &mut R,
    buf: &mut BytesMut,
    len: usize,
) -> crate::Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    while buf.len() < len {
        let n = io
            .read_buf(buf)
            .await
            .map_err(|e| io_err("read body", e))?;
        if n == 0 {
            return Err(TsrpcError::network("Connection closed mid-body"));
        }
    }
    Ok(buf.split_to(len).freeze())
}

fn parse_request(buf: &mut BytesMut) -> crate::Result<Option<ReqHead>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let status = req
        .parse(&buf[..])
        .map_err(|e| TsrpcError::remote(format!("Malformed request: {}", e)))?;
    match status {
        httparse::Status::Complete(n) => {
            let method = req
                .method
                .and_then(|m| m.parse::<Method>().ok())
                .ok_or_else(|| TsrpcError::remote("Malformed request method"))?;
            let path = req.path.unwrap_or("/").to_owned();
            let parsed = collect_headers(req.headers);
            buf.advance(n);
            Ok(Some(ReqHead {
                method,
                path,
                headers: parsed,
            }))
        }
        httparse::Status::Partial => Ok(None),
    }
}

fn parse_response(buf: &mut BytesMut) -> crate::Result<Option<ResHead>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    let status = res
        .parse(&buf[..])
        .map_err(|e| TsrpcError::network(format!("Malformed response: {}", e)))?;
    match status {
        httparse::Status::Complete(n) => {
            let code = res
                .code
                .and_then(|c| StatusCode::from_u16(c).ok())
                .ok_or_else(|| TsrpcError::network("Malformed response status"))?;
            let parsed = collect_headers(res.headers);
            buf.advance(n);
            Ok(Some(ResHead {
                status: code,
                headers: parsed,
            }))
        }
        httparse::Status::Partial => Ok(None),
    }
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_ascii_lowercase(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect()
}

// ===== writing =====

/// Serializes and writes a whole request.
pub(crate) async fn write_request<W>(
    io: &mut W,
    path: &str,
    host: &str,
    content_type: &str,
    extra_headers: &[(&str, String)],
    body: &[u8],
) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = BytesMut::with_capacity(256);
    head.extend_from_slice(b"POST ");
    head.extend_from_slice(path.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    head.extend_from_slice(host.as_bytes());
    head.extend_from_slice(b"\r\nContent-Type: ");
    head.extend_from_slice(content_type.as_bytes());
    head.extend_from_slice(b"\r\nContent-Length: ");
    let mut len = itoa::Buffer::new();
    head.extend_from_slice(len.format(body.len()).as_bytes());
    head.extend_from_slice(b"\r\n");
    for (name, value) in extra_headers {
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"Connection: close\r\n\r\n");
    io.write_all(&head)
        .await
        .map_err(|e| io_err("write request", e))?;
    io.write_all(body)
        .await
        .map_err(|e| io_err("write request body", e))?;
    io.flush().await.map_err(|e| io_err("flush request", e))?;
    Ok(())
}

/// Serializes and writes a whole response.
pub(crate) async fn write_response<W>(
    io: &mut W,
    status: StatusCode,
    content_type: &str,
    extra_headers: &[(String, String)],
    keep_alive: bool,
    body: &[u8],
) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = BytesMut::with_capacity(256);
    head.extend_from_slice(b"HTTP/1.1 ");
    let mut code = itoa::Buffer::new();
    head.extend_from_slice(code.format(status.as_u16()).as_bytes());
    head.extend_from_slice(b" ");
    head.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    head.extend_from_slice(b"\r\nContent-Type: ");
    head.extend_from_slice(content_type.as_bytes());
    head.extend_from_slice(b"\r\nContent-Length: ");
    let mut len = itoa::Buffer::new();
    head.extend_from_slice(len.format(body.len()).as_bytes());
    head.extend_from_slice(b"\r\n");
    for (name, value) in extra_headers {
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    if keep_alive {
        head.extend_from_slice(b"Connection: keep-alive\r\n\r\n");
    } else {
        head.extend_from_slice(b"Connection: close\r\n\r\n");
    }
    io.write_all(&head)
        .await
        .map_err(|e| io_err("write response", e))?;
    io.write_all(body)
        .await
        .map_err(|e| io_err("write response body", e))?;
    io.flush().await.map_err(|e| io_err("flush response", e))?;
    Ok(())
}

// ===== server URL =====

/// A parsed `http://host[:port][/base]` server address.
#[derive(Debug, Clone)]
pub(crate) struct ServerUrl {
    /// `host:port`, for connecting and the `Host` header.
    pub authority: String,
    /// Base path, always starting with `/`.
    pub base_path: String,
}

impl ServerUrl {
    /// Parses a server address, defaulting the port to 80 and the base
    /// path to `/`.
    pub fn parse(url: &str) -> crate::Result<ServerUrl> {
        let rest = if let Some(rest) = url.strip_prefix("http://") {
            rest
        } else if url.starts_with("https://") {
            // TLS terminates outside this crate (a fronting proxy).
            return Err(TsrpcError::local(
                "https URLs are not supported; terminate TLS externally",
            ));
        } else {
            url
        };
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(TsrpcError::local(format!("Invalid server URL: {}", url)));
        }
        let authority = if authority.contains(':') {
            authority.to_owned()
        } else {
            format!("{}:80", authority)
        };
        Ok(ServerUrl {
            authority,
            base_path: path.to_owned(),
        })
    }

    /// The request path for a named service (text mode).
    pub fn path_for(&self, service_name: &str) -> String {
        if self.base_path.ends_with('/') {
            format!("{}{}", self.base_path, service_name)
        } else {
            format!("{}/{}", self.base_path, service_name)
        }
    }
}

// ===== errors =====

pub(crate) fn io_err(during: &str, e: io::Error) -> TsrpcError {
    let err = TsrpcError::network(format!("Failed to {}: {}", during, e));
    match e.kind() {
        io::ErrorKind::ConnectionRefused => err.with_code(codes::ECONNREFUSED),
        io::ErrorKind::TimedOut => err.with_code(codes::TIMEOUT),
        _ => err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_request_with_body_and_leftover() {
        let raw = b"POST /a/b/c/Test HTTP/1.1\r\n\
            Host: x\r\n\
            Content-Type: application/json\r\n\
            Content-Length: 4\r\n\
            \r\n\
            {\"\"}NEXT";
        let mut io = tokio::io::BufReader::new(&raw[..]);
        let mut buf = BytesMut::new();
        let (head, body) = read_request(&mut io, &mut buf).await.unwrap().unwrap();
        assert_eq!(head.method, Method::POST);
        assert_eq!(head.path, "/a/b/c/Test");
        assert_eq!(head.header("content-type"), Some(CONTENT_TYPE_TEXT));
        assert!(head.keep_alive());
        assert_eq!(&body[..], b"{\"\"}");
        assert_eq!(&buf[..], b"NEXT");
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let raw: &[u8] = b"";
        let mut io = tokio::io::BufReader::new(raw);
        let mut buf = BytesMut::new();
        assert!(read_request(&mut io, &mut buf).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn response_body_to_eof_without_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"isSucc\":true,\"res\":{}}";
        let mut io = tokio::io::BufReader::new(&raw[..]);
        let mut buf = BytesMut::new();
        let (head, body) = read_response(&mut io, &mut buf).await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(&body[..], b"{\"isSucc\":true,\"res\":{}}");
    }

    #[test]
    fn server_url_defaults() {
        let url = ServerUrl::parse("http://127.0.0.1:3000").unwrap();
        assert_eq!(url.authority, "127.0.0.1:3000");
        assert_eq!(url.base_path, "/");
        assert_eq!(url.path_for("a/b/c/Test"), "/a/b/c/Test");

        let url = ServerUrl::parse("http://example.com/api").unwrap();
        assert_eq!(url.authority, "example.com:80");
        assert_eq!(url.path_for("Test"), "/api/Test");
    }

    #[test]
    fn https_is_rejected() {
        assert!(ServerUrl::parse("https://example.com").is_err());
    }
}
