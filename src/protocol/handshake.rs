//! Minimal HTTP/1.1 upgrade handshake.
//!
//! Only the subset the session broker consumes: accept an upgrade request and
//! answer 101, or reject anything else with a 400 and no content. The head is
//! read byte-exactly so no frame bytes are swallowed by buffering.

use crate::config::types::{GatewayError, Result};
use std::io::{Read, Write};
use std::net::TcpStream;

const MAX_HEAD_BYTES: usize = 8192;

/// Parsed request line and headers of an upgrade request.
#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn request_line(&self) -> String {
        format!("{} {} {}", self.method, self.uri, self.version)
    }
}

fn read_head(stream: &mut TcpStream) -> Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD_BYTES {
            return Err(GatewayError::Protocol("request head too large".to_string()));
        }
        match stream.read(&mut byte)? {
            0 => {
                return Err(GatewayError::Protocol(
                    "connection closed during handshake".to_string(),
                ))
            }
            _ => head.push(byte[0]),
        }
    }
    String::from_utf8(head)
        .map_err(|_| GatewayError::Protocol("request head is not valid UTF-8".to_string()))
}

fn parse_headers(lines: &mut std::str::Lines<'_>) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    headers
}

/// Server side: read one request head and either switch protocols or answer
/// 400 with zero content length and fail.
pub fn accept_upgrade(stream: &mut TcpStream) -> Result<RequestHead> {
    let head = read_head(stream)?;
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(v)) => (m.to_string(), u.to_string(), v.to_string()),
        _ => {
            let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n");
            return Err(GatewayError::Protocol(format!(
                "malformed request line: {request_line}"
            )));
        }
    };
    let headers = parse_headers(&mut lines);
    let request = RequestHead {
        method,
        uri,
        version,
        headers,
    };

    let upgrade_requested = request
        .header("Upgrade")
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if request.method != "GET" || !upgrade_requested {
        stream.write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")?;
        return Err(GatewayError::Protocol(format!(
            "not an upgrade request: {}",
            request.request_line()
        )));
    }

    stream.write_all(
        b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
    )?;
    Ok(request)
}

/// Client side: request an upgrade for `uri` and require the 101 answer.
pub fn client_upgrade(stream: &mut TcpStream, uri: &str) -> Result<()> {
    let host = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "localhost".to_string());
    let request =
        format!("GET {uri} HTTP/1.1\r\nHost: {host}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n");
    stream.write_all(request.as_bytes())?;

    let head = read_head(stream)?;
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if status != "101" {
        return Err(GatewayError::Protocol(format!(
            "upgrade refused: {status_line}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn upgrades_and_reports_the_request_uri() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            accept_upgrade(&mut stream).unwrap()
        });

        let mut client = TcpStream::connect(addr).unwrap();
        client_upgrade(&mut client, "/loolws/child/").unwrap();

        let head = server.join().unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.uri, "/loolws/child/");
        assert!(head.header("upgrade").is_some());
    }

    #[test]
    fn rejects_plain_requests_with_400_and_no_content() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            accept_upgrade(&mut stream)
        });

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).unwrap();

        assert!(server.join().unwrap().is_err());
        assert!(response.starts_with("HTTP/1.1 400"));
        assert!(response.contains("Content-Length: 0"));
    }
}
