/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use hyper::{
    client::HttpConnector,
    header::{AUTHORIZATION, CONTENT_TYPE},
    Body, Client, Request, StatusCode, Uri,
};
use log::{debug, info};
use socket2::{Domain, SockAddr, Socket, Type};
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};

use super::ExportError;
use crate::config::CollectorConfig;

// largest payload of an IPv4 UDP datagram
pub const MAX_DATAGRAM_LEN: usize = 65507;

const UDP_SEND_BUFFER_SIZE: usize = 4 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Http,
}

impl FromStr for Protocol {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Protocol::Udp),
            "http" => Ok(Protocol::Http),
            _ => Err(ExportError::UnsupportedProtocol(s.to_owned())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Http => write!(f, "http"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("http request failed: {0}")]
    Http(#[from] hyper::Error),
    #[error("http request build failed: {0}")]
    Request(#[from] http::Error),
    #[error("collector responded with status {0}")]
    Status(StatusCode),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

/// Ships one serialized batch to the collector. Each exporter worker owns
/// its own transport.
pub trait Transport: Send {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError>;
}

/// Splits `payload` into chunks of at most `max` bytes, cutting only after a
/// newline. A single line longer than `max` is yielded whole.
pub fn split_datagrams(payload: &[u8], max: usize) -> DatagramSplitter<'_> {
    DatagramSplitter { rest: payload, max }
}

pub struct DatagramSplitter<'a> {
    rest: &'a [u8],
    max: usize,
}

impl<'a> Iterator for DatagramSplitter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let cut = if self.rest.len() <= self.max {
            self.rest.len()
        } else {
            match self.rest[..self.max].iter().rposition(|b| *b == b'\n') {
                Some(i) => i + 1,
                None => self
                    .rest
                    .iter()
                    .position(|b| *b == b'\n')
                    .map(|i| i + 1)
                    .unwrap_or(self.rest.len()),
            }
        };
        let (chunk, rest) = self.rest.split_at(cut);
        self.rest = rest;
        Some(chunk)
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, ExportError> {
    let addr = format!("{}:{}", host, port);
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| ExportError::Resolve {
            addr: addr.clone(),
            source,
        })?;
    addrs.next().ok_or_else(|| ExportError::Resolve {
        addr,
        source: io::Error::new(io::ErrorKind::NotFound, "no address found"),
    })
}

pub struct UdpTransport {
    socket: Socket,
    remote: SockAddr,
    max_datagram_len: usize,
}

impl UdpTransport {
    pub fn new(host: &str, port: u16) -> Result<Self, ExportError> {
        let remote = resolve(host, port)?;
        let socket = Socket::new(Domain::for_address(remote), Type::DGRAM, None)?;
        socket.set_send_buffer_size(UDP_SEND_BUFFER_SIZE)?;
        let local: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        socket.bind(&SockAddr::from(local))?;
        info!("udp transport to {} ready", remote);
        Ok(Self {
            socket,
            remote: SockAddr::from(remote),
            max_datagram_len: MAX_DATAGRAM_LEN,
        })
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        for datagram in split_datagrams(payload, self.max_datagram_len) {
            self.socket.send_to(datagram, &self.remote)?;
        }
        Ok(())
    }
}

pub struct HttpTransport {
    runtime: Runtime,
    client: Client<HttpConnector>,
    uri: Uri,
    authorization: Option<String>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &CollectorConfig) -> Result<Self, ExportError> {
        let uri = format!(
            "http://{}:{}/write?db={}",
            config.host, config.port, config.database
        );
        let uri = uri
            .parse::<Uri>()
            .map_err(|e| ExportError::InvalidUri(format!("{}: {}", uri, e)))?;
        // pooled connections are driven by tasks on this runtime, they must keep
        // running between sends to notice a collector closing them
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("int-exporter-http")
            .enable_all()
            .build()?;
        let authorization = if config.username.is_empty() {
            None
        } else {
            Some(format!(
                "Basic {}",
                STANDARD.encode(format!("{}:{}", config.username, config.password))
            ))
        };
        info!("http transport to {} ready", uri);
        Ok(Self {
            runtime,
            client: Client::new(),
            uri,
            authorization,
            timeout: config.timeout,
        })
    }
}

impl HttpTransport {
    fn post(&self, payload: &[u8]) -> Result<(), TransportError> {
        let mut builder = Request::post(self.uri.clone())
            .header(CONTENT_TYPE, "text/plain; charset=utf-8");
        if let Some(auth) = self.authorization.as_ref() {
            builder = builder.header(AUTHORIZATION, auth.as_str());
        }
        let request = builder.body(Body::from(payload.to_vec()))?;

        let client = &self.client;
        let timeout = self.timeout;
        self.runtime.block_on(async move {
            let response = match tokio::time::timeout(timeout, client.request(request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return Err(TransportError::Http(e)),
                Err(_) => return Err(TransportError::Timeout(timeout)),
            };
            let status = response.status();
            // drain so the connection can be reused
            let _ = hyper::body::to_bytes(response.into_body()).await;
            if status.is_success() {
                Ok(())
            } else {
                Err(TransportError::Status(status))
            }
        })
    }
}

impl Transport for HttpTransport {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        match self.post(payload) {
            // the collector closed an idle keep-alive connection as it was reused
            Err(TransportError::Http(e)) if e.is_incomplete_message() => {
                debug!("http connection to {} closed by peer, retrying: {}", self.uri, e);
                self.post(payload)
            }
            r => r,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream, UdpSocket};
    use std::thread;

    use super::*;

    #[test]
    fn protocol_parsing() {
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert_eq!("HTTP".parse::<Protocol>().unwrap(), Protocol::Http);
        for bad in ["ftp", "https", ""] {
            assert!(matches!(
                bad.parse::<Protocol>(),
                Err(ExportError::UnsupportedProtocol(p)) if p == bad
            ));
        }
    }

    #[test]
    fn datagrams_split_on_line_boundaries() {
        let payload = b"aaaa\nbbbb\ncccc\n";
        let chunks: Vec<&[u8]> = split_datagrams(payload, 10).collect();
        assert_eq!(chunks, vec![&b"aaaa\nbbbb\n"[..], &b"cccc\n"[..]]);

        let chunks: Vec<&[u8]> = split_datagrams(payload, 100).collect();
        assert_eq!(chunks, vec![&payload[..]]);

        // an oversized line is not cut in the middle
        let chunks: Vec<&[u8]> = split_datagrams(b"aaaaaaaa\nb\n", 4).collect();
        assert_eq!(chunks, vec![&b"aaaaaaaa\n"[..], &b"b\n"[..]]);

        assert_eq!(split_datagrams(b"", 4).count(), 0);
    }

    #[test]
    fn udp_send() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let mut transport = UdpTransport::new("127.0.0.1", port).unwrap();
        transport.max_datagram_len = 8;
        transport.send(b"line1\nline2\n").unwrap();

        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"line1\n");
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"line2\n");
    }

    #[test]
    fn unresolvable_host() {
        assert!(matches!(
            UdpTransport::new("no such host", 8089),
            Err(ExportError::Resolve { .. })
        ));
    }

    // reads one request with its body
    fn read_request(stream: &mut TcpStream) -> String {
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).unwrap();
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| {
                        let l = l.to_ascii_lowercase();
                        l.strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if request.len() >= end + 4 + length {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }
        String::from_utf8_lossy(&request).to_string()
    }

    // answers `connections` connections with one `status_line` response each
    // and closes them, returns the raw requests
    fn serve(
        connections: usize,
        status_line: &'static str,
    ) -> (u16, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let mut requests = vec![];
            for _ in 0..connections {
                let (mut stream, _) = listener.accept().unwrap();
                requests.push(read_request(&mut stream));
                write!(stream, "{}\r\ncontent-length: 0\r\n\r\n", status_line).unwrap();
            }
            requests
        });
        (port, handle)
    }

    fn serve_once(status_line: &'static str) -> (u16, thread::JoinHandle<String>) {
        let (port, handle) = serve(1, status_line);
        (
            port,
            thread::spawn(move || handle.join().unwrap().pop().unwrap()),
        )
    }

    fn collector_config(port: u16) -> CollectorConfig {
        CollectorConfig {
            host: "127.0.0.1".to_owned(),
            port,
            protocol: "http".to_owned(),
            username: "admin".to_owned(),
            password: "secret".to_owned(),
            timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    #[test]
    fn http_post_with_basic_auth() {
        let (port, server) = serve_once("HTTP/1.1 204 No Content");
        let mut transport = HttpTransport::new(&collector_config(port)).unwrap();
        transport.send(b"int_telemetry,a=b c=1 2\n").unwrap();

        let request = server.join().unwrap();
        assert!(request.starts_with("POST /write?db=int_telemetry HTTP/1.1\r\n"));
        assert!(request
            .to_ascii_lowercase()
            .contains("authorization: basic ywrtaw46c2vjcmv0\r\n"));
        assert!(request.ends_with("int_telemetry,a=b c=1 2\n"));
    }

    #[test]
    fn http_reconnects_after_peer_closes_idle_connection() {
        let (port, server) = serve(2, "HTTP/1.1 204 No Content");
        let mut transport = HttpTransport::new(&collector_config(port)).unwrap();
        transport.send(b"first 1\n").unwrap();
        // the collector drops the keep-alive connection between batches
        thread::sleep(Duration::from_millis(200));
        transport.send(b"second 2\n").unwrap();

        let requests = server.join().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].ends_with("first 1\n"));
        assert!(requests[1].ends_with("second 2\n"));
    }

    #[test]
    fn http_error_status() {
        let (port, server) = serve_once("HTTP/1.1 500 Internal Server Error");
        let mut config = collector_config(port);
        config.username.clear();
        let mut transport = HttpTransport::new(&config).unwrap();
        assert!(matches!(
            transport.send(b"x\n"),
            Err(TransportError::Status(StatusCode::INTERNAL_SERVER_ERROR))
        ));
        let request = server.join().unwrap();
        assert!(!request.to_ascii_lowercase().contains("authorization"));
    }

    #[test]
    fn http_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = collector_config(listener.local_addr().unwrap().port());
        config.timeout = Duration::from_millis(100);
        let mut transport = HttpTransport::new(&config).unwrap();
        assert!(matches!(
            transport.send(b"x\n"),
            Err(TransportError::Timeout(_))
        ));
        drop(listener);
    }
}
