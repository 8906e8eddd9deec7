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

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use log::info;
use socket2::{Domain, SockAddr, Socket, Type};

pub const FRAME_SIZE_MAX: usize = 1 << 16;
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

const RECV_BUFFER_SIZE: usize = 8 << 20;

/// Pull side of a capture backend.
///
/// `recv` returns the next payload, or `None` when nothing arrived within the
/// backend's poll window. Payloads stay valid until the next call. `release`
/// hands every payload returned so far back to the backend.
pub trait PacketSource: Send {
    fn recv(&mut self) -> io::Result<Option<&[u8]>>;
    fn release(&mut self);
}

/// INT reports delivered as UDP datagrams, e.g. mirrored by the last switch.
pub struct UdpSource {
    socket: UdpSocket,
    buffer: Vec<u8>,
}

impl UdpSource {
    pub fn bind(addr: &str) -> io::Result<Self> {
        let local: SocketAddr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("listen address {} resolves to nothing", addr),
            )
        })?;
        let socket = Socket::new(Domain::for_address(local), Type::DGRAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_recv_buffer_size(RECV_BUFFER_SIZE)?;
        socket.bind(&SockAddr::from(local))?;
        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(POLL_TIMEOUT))?;
        info!("capturing int reports on udp {}", socket.local_addr()?);
        Ok(Self {
            socket,
            buffer: vec![0; FRAME_SIZE_MAX],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl PacketSource for UdpSource {
    fn recv(&mut self) -> io::Result<Option<&[u8]>> {
        match self.socket.recv(&mut self.buffer) {
            Ok(n) => Ok(Some(&self.buffer[..n])),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    // datagrams are copied out of the kernel, nothing to hand back
    fn release(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_source_yields_datagrams() {
        let mut source = UdpSource::bind("127.0.0.1:0").unwrap();
        let addr = source.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"report", addr).unwrap();

        let mut got = None;
        for _ in 0..20 {
            if let Some(payload) = source.recv().unwrap() {
                got = Some(payload.to_vec());
                break;
            }
        }
        assert_eq!(got.as_deref(), Some(&b"report"[..]));
    }

    #[test]
    fn udp_source_times_out_empty() {
        let mut source = UdpSource::bind("127.0.0.1:0").unwrap();
        assert!(source.recv().unwrap().is_none());
    }

    #[test]
    fn bind_failure_is_error() {
        assert!(UdpSource::bind("not an address").is_err());
    }
}
