//! Minimal demonstration binary for [`quicore`](crate).
//!
//! This binary exists only to give the library a runnable shape; it does not speak real QUIC,
//! because the TLS 1.3 handshake is an external collaborator (spec section 6) this crate never
//! implements. [`NoopSession`] below stands in for that adapter just long enough to show the
//! endpoint accepting a connection and driving its timers over a real `tokio::net::UdpSocket` —
//! wire an actual `Session` implementation in to get a connection past `Initial`.

use std::env;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use quicore::crypto::{Epoch, Keys, Session, TranscriptEvent};
use quicore::endpoint::{Endpoint, EndpointConfig, SessionFactory};
use quicore::error::TransportError;
use quicore::ConnectionId;

struct NoopSession {
    handshaking: bool,
}

impl Session for NoopSession {
    fn set_local_transport_parameters(&mut self, _params: bytes::Bytes) {}

    fn read_handshake(&mut self, _epoch: Epoch, _data: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    fn write_handshake(&mut self, _epoch: Epoch, _buf: &mut Vec<u8>) -> usize {
        0
    }

    fn poll_transcript(&mut self) -> Option<TranscriptEvent> {
        None
    }

    fn take_keys(&mut self, _epoch: Epoch) -> Option<Keys> {
        None
    }

    fn is_handshaking(&self) -> bool {
        self.handshaking
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        None
    }
}

struct NoopSessionFactory;

impl SessionFactory for NoopSessionFactory {
    fn client_session(&self, _dcid: &ConnectionId, _server_name: &str, _alpn: &[Vec<u8>]) -> Box<dyn Session> {
        Box::new(NoopSession { handshaking: true })
    }

    fn server_session(&self, _odcid: &ConnectionId, _alpn: &[Vec<u8>]) -> Box<dyn Session> {
        Box::new(NoopSession { handshaking: true })
    }
}

fn usage() -> ExitCode {
    eprintln!("usage: quicore listen <local-addr> | quicore connect <local-addr> <remote-addr>");
    ExitCode::FAILURE
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let local: SocketAddr = match args.get(2).and_then(|s| s.parse().ok()) {
        Some(addr) => addr,
        None => return usage(),
    };

    let socket = match tokio::net::UdpSocket::bind(local).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("bind {local}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let config = EndpointConfig::new(quicore::crypto::HmacKey::new(b"quicore demo binary, not a secret"));
    let mut endpoint = Endpoint::new(config, NoopSessionFactory);

    match args.get(1).map(String::as_str) {
        Some("listen") => {
            tracing::info!(%local, "listening");
        }
        Some("connect") => {
            let Some(remote) = args.get(3).and_then(|s| s.parse().ok()) else {
                return usage();
            };
            match endpoint.connect(std::time::Instant::now(), remote, "localhost", &[]) {
                Ok(_) => tracing::info!(%remote, "connecting"),
                Err(e) => {
                    eprintln!("connect: {e}");
                    return ExitCode::FAILURE;
                }
            }
        }
        _ => return usage(),
    }

    let mut buf = vec![0u8; 65527];
    let mut tx = vec![0u8; 1452];
    loop {
        let timeout = endpoint
            .poll_timeout()
            .map(|deadline| deadline.saturating_duration_since(std::time::Instant::now()))
            .unwrap_or(Duration::from_secs(5));

        tokio::select! {
            recvd = socket.recv_from(&mut buf) => {
                let Ok((n, remote)) = recvd else { continue };
                endpoint.handle_datagram(std::time::Instant::now(), remote, bytes::BytesMut::from(&buf[..n]));
            }
            _ = tokio::time::sleep(timeout) => {
                endpoint.handle_timeout(std::time::Instant::now());
            }
        }

        while let Some((remote, datagram)) = endpoint.poll_stray_transmit() {
            let _ = socket.send_to(&datagram, remote).await;
        }
        for handle in endpoint.connections_needing_tx() {
            tx.clear();
            if let Some((remote, n)) = endpoint.poll_transmit(handle, std::time::Instant::now(), tx.capacity(), &mut tx) {
                let _ = socket.send_to(&tx[..n], remote).await;
            }
        }
        while let Some(event) = endpoint.poll() {
            tracing::debug!(?event, "endpoint event");
        }
        if endpoint.is_empty() && args.get(1).map(String::as_str) == Some("connect") {
            break;
        }
    }

    ExitCode::SUCCESS
}
