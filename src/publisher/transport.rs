use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use super::Protocol;
use crate::error::PublishError;

/// Opens connections to the collector. Shared by the publisher worker for
/// the whole run.
#[async_trait]
pub trait Connector: Send + Sync {
    /// `host:port/protocol`, for logs.
    fn describe(&self) -> String;

    /// Startup reachability check. Must not leave a connection open.
    async fn check(&self) -> Result<(), PublishError>;

    async fn connect(&self) -> Result<Box<dyn Transport>, PublishError>;
}

/// One open connection (or connected datagram socket).
#[async_trait]
pub trait Transport: Send {
    /// Writes the whole payload or fails.
    async fn send(&mut self, payload: &[u8]) -> Result<(), PublishError>;

    async fn close(&mut self);
}

// ─── Network connector ───────────────────────────────────────────

pub struct NetworkConnector {
    host: String,
    port: u16,
    protocol: Protocol,
}

impl NetworkConnector {
    pub fn new(host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
        }
    }

    async fn resolve(&self) -> Result<SocketAddr, PublishError> {
        let unresolvable = |reason: String| PublishError::Unresolvable {
            target: format!("{}:{}", self.host, self.port),
            reason,
        };

        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| unresolvable(e.to_string()))?;
        addrs
            .next()
            .ok_or_else(|| unresolvable("no addresses returned".into()))
    }
}

#[async_trait]
impl Connector for NetworkConnector {
    fn describe(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.protocol)
    }

    async fn check(&self) -> Result<(), PublishError> {
        self.resolve().await.map(|_| ())
    }

    async fn connect(&self) -> Result<Box<dyn Transport>, PublishError> {
        let addr = self.resolve().await?;
        let connect_err = |source| PublishError::Connect {
            target: addr.to_string(),
            source,
        };

        match self.protocol {
            Protocol::Udp => {
                let local: SocketAddr = if addr.is_ipv4() {
                    ([0, 0, 0, 0], 0).into()
                } else {
                    ([0u16; 8], 0).into()
                };
                let socket = UdpSocket::bind(local).await.map_err(connect_err)?;
                socket.connect(addr).await.map_err(connect_err)?;
                debug!(%addr, "udp socket connected");
                Ok(Box::new(UdpTransport { socket }))
            }
            Protocol::Tcp => {
                let stream = TcpStream::connect(addr).await.map_err(connect_err)?;
                let _ = stream.set_nodelay(true);
                debug!(%addr, "tcp connection established");
                Ok(Box::new(TcpTransport {
                    stream: Some(stream),
                }))
            }
        }
    }
}

struct UdpTransport {
    socket: UdpSocket,
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&mut self, payload: &[u8]) -> Result<(), PublishError> {
        let written = self.socket.send(payload).await?;
        if written != payload.len() {
            return Err(PublishError::Send(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("datagram truncated to {written} of {} bytes", payload.len()),
            )));
        }
        Ok(())
    }

    async fn close(&mut self) {}
}

struct TcpTransport {
    stream: Option<TcpStream>,
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, payload: &[u8]) -> Result<(), PublishError> {
        let stream = self.stream.as_mut().ok_or(PublishError::Closed)?;
        stream.write_all(payload).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_round_trip_over_loopback() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        let connector = NetworkConnector::new("127.0.0.1", port, Protocol::Udp);
        connector.check().await.unwrap();
        let mut transport = connector.connect().await.unwrap();
        transport.send(b"cpu.usage:1|g\n").await.unwrap();

        let mut buf = [0u8; 64];
        let n = server.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"cpu.usage:1|g\n");
        transport.close().await;
    }

    #[tokio::test]
    async fn tcp_round_trip_over_loopback() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let connector = NetworkConnector::new("127.0.0.1", port, Protocol::Tcp);
        let client = tokio::spawn(async move {
            let mut transport = connector.connect().await.unwrap();
            transport.send(b"mem.free 42 1714564800\n").await.unwrap();
            transport.close().await;
        });

        let (mut conn, _) = listener.accept().await.unwrap();
        let mut received = String::new();
        conn.read_to_string(&mut received).await.unwrap();
        client.await.unwrap();
        assert_eq!(received, "mem.free 42 1714564800\n");
    }

    #[tokio::test]
    async fn unresolvable_host_fails_check() {
        let connector = NetworkConnector::new("host.invalid", 8125, Protocol::Udp);
        assert!(matches!(
            connector.check().await,
            Err(PublishError::Unresolvable { .. })
        ));
    }
}
