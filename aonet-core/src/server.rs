//! Accept loop: listens, enforces the connection cap, spawns one task
//! per session.

use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::fabric::Fabric;
use crate::session::Session;

/// Owns the listener and the shared [`Fabric`]; `run` never returns
/// under normal operation.
pub struct Server {
    config: ServerConfig,
    fabric: Fabric,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            fabric: Fabric::new(),
        }
    }

    /// Borrow the routing fabric, e.g. for a binary to log
    /// connection counts alongside the tunnel supervisor's status.
    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    /// Bind and run the accept loop until an unrecoverable listener
    /// error occurs.
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        log::info!("server listening on {addr}");

        loop {
            let (stream, peer_addr) = listener.accept().await?;

            let user_count = self.fabric.user_count().await;
            if user_count >= self.config.max_connections {
                log::warn!(
                    "too many connections ({user_count}/{}), rejecting {peer_addr}",
                    self.config.max_connections
                );
                drop(stream);
                continue;
            }

            log::info!("new connection from {peer_addr}");
            let fabric = self.fabric.clone();

            tokio::spawn(async move {
                run_session(stream, peer_addr, fabric).await;
            });
        }
    }
}

async fn run_session(stream: tokio::net::TcpStream, peer_addr: std::net::SocketAddr, fabric: Fabric) {
    let (read, write) = stream.into_split();
    let mut session = Session::new(read, write, peer_addr);

    if let Err(e) = session.do_handshake().await {
        log::warn!("handshake failed with {peer_addr}: {e}");
        return;
    }

    if let Err(e) = session.authenticate(&fabric).await {
        log::warn!("authentication failed with {peer_addr}: {e}");
        return;
    }

    if let Err(e) = session.run_loop(&fabric).await {
        log::debug!("session with {peer_addr} ended: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn rejects_connections_once_the_cap_is_reached() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_connections: 0,
            log_level: "INFO".to_string(),
        };

        // Bind ourselves to learn the ephemeral port, then hand that
        // port to the server's own listener via config.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let mut config = config;
        config.port = addr.port();
        let server = Server::new(config);

        tokio::spawn(async move {
            let _ = server.run().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        // max_connections is 0, so the cap check fires before any HI
        // exchange and the server closes the transport immediately.
        let n = stream.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }
}
