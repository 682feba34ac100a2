//! Accept loop that spawns one [`Session`] per client.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use streamfork_core::Config;

use crate::session::Session;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The relay's listening socket.
pub struct Relay {
    listener: TcpListener,
    config: Arc<Config>,
}

impl Relay {
    /// Bind `listen_host:listen_port`.
    pub async fn bind(config: Arc<Config>) -> io::Result<Self> {
        let listener =
            TcpListener::bind((config.listen_host.as_str(), config.listen_port)).await?;
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until `shutdown` flips to `true` or its sender is
    /// dropped. A failing session never stops the loop.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        let addr = self
            .local_addr()
            .map_or_else(|_| self.config.listen().to_string(), |a| a.to_string());
        info!(
            addr = %addr,
            storage = %self.config.storage(),
            media = %self.config.media(),
            "Stream server started on {addr}"
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let session = Session::new(&self.config, peer);
                        tokio::spawn(session.run(stream));
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Stream server shutting down");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use streamfork_core::Endpoint;

    use super::*;

    fn loopback_config() -> Arc<Config> {
        Arc::new(Config::new(
            Endpoint::new("127.0.0.1", 0),
            Endpoint::new("127.0.0.1", 1),
            Endpoint::new("127.0.0.1", 1),
        ))
    }

    #[tokio::test]
    async fn binds_ephemeral_port() {
        let relay = Relay::bind(loopback_config()).await.unwrap();
        assert_ne!(relay.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn serve_returns_on_shutdown() {
        let relay = Relay::bind(loopback_config()).await.unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(relay.serve(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn serve_returns_when_sender_dropped() {
        let relay = Relay::bind(loopback_config()).await.unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(relay.serve(rx));
        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
