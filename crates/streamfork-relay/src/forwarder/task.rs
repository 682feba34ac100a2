//! Connection task behind a [`Forwarder`](super::Forwarder).

use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use streamfork_core::Endpoint;

use super::{EventSender, ForwarderEvent, ReplyHandler, Role};
use crate::error::ForwarderError;

const READ_BUF_SIZE: usize = 4096;

pub(super) struct ForwarderTask {
    pub(super) role: Role,
    pub(super) target: Endpoint,
    pub(super) timeout: Duration,
    pub(super) writes: mpsc::UnboundedReceiver<Bytes>,
    pub(super) replies: ReplyHandler,
    pub(super) events: EventSender,
    pub(super) shutdown: watch::Receiver<bool>,
}

impl ForwarderTask {
    pub(super) async fn run(mut self) {
        let connect = TcpStream::connect((self.target.host.as_str(), self.target.port));
        let result = tokio::select! {
            result = connect_with_timeout(connect, self.timeout) => result,
            () = wait_for_shutdown(&mut self.shutdown) => {
                debug!(role = %self.role, target = %self.target, "Connect abandoned, session aborted");
                return;
            }
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(error) => {
                self.notify(ForwarderEvent::Lost {
                    role: self.role,
                    error,
                });
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(role = %self.role, error = %e, "Failed to set TCP_NODELAY");
        }
        self.notify(ForwarderEvent::Connected(self.role));

        if let Err(error) = self.pump(stream).await {
            self.notify(ForwarderEvent::Lost {
                role: self.role,
                error,
            });
        }
    }

    /// Relay until the queue closes, the connection fails, or the session
    /// aborts. An abort drops the connection even mid-write.
    async fn pump(&mut self, stream: TcpStream) -> Result<(), ForwarderError> {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            result = self.relay(stream) => result,
            () = wait_for_shutdown(&mut shutdown) => {
                debug!(role = %self.role, target = %self.target, "Forwarder aborted");
                Ok(())
            }
        }
    }

    /// Write queued bytes and read replies until the queue closes or the
    /// connection fails.
    async fn relay(&mut self, stream: TcpStream) -> Result<(), ForwarderError> {
        let (mut reader, mut writer) = stream.into_split();
        let mut buf = vec![0u8; READ_BUF_SIZE];
        let mut written: u64 = 0;

        loop {
            tokio::select! {
                queued = self.writes.recv() => {
                    let Some(bytes) = queued else {
                        // Queue closed by finish(): everything before it is written.
                        writer.shutdown().await.map_err(ForwarderError::ConnectionLost)?;
                        debug!(role = %self.role, bytes = written, "Forwarder closed");
                        return Ok(());
                    };
                    writer
                        .write_all(&bytes)
                        .await
                        .map_err(ForwarderError::ConnectionLost)?;
                    written += bytes.len() as u64;
                }
                read = reader.read(&mut buf) => {
                    match read {
                        Ok(0) => return Err(ForwarderError::closed_by_peer()),
                        Ok(n) => {
                            if let Some(identifier) = self.replies.receive(&buf[..n]) {
                                info!(role = %self.role, %identifier, "Identifier received");
                                self.notify(ForwarderEvent::Identifier(identifier));
                            }
                        }
                        Err(e) => return Err(ForwarderError::ConnectionLost(e)),
                    }
                }
            }
        }
    }

    fn notify(&self, event: ForwarderEvent) {
        // A closed channel means the session is gone and nobody is listening.
        let _ = self.events.send(event);
    }
}

/// Bound an outbound connect by `timeout`.
pub(super) async fn connect_with_timeout<F, T>(
    connect: F,
    timeout: Duration,
) -> Result<T, ForwarderError>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ForwarderError::ConnectFailed(e)),
        Err(_) => Err(ForwarderError::ConnectTimeout { timeout }),
    }
}

/// Resolves once shutdown is signalled or the sender is dropped.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|finished| *finished).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn pending_connect_times_out() {
        let connect = std::future::pending::<io::Result<()>>();
        let result = connect_with_timeout(connect, Duration::from_secs(7)).await;
        assert!(matches!(
            result,
            Err(ForwarderError::ConnectTimeout { timeout }) if timeout == Duration::from_secs(7)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_inside_timeout_succeeds() {
        let connect = async {
            tokio::time::sleep(Duration::from_secs(6)).await;
            Ok::<_, io::Error>(42)
        };
        let result = connect_with_timeout(connect, Duration::from_secs(7)).await;
        assert!(matches!(result, Ok(42)));
    }

    #[tokio::test]
    async fn connect_error_is_not_a_timeout() {
        let connect = async { Err::<(), _>(io::Error::from(io::ErrorKind::ConnectionRefused)) };
        let result = connect_with_timeout(connect, Duration::from_secs(7)).await;
        assert!(matches!(result, Err(ForwarderError::ConnectFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_wait_resolves_on_signal_and_on_drop() {
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        wait_for_shutdown(&mut rx).await;

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        wait_for_shutdown(&mut rx).await;
    }
}
