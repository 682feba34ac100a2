//! The task that drives a [`Session`] over a live client connection.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Interval;
use tracing::{Instrument, debug, info, info_span, warn};

use super::{Session, SessionState};
use crate::forwarder::Forwarder;

const READ_BUF_SIZE: usize = 16 * 1024;

impl Session {
    /// Relay `inbound` until any leg ends, then release everything.
    ///
    /// Inbound reads, forwarder events and stats ticks are all handled on
    /// this one task, so session state is never touched concurrently.
    pub async fn run(mut self, mut inbound: TcpStream) {
        let span = info_span!("session", session_id = %self.id, peer = %self.peer);
        async move {
            let Some(mut events) = self.events_rx.take() else {
                warn!("Session already ran");
                return;
            };
            self.on_inbound_accepted();

            {
                let (mut reader, mut writer) = inbound.split();
                let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);

                while !self.is_finishing() {
                    buf.reserve(READ_BUF_SIZE);
                    tokio::select! {
                        read = reader.read_buf(&mut buf) => match read {
                            Ok(0) => {
                                info!(bytes = self.bytes_received, "Client disconnected");
                                self.on_inbound_closed();
                            }
                            Ok(_) => self.on_inbound_data(buf.split().freeze()),
                            Err(e) => {
                                warn!(error = %e, "Inbound connection lost");
                                self.on_inbound_closed();
                            }
                        },
                        Some(event) = events.recv() => self.handle_event(event),
                        () = next_tick(&mut self.stats_timer) => self.report_stats(),
                    }
                }

                if self.inbound_close_requested {
                    if let Err(e) = writer.shutdown().await {
                        debug!(error = %e, "Inbound shutdown failed");
                    }
                }
            }
            drop(inbound);

            let (storage, media) = (&mut self.storage.forwarder, &mut self.media.forwarder);
            let deadline = self.connect_timeout + self.drain_timeout;
            if tokio::time::timeout(deadline, drain(storage, media)).await.is_err() {
                warn!(timeout = ?deadline, "Destinations did not drain in time, closing them");
                storage.abort();
                media.abort();
                drain(storage, media).await;
            }

            self.state = SessionState::Closed;
            info!(bytes = self.bytes_received, "Session closed");
        }
        .instrument(span)
        .await;
    }
}

async fn drain(storage: &mut Forwarder, media: &mut Forwarder) {
    tokio::join!(storage.closed(), media.closed());
}

/// Next tick of an optional timer; never resolves while there is none.
async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
