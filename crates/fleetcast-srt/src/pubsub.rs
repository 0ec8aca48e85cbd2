//! Single-writer frame fan-out.

use bytes::Bytes;
use fleetcast_core::Result;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::conn::SrtConn;

/// Frames buffered per subscriber before a slow one starts losing data.
const CHANNEL_CAPACITY: usize = 1024;

/// Fans frames from one publisher out to any number of subscribers.
///
/// The publisher pump is the single writer; subscribers receive through
/// their own buffered receiver and skip ahead when they lag. Live media
/// tolerates gaps, not growing delay. When the publisher ends, all
/// subscribers detach without error.
pub struct PubSub {
    tx: broadcast::Sender<Bytes>,
    closed: watch::Sender<bool>,
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSub {
    /// Creates a pub/sub.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (closed, _) = watch::channel(false);
        Self { tx, closed }
    }

    /// Pumps frames from the connection into the fan-out until the
    /// connection ends, then releases all subscribers. Blocks for the
    /// lifetime of the publisher.
    ///
    /// # Errors
    ///
    /// Returns the read error that ended the pump; a clean EOF is `Ok`.
    pub async fn publish(&self, conn: &dyn SrtConn) -> Result<()> {
        let result = loop {
            match conn.read_frame().await {
                Ok(Some(frame)) => {
                    // Send only fails with zero receivers; that is fine,
                    // frames before the first subscriber are dropped.
                    let _ = self.tx.send(frame);
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        let _ = self.closed.send(true);

        result
    }

    /// Forwards fanned-out frames into the connection until the
    /// connection or the publisher ends. Blocks for the lifetime of the
    /// subscriber.
    ///
    /// # Errors
    ///
    /// Returns the write error that ended the forwarding; a finished
    /// publisher is `Ok`.
    pub async fn subscribe(&self, conn: &dyn SrtConn) -> Result<()> {
        let mut rx = self.tx.subscribe();
        let mut closed = self.closed.subscribe();

        if *closed.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Ok(frame) => conn.write_frame(frame).await?,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "subscriber lagged, skipping frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
                _ = closed.changed() => return Ok(()),
            }
        }
    }

    /// Returns the number of attached subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
