//! Change-event subscription.
//!
//! One TCP connection to the server's event listener. After the handshake
//! the server streams change records in strictly increasing revision order;
//! the subscription re-filters by key (the server-side filter is only an
//! optimization) and enforces the ordering contract, discarding anything at
//! or below the registration revision as an idempotent duplicate.

use crate::codec::{self, ChangeRecord, Subscribe, Subscribed};
use crate::config::ProtocolConfig;
use crate::error::{Result, ZprocError};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::debug;

/// An open subscription to the server's change feed.
///
/// Dropping the subscription closes the connection and releases the
/// server-side fan-out slot.
#[derive(Debug)]
pub struct Subscription {
    stream: TcpStream,
    registration_revision: u64,
    last_revision: u64,
    keys: Option<Vec<String>>,
}

impl Subscription {
    pub(crate) async fn open(
        events_addr: SocketAddr,
        keys: Option<Vec<String>>,
    ) -> Result<Self> {
        let mut stream = tokio::time::timeout(
            ProtocolConfig::CONNECT_TIMEOUT,
            TcpStream::connect(events_addr),
        )
        .await
        .map_err(|_| {
            ZprocError::transport(format!("timed out connecting to {}", events_addr))
        })??;

        codec::write_message(&mut stream, &Subscribe { keys: keys.clone() }).await?;
        let ack: Subscribed = codec::read_message(&mut stream)
            .await?
            .ok_or_else(|| ZprocError::transport("server closed during subscribe handshake"))?;

        debug!(
            revision = ack.revision,
            "subscribed to change feed at {}", events_addr
        );

        Ok(Self {
            stream,
            registration_revision: ack.revision,
            last_revision: ack.revision,
            keys,
        })
    }

    /// The server revision at the moment the subscription was established.
    /// Every record yielded by [`next`](Self::next) has a strictly greater
    /// revision.
    pub fn registration_revision(&self) -> u64 {
        self.registration_revision
    }

    /// Next matching change record, in revision order.
    ///
    /// Fails with a transport error when the server closes the stream and a
    /// protocol error on a revision regression.
    pub async fn next(&mut self) -> Result<ChangeRecord> {
        loop {
            let record: ChangeRecord = codec::read_message(&mut self.stream)
                .await?
                .ok_or_else(|| ZprocError::transport("event stream closed"))?;

            if record.revision <= self.last_revision {
                if record.revision <= self.registration_revision {
                    // Duplicate of pre-registration history; revisions make
                    // redelivery idempotent.
                    continue;
                }
                return Err(ZprocError::protocol(format!(
                    "revision regression on event stream: {} after {}",
                    record.revision, self.last_revision
                )));
            }
            self.last_revision = record.revision;

            if let Some(ref keys) = self.keys {
                if !record.touches_any(keys) {
                    continue;
                }
            }
            return Ok(record);
        }
    }
}
