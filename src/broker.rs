//! Broker seam: deliveries, acknowledgements and a JSON-lines source.
//!
//! The real transport lives outside this crate. The worker pool only needs a
//! way to pull raw deliveries and to ack/nack them by tag.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::error::Result;

/// Acknowledgement side of a broker channel.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Confirm a delivery; the broker forgets it.
    async fn ack(&self, tag: &str) -> Result<()>;

    /// Reject a delivery. With `requeue` the broker redelivers it, otherwise
    /// it goes to the broker's dead-letter path.
    async fn nack(&self, tag: &str, requeue: bool) -> Result<()>;
}

/// Cloneable handle for acknowledging one delivery.
#[derive(Clone)]
pub struct DeliveryHandle {
    tag: String,
    acker: Arc<dyn Acknowledger>,
}

impl DeliveryHandle {
    pub fn new(tag: impl Into<String>, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            tag: tag.into(),
            acker,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack(&self.tag).await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(&self.tag, requeue).await
    }
}

impl fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryHandle")
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

/// One raw delivery from the broker.
#[derive(Debug)]
pub struct Delivery {
    pub body: Vec<u8>,
    handle: DeliveryHandle,
}

impl Delivery {
    pub fn new(tag: impl Into<String>, body: impl Into<Vec<u8>>, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            body: body.into(),
            handle: DeliveryHandle::new(tag, acker),
        }
    }

    pub fn tag(&self) -> &str {
        self.handle.tag()
    }

    pub fn handle(&self) -> &DeliveryHandle {
        &self.handle
    }

    pub fn into_parts(self) -> (Vec<u8>, DeliveryHandle) {
        (self.body, self.handle)
    }
}

/// Source of deliveries.
#[async_trait]
pub trait BrokerConsumer: Send {
    /// Next delivery, or `None` once the source is exhausted.
    async fn next_delivery(&mut self) -> Option<Delivery>;
}

/// Acknowledger for sources without a broker behind them; it only logs.
#[derive(Debug, Default)]
pub struct LoggingAcknowledger;

#[async_trait]
impl Acknowledger for LoggingAcknowledger {
    async fn ack(&self, tag: &str) -> Result<()> {
        tracing::debug!(tag, "Delivery acknowledged");
        Ok(())
    }

    async fn nack(&self, tag: &str, requeue: bool) -> Result<()> {
        tracing::warn!(tag, requeue, "Delivery rejected");
        Ok(())
    }
}

/// Reads one JSON message per line (file or stdin).
///
/// Lines are handed over as raw bytes, so a line that is not valid UTF-8
/// becomes an unparseable delivery instead of ending the stream.
pub struct JsonLinesConsumer<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    line_no: u64,
    acker: Arc<dyn Acknowledger>,
}

impl<R: AsyncRead + Unpin + Send> JsonLinesConsumer<R> {
    pub fn new(reader: R) -> Self {
        Self::with_acknowledger(reader, Arc::new(LoggingAcknowledger))
    }

    pub fn with_acknowledger(reader: R, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
            line_no: 0,
            acker,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> BrokerConsumer for JsonLinesConsumer<R> {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf).await {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(line = self.line_no + 1, "Failed to read delivery: {}", e);
                    return None;
                }
            }
            self.line_no += 1;

            let line = trim_ascii(&self.buf);
            if line.is_empty() {
                continue;
            }
            let tag = format!("line-{}", self.line_no);
            return Some(Delivery::new(tag, line, self.acker.clone()));
        }
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}
