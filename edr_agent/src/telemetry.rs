//! Telemetry batching: buffer converted events, flush at the batch size as one gzip'd JSON array.
//! Delivery is best effort; the buffer is cleared after every flush attempt.

use flate2::{write::GzEncoder, Compression};
use std::io::Write;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::types::TelemetryEvent;

/// Where flushed batches go. `HttpTransport` in production, a recorder in tests.
pub trait BatchSink: Send + Sync {
    fn send_compressed(&self, gz: &[u8]) -> Result<(), TransportError>;
    fn send_plain(&self, json: &str) -> Result<(), TransportError>;
}

impl<T: BatchSink + ?Sized> BatchSink for std::sync::Arc<T> {
    fn send_compressed(&self, gz: &[u8]) -> Result<(), TransportError> {
        (**self).send_compressed(gz)
    }

    fn send_plain(&self, json: &str) -> Result<(), TransportError> {
        (**self).send_plain(json)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushResult {
    Empty,
    Sent { events: usize, compressed: bool },
    Failed { events: usize },
}

pub fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::with_capacity(data.len() / 4 + 64), Compression::default());
    enc.write_all(data)?;
    enc.finish()
}

pub type Compressor = fn(&[u8]) -> std::io::Result<Vec<u8>>;

pub struct TelemetryPipeline<S: BatchSink> {
    sink: S,
    batch_size: usize,
    buffer: Vec<TelemetryEvent>,
    compress: Compressor,
}

impl<S: BatchSink> TelemetryPipeline<S> {
    pub fn new(sink: S, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            sink,
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            compress: gzip,
        }
    }

    /// Replace the batch compressor (gzip by default).
    pub fn with_compressor(mut self, compress: Compressor) -> Self {
        self.compress = compress;
        self
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Append one event; returns the flush result when this push filled the batch.
    pub fn push(&mut self, event: TelemetryEvent) -> Option<FlushResult> {
        self.buffer.push(event);
        (self.buffer.len() >= self.batch_size).then(|| self.flush())
    }

    pub fn flush(&mut self) -> FlushResult {
        if self.buffer.is_empty() {
            return FlushResult::Empty;
        }
        let batch = std::mem::take(&mut self.buffer);
        self.buffer.reserve(self.batch_size);
        let events = batch.len();

        let json = match serde_json::to_string(&batch) {
            Ok(js) => js,
            Err(e) => {
                warn!(events, error = %e, "dropping batch that failed to serialize");
                return FlushResult::Failed { events };
            }
        };

        let (sent, compressed) = match (self.compress)(json.as_bytes()) {
            Ok(gz) => {
                debug!(events, raw = json.len(), gz = gz.len(), "sending compressed batch");
                (self.sink.send_compressed(&gz), true)
            }
            Err(e) => {
                warn!(error = %e, "compression failed; sending batch uncompressed");
                (self.sink.send_plain(&json), false)
            }
        };
        match sent {
            Ok(()) => FlushResult::Sent { events, compressed },
            Err(e) => {
                warn!(events, error = %e, "telemetry batch dropped");
                FlushResult::Failed { events }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn gzip_round_trips() {
        let gz = gzip(b"[{\"a\":1}]").unwrap();
        let mut out = String::new();
        GzDecoder::new(&gz[..]).read_to_string(&mut out).unwrap();
        assert_eq!(out, "[{\"a\":1}]");
    }
}
