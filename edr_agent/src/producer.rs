//! Event-producer thread: scan the event source, feed the telemetry pipeline, flush on stop.

use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};

use crate::events::ProcessWatcher;
use crate::shutdown::StopSignal;
use crate::telemetry::{BatchSink, FlushResult, TelemetryPipeline};

pub struct EventProducer {
    stop: StopSignal,
    handle: Mutex<Option<JoinHandle<FlushResult>>>,
}

impl EventProducer {
    pub fn start<S: BatchSink + 'static>(
        mut watcher: ProcessWatcher,
        mut pipeline: TelemetryPipeline<S>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let stop = StopSignal::new();
        let worker_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("edr-producer".into())
            .spawn(move || {
                info!(?interval, batch_size = pipeline.batch_size(), "event producer started");
                loop {
                    for event in watcher.scan() {
                        if let Some(FlushResult::Failed { events }) = pipeline.push(event) {
                            warn!(events, "batch delivery failed");
                        }
                    }
                    if worker_stop.wait_timeout(interval) {
                        break;
                    }
                }
                let last = pipeline.flush();
                info!(?last, "event producer stopped");
                last
            })?;
        Ok(Self {
            stop,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop scanning and flush the partial batch. Returns the final flush result the first time.
    pub fn stop(&self) -> Option<FlushResult> {
        self.stop.stop();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        handle.join().ok()
    }
}

impl Drop for EventProducer {
    fn drop(&mut self) {
        self.stop();
    }
}
