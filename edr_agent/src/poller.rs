//! Background command polling: fetch a queued command, dispatch it, post the result, sleep.

use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dispatch::{parse_envelope, Dispatcher};
use crate::http::HttpTransport;
use crate::shutdown::StopSignal;

pub struct CommandPoller {
    stop: StopSignal,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CommandPoller {
    pub fn start(
        transport: Arc<HttpTransport>,
        dispatcher: Dispatcher,
        interval: Duration,
    ) -> io::Result<Self> {
        let stop = StopSignal::new();
        let worker_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("edr-poller".into())
            .spawn(move || {
                info!(url = %transport.poll_url(), ?interval, "command polling started");
                while !worker_stop.is_stopped() {
                    poll_once(&transport, &dispatcher);
                    if worker_stop.wait_timeout(interval) {
                        break;
                    }
                }
                info!("command polling stopped");
            })?;
        Ok(Self {
            stop,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn is_running(&self) -> bool {
        !self.stop.is_stopped()
            && self
                .handle
                .lock()
                .map(|h| h.as_ref().is_some_and(|h| !h.is_finished()))
                .unwrap_or(false)
    }

    /// Wake the sleeping thread and join it. Safe to call more than once.
    pub fn stop(&self) {
        self.stop.stop();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(h) = handle {
            let _ = h.join();
        }
    }
}

impl Drop for CommandPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One poll cycle. Errors are logged; the loop keeps going.
pub fn poll_once(transport: &HttpTransport, dispatcher: &Dispatcher) {
    let body = match transport.poll_command() {
        Ok(Some(body)) => body,
        Ok(None) => return,
        Err(e) => {
            debug!(error = %e, "command poll failed");
            return;
        }
    };
    let command_id = parse_envelope(&body).and_then(|c| c.command_id);
    let response = dispatcher.execute(&body);
    match (command_id, response.is_empty()) {
        (Some(id), false) => {
            info!(command_id = %id, "reporting command result");
            if let Err(e) = transport.post_result(&id, &response) {
                warn!(command_id = %id, error = %e, "failed to post command result");
            }
        }
        (Some(id), true) => debug!(command_id = %id, "command produced no result"),
        (None, _) => warn!("polled command has no command_id; result not reported"),
    }
}
