//! Push-channel link state: connection phase plus reconnect backoff.
//! One transition method per event; the background task is the only caller of the `on_*` methods.

use std::time::Duration;

use crate::config::ReconnectPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Idle,
    Resolving,
    Connecting,
    Handshaking,
    Open,
    Backoff,
    Closed,
}

/// What to do after a failed or dropped connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconnect {
    After(Duration),
    /// Closed on purpose.
    Disabled,
    /// `max_retries` reached.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_retries: u32,
    retry_count: u32,
    delay: Duration,
}

impl Backoff {
    pub fn new(policy: &ReconnectPolicy) -> Self {
        Self {
            initial: policy.initial_delay(),
            max: policy.max_delay(),
            max_retries: policy.max_retries,
            retry_count: 0,
            delay: policy.initial_delay(),
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn current_delay(&self) -> Duration {
        self.delay
    }

    /// Delay for the next attempt; doubles the stored delay up to the ceiling.
    pub fn schedule(&mut self) -> Reconnect {
        if self.max_retries > 0 && self.retry_count >= self.max_retries {
            return Reconnect::Exhausted;
        }
        self.retry_count += 1;
        let wait = self.delay;
        self.delay = self.delay.saturating_mul(2).min(self.max);
        Reconnect::After(wait)
    }

    pub fn reset(&mut self) {
        self.retry_count = 0;
        self.delay = self.initial;
    }
}

#[derive(Debug, Clone)]
pub struct LinkState {
    phase: LinkPhase,
    should_reconnect: bool,
    backoff: Backoff,
}

impl LinkState {
    pub fn new(policy: &ReconnectPolicy) -> Self {
        Self {
            phase: LinkPhase::Idle,
            should_reconnect: true,
            backoff: Backoff::new(policy),
        }
    }

    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    pub fn is_open(&self) -> bool {
        self.phase == LinkPhase::Open
    }

    pub fn should_reconnect(&self) -> bool {
        self.should_reconnect
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn on_resolving(&mut self) {
        self.phase = LinkPhase::Resolving;
    }

    pub fn on_connecting(&mut self) {
        self.phase = LinkPhase::Connecting;
    }

    pub fn on_handshaking(&mut self) {
        self.phase = LinkPhase::Handshaking;
    }

    pub fn on_open(&mut self) {
        self.phase = LinkPhase::Open;
        self.backoff.reset();
    }

    /// Any resolve/connect/handshake/read failure, or the peer going away.
    pub fn on_failure(&mut self) -> Reconnect {
        if !self.should_reconnect {
            self.phase = LinkPhase::Closed;
            return Reconnect::Disabled;
        }
        let next = self.backoff.schedule();
        self.phase = match next {
            Reconnect::After(_) => LinkPhase::Backoff,
            _ => LinkPhase::Closed,
        };
        next
    }

    pub fn on_close(&mut self) {
        self.should_reconnect = false;
        self.phase = LinkPhase::Closed;
    }
}
