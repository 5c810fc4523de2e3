use std::time::Duration;

/// Connection lifecycle for one terminal view. One value at a time: being
/// "connected" and "reconnecting" simultaneously cannot be expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// connect() or a manual retry was requested.
    ConnectRequested,
    /// The transport finished opening.
    Opened,
    /// The transport closed. `user_initiated` closes never reconnect.
    Closed {
        user_initiated: bool,
        error: Option<String>,
    },
    /// An exit envelope arrived: the process is gone for good.
    ExitReceived(i32),
    /// The scheduled backoff delay elapsed.
    RetryDue,
}

/// Side effects the driver must perform after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    OpenTransport,
    /// Drop the current transport. Driver-initiated closes are manual by
    /// construction: they never come back as `Closed` events.
    CloseTransport,
    /// The connection just opened; send the current size.
    SendCurrentSize,
    /// Clear stale display state; nothing missed offline is replayed.
    ClearDisplay,
    ScheduleRetry(Duration),
    CancelRetry,
    /// The retry budget is spent; only a manual retry leaves this state.
    SurfaceExhausted,
}

/// Automatic retries stop once `attempts` exceeds this.
pub const MAX_AUTO_ATTEMPTS: u32 = 5;

const BASE_DELAY_MS: u64 = 1000;
const MAX_DELAY_MS: u64 = 16_000;

/// Backoff before automatic reconnect attempt `n`: min(1000 * 2^n, 16000) ms.
pub fn retry_delay(attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(32);
    Duration::from_millis(BASE_DELAY_MS.saturating_mul(factor).min(MAX_DELAY_MS))
}

/// The connection state machine for one terminal view.
#[derive(Debug)]
pub struct Machine {
    state: ConnState,
    attempts: u32,
    exhausted: bool,
    last_error: Option<String>,
    exit_code: Option<i32>,
}

impl Machine {
    pub fn new() -> Self {
        Self {
            state: ConnState::Disconnected,
            attempts: 0,
            exhausted: false,
            last_error: None,
            exit_code: None,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// True while parked in `Reconnecting` with the retry budget spent.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// The single transition function: applies one event and returns the
    /// side effects the driver must run. Events that make no sense in the
    /// current state (stale reports from a superseded transport) are
    /// dropped without effect.
    pub fn apply(&mut self, event: Event) -> Vec<Action> {
        use ConnState::*;

        match (self.state, event) {
            (Disconnected, Event::ConnectRequested) => {
                self.state = Connecting;
                self.attempts = 0;
                self.exhausted = false;
                self.exit_code = None;
                vec![Action::CloseTransport, Action::OpenTransport]
            }
            (Connecting | Connected, Event::ConnectRequested) => {
                // Rebinding (e.g. a new session in the same view) always
                // force-closes the previous connection first.
                self.state = Connecting;
                self.attempts = 0;
                self.exit_code = None;
                vec![Action::CloseTransport, Action::OpenTransport]
            }
            (Reconnecting, Event::ConnectRequested) => {
                // Manual retry: fresh budget, pending timer dropped.
                self.state = Connecting;
                self.attempts = 0;
                self.exhausted = false;
                self.exit_code = None;
                vec![
                    Action::CancelRetry,
                    Action::CloseTransport,
                    Action::OpenTransport,
                ]
            }
            (Connecting, Event::Opened) => {
                self.state = Connected;
                self.attempts = 0;
                self.last_error = None;
                vec![Action::SendCurrentSize, Action::ClearDisplay]
            }
            (Connecting | Connected, Event::Closed { user_initiated: true, .. }) => {
                self.state = Disconnected;
                vec![]
            }
            (Connecting | Connected, Event::Closed { error, .. }) => {
                if let Some(error) = error {
                    self.last_error = Some(error);
                }
                self.schedule_or_exhaust()
            }
            (Connected, Event::ExitReceived(code)) => {
                // The process is gone; this path never auto-reconnects.
                self.state = Disconnected;
                self.exit_code = Some(code);
                vec![Action::CloseTransport]
            }
            (Reconnecting, Event::RetryDue) if !self.exhausted => {
                self.state = Connecting;
                vec![Action::OpenTransport]
            }
            (Reconnecting, Event::Closed { user_initiated: true, .. }) => {
                self.state = Disconnected;
                vec![Action::CancelRetry]
            }
            (_, _) => vec![],
        }
    }

    fn schedule_or_exhaust(&mut self) -> Vec<Action> {
        self.state = ConnState::Reconnecting;
        if self.attempts <= MAX_AUTO_ATTEMPTS {
            let delay = retry_delay(self.attempts);
            self.attempts += 1;
            vec![Action::ScheduleRetry(delay)]
        } else {
            self.exhausted = true;
            vec![Action::SurfaceExhausted]
        }
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}
