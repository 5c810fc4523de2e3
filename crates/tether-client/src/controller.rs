//! Async driver for one terminal view's connection.
//!
//! The driver task owns the transport, the retry timer, and the state
//! machine. Commands arrive on a channel from the owning view; display
//! updates leave on another. Dropping the [`Controller`] aborts the task,
//! so no timer or connection outlives its owner.

use std::collections::VecDeque;
use std::pin::Pin;

use log::warn;
use tokio::sync::mpsc;
use tokio::time::Sleep;

use tether_proto::frame::{ClientFrame, ServerFrame};

use crate::machine::{Action, ConnState, Event, Machine};
use crate::transport::{ConnEvent, Connection, Connector};

/// Requests from the owning view.
#[derive(Debug)]
pub enum Command {
    /// Open a connection, naming an existing backend or requesting a new
    /// one. Any previous connection is force-closed first.
    Connect { backend_id: Option<String> },
    /// User input for the process.
    Input(String),
    /// The view changed size. Forwarded only while the connection is open;
    /// otherwise the next open carries the current size.
    Resize { cols: u16, rows: u16 },
    /// Manual retry after the automatic budget ran out.
    Retry,
    /// Explicit disconnect; never triggers reconnection.
    Disconnect,
}

/// What the owning view needs in order to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    StateChanged(ConnState),
    /// Drop stale display state; output missed while away is not replayed.
    ClearDisplay,
    Output(String),
    Exited(i32),
    /// Automatic retries are spent; recovery needs an explicit retry.
    RetryExhausted,
}

/// Handle held by the view. Dropping it tears the whole connection down.
pub struct Controller {
    cmd_tx: mpsc::UnboundedSender<Command>,
    task: tokio::task::JoinHandle<()>,
}

impl Controller {
    /// Start a driver task with the view's initial size.
    pub fn spawn<C: Connector>(
        connector: C,
        cols: u16,
        rows: u16,
    ) -> (Self, mpsc::UnboundedReceiver<ControllerEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            connector,
            machine: Machine::new(),
            conn: None,
            backend_id: None,
            cols,
            rows,
            retry: None,
            events: event_tx,
            last_state: ConnState::Disconnected,
        };
        let task = tokio::spawn(run(driver, cmd_rx));
        (Self { cmd_tx, task }, event_rx)
    }

    pub fn connect(&self, backend_id: Option<String>) {
        let _ = self.cmd_tx.send(Command::Connect { backend_id });
    }

    pub fn input(&self, data: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::Input(data.into()));
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        let _ = self.cmd_tx.send(Command::Resize { cols, rows });
    }

    pub fn retry(&self) {
        let _ = self.cmd_tx.send(Command::Retry);
    }

    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        // The task may be parked on a transport that never yields; abort
        // drops the connection and any pending retry timer with it.
        self.task.abort();
    }
}

struct Driver<C: Connector> {
    connector: C,
    machine: Machine,
    conn: Option<C::Conn>,
    backend_id: Option<String>,
    cols: u16,
    rows: u16,
    retry: Option<Pin<Box<Sleep>>>,
    events: mpsc::UnboundedSender<ControllerEvent>,
    last_state: ConnState,
}

async fn run<C: Connector>(mut driver: Driver<C>, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None => break, // owner dropped
                Some(Command::Connect { backend_id }) => {
                    driver.backend_id = backend_id;
                    driver.feed(Event::ConnectRequested).await;
                }
                Some(Command::Retry) => {
                    driver.feed(Event::ConnectRequested).await;
                }
                Some(Command::Disconnect) => {
                    // The one close that must reach the gateway with the
                    // normal status code, so it kills the process.
                    if let Some(mut conn) = driver.conn.take() {
                        conn.close_explicit().await;
                    }
                    driver
                        .feed(Event::Closed { user_initiated: true, error: None })
                        .await;
                }
                Some(Command::Input(data)) => {
                    driver.send_if_open(ClientFrame::Data { data }).await;
                }
                Some(Command::Resize { cols, rows }) => {
                    driver.cols = cols;
                    driver.rows = rows;
                    driver.send_if_open(ClientFrame::Resize { cols, rows }).await;
                }
            },
            event = recv_event(&mut driver.conn) => match event {
                ConnEvent::Frame(ServerFrame::Data { data }) => {
                    driver.emit(ControllerEvent::Output(data));
                }
                ConnEvent::Frame(ServerFrame::Exit { code }) => {
                    driver.emit(ControllerEvent::Exited(code));
                    driver.feed(Event::ExitReceived(code)).await;
                }
                ConnEvent::Closed(reason) => {
                    driver.conn = None;
                    driver
                        .feed(Event::Closed {
                            user_initiated: false,
                            error: reason.describe(),
                        })
                        .await;
                }
            },
            () = wait_retry(&mut driver.retry) => {
                driver.retry = None;
                driver.feed(Event::RetryDue).await;
            }
        }
    }

    // Teardown: the view is gone. Close whatever is open; the retry timer
    // drops with the driver.
    driver.close_conn().await;
}

impl<C: Connector> Driver<C> {
    /// Apply one event and execute the resulting actions, feeding any
    /// follow-up events (open succeeded/failed) back through the machine.
    async fn feed(&mut self, event: Event) {
        let mut actions: VecDeque<Action> = self.machine.apply(event).into();
        while let Some(action) = actions.pop_front() {
            match action {
                Action::OpenTransport => {
                    self.emit_state();
                    match self.connector.connect(self.backend_id.as_deref()).await {
                        Ok(conn) => {
                            self.conn = Some(conn);
                            actions.extend(self.machine.apply(Event::Opened));
                        }
                        Err(err) => {
                            actions.extend(self.machine.apply(Event::Closed {
                                user_initiated: false,
                                error: Some(err),
                            }));
                        }
                    }
                }
                Action::CloseTransport => self.close_conn().await,
                Action::SendCurrentSize => {
                    let (cols, rows) = (self.cols, self.rows);
                    self.send_if_open(ClientFrame::Resize { cols, rows }).await;
                }
                Action::ClearDisplay => self.emit(ControllerEvent::ClearDisplay),
                Action::ScheduleRetry(delay) => {
                    self.retry = Some(Box::pin(tokio::time::sleep(delay)));
                }
                Action::CancelRetry => self.retry = None,
                Action::SurfaceExhausted => self.emit(ControllerEvent::RetryExhausted),
            }
        }
        self.emit_state();
    }

    /// Driver-initiated closes are manual by construction: the connection
    /// is gone before its close could ever come back as an event.
    async fn close_conn(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
    }

    async fn send_if_open(&mut self, frame: ClientFrame) {
        if self.machine.state() != ConnState::Connected {
            return;
        }
        if let Some(conn) = self.conn.as_mut() {
            if let Err(err) = conn.send(frame).await {
                // The failure surfaces through recv as a close.
                warn!("send failed: {err}");
            }
        }
    }

    fn emit(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }

    fn emit_state(&mut self) {
        let state = self.machine.state();
        if state != self.last_state {
            self.last_state = state;
            let _ = self.events.send(ControllerEvent::StateChanged(state));
        }
    }
}

async fn recv_event<T: Connection>(conn: &mut Option<T>) -> ConnEvent {
    match conn {
        Some(conn) => conn.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_retry(retry: &mut Option<Pin<Box<Sleep>>>) {
    match retry {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CloseReason;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    struct FakeConn {
        incoming: mpsc::UnboundedReceiver<ConnEvent>,
        sent: mpsc::UnboundedSender<ClientFrame>,
        explicit_close: Arc<AtomicBool>,
    }

    impl Connection for FakeConn {
        async fn send(&mut self, frame: ClientFrame) -> Result<(), String> {
            self.sent.send(frame).map_err(|e| e.to_string())
        }

        async fn recv(&mut self) -> ConnEvent {
            match self.incoming.recv().await {
                Some(event) => event,
                None => ConnEvent::Closed(CloseReason::Error("transport dropped".into())),
            }
        }

        async fn close(&mut self) {}

        async fn close_explicit(&mut self) {
            self.explicit_close.store(true, Ordering::SeqCst);
        }
    }

    struct FakeConnector {
        script: VecDeque<Result<FakeConn, String>>,
        connects: Arc<AtomicUsize>,
    }

    impl Connector for FakeConnector {
        type Conn = FakeConn;

        async fn connect(&mut self, _backend_id: Option<&str>) -> Result<FakeConn, String> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.script
                .pop_front()
                .unwrap_or_else(|| Err("no more connections scripted".into()))
        }
    }

    fn scripted_conn() -> (
        FakeConn,
        mpsc::UnboundedSender<ConnEvent>,
        mpsc::UnboundedReceiver<ClientFrame>,
        Arc<AtomicBool>,
    ) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let explicit_close = Arc::new(AtomicBool::new(false));
        (
            FakeConn {
                incoming: in_rx,
                sent: sent_tx,
                explicit_close: Arc::clone(&explicit_close),
            },
            in_tx,
            sent_rx,
            explicit_close,
        )
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ControllerEvent>) -> ControllerEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("event channel open")
    }

    #[tokio::test]
    async fn connects_sends_size_then_handles_output_and_exit() {
        let (conn, in_tx, mut sent_rx, _) = scripted_conn();
        let connects = Arc::new(AtomicUsize::new(0));
        let connector = FakeConnector {
            script: VecDeque::from([Ok(conn)]),
            connects: Arc::clone(&connects),
        };

        let (ctrl, mut events) = Controller::spawn(connector, 120, 40);
        ctrl.connect(Some("pty-1".into()));

        assert_eq!(
            next_event(&mut events).await,
            ControllerEvent::StateChanged(ConnState::Connecting)
        );
        assert_eq!(next_event(&mut events).await, ControllerEvent::ClearDisplay);
        assert_eq!(
            next_event(&mut events).await,
            ControllerEvent::StateChanged(ConnState::Connected)
        );

        // The open connection carries the current size first.
        assert_eq!(
            sent_rx.recv().await,
            Some(ClientFrame::Resize { cols: 120, rows: 40 })
        );

        ctrl.input("ls\n");
        assert_eq!(
            sent_rx.recv().await,
            Some(ClientFrame::Data { data: "ls\n".into() })
        );

        in_tx
            .send(ConnEvent::Frame(ServerFrame::Data { data: "hi".into() }))
            .unwrap();
        assert_eq!(
            next_event(&mut events).await,
            ControllerEvent::Output("hi".into())
        );

        // Exit never auto-reconnects.
        in_tx
            .send(ConnEvent::Frame(ServerFrame::Exit { code: 0 }))
            .unwrap();
        assert_eq!(next_event(&mut events).await, ControllerEvent::Exited(0));
        assert_eq!(
            next_event(&mut events).await,
            ControllerEvent::StateChanged(ConnState::Disconnected)
        );
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_reconnects_after_backoff() {
        let (conn, _in_tx, mut sent_rx, _) = scripted_conn();
        let connects = Arc::new(AtomicUsize::new(0));
        let connector = FakeConnector {
            script: VecDeque::from([Err("connection refused".into()), Ok(conn)]),
            connects: Arc::clone(&connects),
        };

        let (ctrl, mut events) = Controller::spawn(connector, 80, 24);
        ctrl.connect(Some("pty-1".into()));

        assert_eq!(
            next_event(&mut events).await,
            ControllerEvent::StateChanged(ConnState::Connecting)
        );
        assert_eq!(
            next_event(&mut events).await,
            ControllerEvent::StateChanged(ConnState::Reconnecting)
        );

        // The retry fires after the first backoff delay (paused clock).
        assert_eq!(
            next_event(&mut events).await,
            ControllerEvent::StateChanged(ConnState::Connecting)
        );
        assert_eq!(next_event(&mut events).await, ControllerEvent::ClearDisplay);
        assert_eq!(
            next_event(&mut events).await,
            ControllerEvent::StateChanged(ConnState::Connected)
        );
        assert_eq!(connects.load(Ordering::SeqCst), 2);

        // Reconnect cleared the display; the fresh size went out again.
        assert_eq!(
            sent_rx.recv().await,
            Some(ClientFrame::Resize { cols: 80, rows: 24 })
        );
    }

    #[tokio::test]
    async fn disconnect_is_final_and_closes_explicitly() {
        let (conn, _in_tx, _sent_rx, explicit_close) = scripted_conn();
        let connects = Arc::new(AtomicUsize::new(0));
        let connector = FakeConnector {
            script: VecDeque::from([Ok(conn)]),
            connects: Arc::clone(&connects),
        };

        let (ctrl, mut events) = Controller::spawn(connector, 80, 24);
        ctrl.connect(None);

        loop {
            if next_event(&mut events).await
                == ControllerEvent::StateChanged(ConnState::Connected)
            {
                break;
            }
        }

        ctrl.disconnect();
        assert_eq!(
            next_event(&mut events).await,
            ControllerEvent::StateChanged(ConnState::Disconnected)
        );
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        // The goodbye went out as a clean close, not an abrupt drop; the
        // gateway only kills the process on the former.
        assert!(explicit_close.load(Ordering::SeqCst));
    }

    /// Rebinding force-closes the previous connection abruptly, so the
    /// gateway keeps the process alive for the new binder.
    #[tokio::test]
    async fn rebind_closes_old_connection_abruptly() {
        let (first, _in_a, _sent_a, explicit_close) = scripted_conn();
        let (second, _in_b, _sent_b, _) = scripted_conn();
        let connects = Arc::new(AtomicUsize::new(0));
        let connector = FakeConnector {
            script: VecDeque::from([Ok(first), Ok(second)]),
            connects: Arc::clone(&connects),
        };

        let (ctrl, mut events) = Controller::spawn(connector, 80, 24);
        ctrl.connect(Some("pty-1".into()));
        loop {
            if next_event(&mut events).await
                == ControllerEvent::StateChanged(ConnState::Connected)
            {
                break;
            }
        }

        ctrl.connect(Some("pty-2".into()));
        loop {
            if next_event(&mut events).await
                == ControllerEvent::StateChanged(ConnState::Connected)
            {
                break;
            }
        }

        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert!(!explicit_close.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn resize_while_closed_is_not_queued() {
        let (conn, _in_tx, mut sent_rx, _) = scripted_conn();
        let connects = Arc::new(AtomicUsize::new(0));
        let connector = FakeConnector {
            script: VecDeque::from([Ok(conn)]),
            connects: Arc::clone(&connects),
        };

        let (ctrl, mut events) = Controller::spawn(connector, 80, 24);

        // Size changes before any connection exist are not queued; the next
        // open carries the latest size instead.
        ctrl.resize(100, 30);
        ctrl.resize(132, 43);
        ctrl.connect(None);

        loop {
            if next_event(&mut events).await
                == ControllerEvent::StateChanged(ConnState::Connected)
            {
                break;
            }
        }

        assert_eq!(
            sent_rx.recv().await,
            Some(ClientFrame::Resize { cols: 132, rows: 43 })
        );
        assert!(sent_rx.try_recv().is_err());
    }
}
