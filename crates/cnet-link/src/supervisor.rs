//! The reconnection supervisor and the consumer-facing [`BrokerLink`].
//!
//! One actor task owns the live transport handle, the dashboard aggregator
//! and both timers. Everything that mutates link state runs inside that task,
//! one event at a time.

use crate::config::LinkConfig;
use crate::dashboard::Aggregator;
use crate::error::LinkError;
use crate::gateway::Gateway;
use crate::router::{self, InboundHandler};
use crate::transport::{AttemptId, Connector, EventSink, TransportEvent, TransportHandle, WsConnector};
use cnet_core::{DashboardSnapshot, StatusPatch};
use std::fmt;
use std::future;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection health as shown to the surrounding UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityStatus {
    Connected,
    Disconnected,
    Error,
}

impl ConnectivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityStatus::Connected => "connected",
            ConnectivityStatus::Disconnected => "disconnected",
            ConnectivityStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connectivity(ConnectivityStatus),
    TaskAccepted { task_id: String },
    TaskCompleted { task_id: String },
    Dashboard(DashboardSnapshot),
}

enum Command {
    Submit {
        name: String,
        data: String,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    RequestStatus {
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Observe,
    Release,
    Shutdown,
}

/// Owned handle to a running broker link.
///
/// Dropping it tears the link down as if [`BrokerLink::shutdown`] had been
/// called, without waiting for the actor to finish.
pub struct BrokerLink {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<LinkEvent>,
    state: watch::Receiver<ConnectionState>,
    dashboard: watch::Receiver<DashboardSnapshot>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerLink {
    /// Starts supervising a websocket link to `config.endpoint`.
    pub fn connect(config: LinkConfig) -> Self {
        Self::with_connector(config, WsConnector)
    }

    pub fn with_connector<C: Connector>(config: LinkConfig, connector: C) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let aggregator = Aggregator::new(config.poll_interval);
        let dashboard = aggregator.subscribe();

        let supervisor = Supervisor {
            config,
            connector,
            gateway: Gateway::default(),
            aggregator,
            state: ConnectionState::Disconnected,
            state_tx,
            events: events.clone(),
            commands: commands_rx,
            transport_tx,
            transport_rx,
            handle: None,
            attempt: 0,
            retry_at: None,
            shut_down: false,
        };
        let task = tokio::spawn(supervisor.run());

        Self {
            commands: commands_tx,
            events,
            state: state_rx,
            dashboard,
            task: Mutex::new(Some(task)),
        }
    }

    /// Events emitted after this call. Slow receivers may observe
    /// `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Waits until the link reports `target`. Fails once the link is gone
    /// and the last reported state differs.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), LinkError> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| LinkError::ShutDown)
    }

    pub fn dashboard(&self) -> DashboardSnapshot {
        *self.dashboard.borrow()
    }

    /// Registers a dashboard observer. Status polling runs while at least one
    /// observer is alive.
    pub fn observe_dashboard(&self) -> DashboardObserver {
        let _ = self.commands.send(Command::Observe);
        DashboardObserver {
            updates: self.dashboard.clone(),
            commands: self.commands.clone(),
        }
    }

    pub async fn submit_task(&self, name: impl Into<String>, data: impl Into<String>) -> Result<(), LinkError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Submit {
                name: name.into(),
                data: data.into(),
                reply,
            })
            .map_err(|_| LinkError::ShutDown)?;
        rx.await.map_err(|_| LinkError::ShutDown)?
    }

    pub async fn request_status(&self) -> Result<(), LinkError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::RequestStatus { reply })
            .map_err(|_| LinkError::ShutDown)?;
        rx.await.map_err(|_| LinkError::ShutDown)?
    }

    /// Terminal teardown. Safe to call repeatedly and from any state.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(event = "supervisor_join_error", error = %err);
            }
        }
    }
}

impl Drop for BrokerLink {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Keeps dashboard polling alive while held.
pub struct DashboardObserver {
    updates: watch::Receiver<DashboardSnapshot>,
    commands: mpsc::UnboundedSender<Command>,
}

impl DashboardObserver {
    pub fn snapshot(&self) -> DashboardSnapshot {
        *self.updates.borrow()
    }

    /// Next snapshot after a STATUS_UPDATE, or `None` once the link is gone.
    pub async fn changed(&mut self) -> Option<DashboardSnapshot> {
        self.updates.changed().await.ok()?;
        let snapshot = *self.updates.borrow_and_update();
        Some(snapshot)
    }
}

impl Drop for DashboardObserver {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Release);
    }
}

struct Supervisor<C> {
    config: LinkConfig,
    connector: C,
    gateway: Gateway,
    aggregator: Aggregator,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<LinkEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    transport_tx: mpsc::UnboundedSender<(AttemptId, TransportEvent)>,
    transport_rx: mpsc::UnboundedReceiver<(AttemptId, TransportEvent)>,
    handle: Option<Box<dyn TransportHandle>>,
    attempt: AttemptId,
    retry_at: Option<Instant>,
    shut_down: bool,
}

impl<C: Connector> Supervisor<C> {
    async fn run(mut self) {
        self.open();
        while !self.shut_down {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => self.shutdown(),
                },
                Some((attempt, event)) = self.transport_rx.recv() => self.on_transport(attempt, event),
                _ = sleep_until(self.retry_at) => {
                    self.retry_at = None;
                    self.open();
                }
                _ = self.aggregator.next_poll() => self.poll(),
            }
        }
    }

    fn open(&mut self) {
        if self.shut_down || self.state != ConnectionState::Disconnected || self.handle.is_some() {
            debug!(event = "open_skipped", state = %self.state);
            return;
        }
        self.attempt += 1;
        self.set_state(ConnectionState::Connecting);
        info!(
            event = "connect_attempt",
            attempt = self.attempt,
            endpoint = %self.config.endpoint
        );
        let sink = EventSink::new(self.attempt, self.transport_tx.clone());
        self.handle = Some(self.connector.open(&self.config.endpoint, sink));
    }

    fn on_transport(&mut self, attempt: AttemptId, event: TransportEvent) {
        if attempt != self.attempt || self.handle.is_none() {
            debug!(event = "stale_transport_event", attempt, current = self.attempt);
            return;
        }
        match event {
            TransportEvent::Opened => {
                if self.state != ConnectionState::Connecting {
                    debug!(event = "duplicate_open", attempt);
                    return;
                }
                self.set_state(ConnectionState::Connected);
                info!(event = "connected", attempt, endpoint = %self.config.endpoint);
                self.emit(LinkEvent::Connectivity(ConnectivityStatus::Connected));
            }
            TransportEvent::Message(text) => {
                let mut dispatch = Dispatch {
                    aggregator: &mut self.aggregator,
                    events: &self.events,
                };
                router::route(&text, &mut dispatch);
            }
            TransportEvent::Error(reason) => {
                warn!(event = "transport_error", attempt, error = %reason);
                self.emit(LinkEvent::Connectivity(ConnectivityStatus::Error));
            }
            TransportEvent::Closed(code) => {
                self.handle = None;
                self.set_state(ConnectionState::Disconnected);
                self.retry_at = Some(Instant::now() + self.config.reconnect_delay);
                warn!(
                    event = "disconnected",
                    attempt,
                    code = ?code,
                    retry_in_ms = self.config.reconnect_delay.as_millis() as u64
                );
                self.emit(LinkEvent::Connectivity(ConnectivityStatus::Disconnected));
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Submit { name, data, reply } => {
                let result = self
                    .gateway
                    .submit_task(self.state, self.handle.as_deref_mut(), &name, &data)
                    .map_err(session_closing);
                match &result {
                    Ok(()) => info!(event = "task_submitted", name = %name),
                    Err(err) => warn!(event = "task_submit_rejected", name = %name, error = %err),
                }
                let _ = reply.send(result);
            }
            Command::RequestStatus { reply } => {
                let result = self
                    .gateway
                    .request_status(self.state, self.handle.as_deref_mut())
                    .map_err(session_closing);
                let _ = reply.send(result);
            }
            Command::Observe => {
                self.aggregator.register_observer();
                self.log_observers();
            }
            Command::Release => {
                self.aggregator.release_observer();
                self.log_observers();
            }
            Command::Shutdown => self.shutdown(),
        }
    }

    fn log_observers(&self) {
        debug!(
            event = "dashboard_observers",
            observers = self.aggregator.observers(),
            polling = self.aggregator.is_polling()
        );
    }

    fn poll(&mut self) {
        match self
            .aggregator
            .request_refresh(self.state, self.handle.as_deref_mut(), &self.gateway)
        {
            Ok(true) => debug!(event = "status_poll"),
            Ok(false) => debug!(event = "status_poll_skipped", state = %self.state),
            Err(err) => warn!(event = "status_poll_failed", error = %err),
        }
    }

    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.retry_at = None;
        self.aggregator.stop();
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
        self.set_state(ConnectionState::Disconnected);
        info!(event = "link_shutdown", attempts = self.attempt);
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }
}

/// Wiring from router callbacks to the aggregator and consumer events.
struct Dispatch<'a> {
    aggregator: &'a mut Aggregator,
    events: &'a broadcast::Sender<LinkEvent>,
}

impl InboundHandler for Dispatch<'_> {
    fn on_task_accepted(&mut self, task_id: &str) {
        info!(event = "task_accepted", task_id);
        let _ = self.events.send(LinkEvent::TaskAccepted {
            task_id: task_id.to_string(),
        });
    }

    fn on_task_completed(&mut self, task_id: &str) {
        info!(event = "task_completed", task_id);
        let _ = self.events.send(LinkEvent::TaskCompleted {
            task_id: task_id.to_string(),
        });
    }

    fn on_status_update(&mut self, patch: &StatusPatch) {
        let snapshot = self.aggregator.apply_status_update(patch);
        let _ = self.events.send(LinkEvent::Dashboard(snapshot));
    }

    fn on_unknown(&mut self, raw_type: Option<&str>, _raw: &str) {
        debug!(event = "inbound_ignored", raw_type = raw_type.unwrap_or("-"));
    }
}

/// The live handle refuses writes once the peer's close frame is in, which
/// can happen before `Closed` reaches this task. To callers that is a lost
/// connection, not handle misuse.
fn session_closing(err: LinkError) -> LinkError {
    match err {
        LinkError::HandleNotOpen => LinkError::NotConnected,
        other => other,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending::<()>().await,
    }
}
