//! One physical connection attempt to the broker.
//!
//! A handle reports its lifecycle through an [`EventSink`]: either `Opened`,
//! zero or more `Message`s and exactly one `Closed`, or (for a failed
//! attempt) `Error` followed by exactly one `Closed`.

use crate::error::LinkError;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;
use url::Url;

pub const NORMAL_CLOSE: u16 = 1000;
pub const NO_STATUS_CLOSE: u16 = 1005;
pub const ABNORMAL_CLOSE: u16 = 1006;

pub type AttemptId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Message(String),
    Error(String),
    /// Close code, when the attempt got far enough to have one.
    Closed(Option<u16>),
}

/// Delivers lifecycle events of one attempt to its owner.
#[derive(Debug, Clone)]
pub struct EventSink {
    attempt: AttemptId,
    tx: mpsc::UnboundedSender<(AttemptId, TransportEvent)>,
}

impl EventSink {
    pub(crate) fn new(attempt: AttemptId, tx: mpsc::UnboundedSender<(AttemptId, TransportEvent)>) -> Self {
        Self { attempt, tx }
    }

    /// A standalone sink with its own receiver, for driving a connector
    /// outside a supervisor.
    pub fn channel(attempt: AttemptId) -> (Self, mpsc::UnboundedReceiver<(AttemptId, TransportEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(attempt, tx), rx)
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    /// Returns false once the owner stopped listening.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.attempt, event)).is_ok()
    }
}

pub trait TransportHandle: Send {
    /// Valid only between `Opened` and `Closed`; anything else is
    /// [`LinkError::HandleNotOpen`].
    fn send(&mut self, text: String) -> Result<(), LinkError>;

    /// Requests an orderly shutdown. `Closed` still fires exactly once, also
    /// when the handle is already closing or closed.
    fn close(&mut self);
}

pub trait Connector: Send + 'static {
    /// Starts an attempt and returns immediately. Must be called from within
    /// a tokio runtime.
    fn open(&self, endpoint: &Url, sink: EventSink) -> Box<dyn TransportHandle>;
}

const PENDING: u8 = 0;
const OPEN: u8 = 1;
const CLOSED: u8 = 2;

enum HandleCommand {
    Send(String),
    Close,
}

/// Websocket text-frame transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(&self, endpoint: &Url, sink: EventSink) -> Box<dyn TransportHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let phase = Arc::new(AtomicU8::new(PENDING));
        let endpoint = endpoint.clone();
        let driver_phase = phase.clone();
        tokio::spawn(async move {
            let code = drive(&endpoint, &sink, rx, &driver_phase).await;
            driver_phase.store(CLOSED, Ordering::Release);
            sink.emit(TransportEvent::Closed(code));
        });
        Box::new(WsHandle { commands: tx, phase })
    }
}

pub struct WsHandle {
    commands: mpsc::UnboundedSender<HandleCommand>,
    phase: Arc<AtomicU8>,
}

impl TransportHandle for WsHandle {
    fn send(&mut self, text: String) -> Result<(), LinkError> {
        if self.phase.load(Ordering::Acquire) != OPEN {
            return Err(LinkError::HandleNotOpen);
        }
        self.commands
            .send(HandleCommand::Send(text))
            .map_err(|_| LinkError::HandleNotOpen)
    }

    fn close(&mut self) {
        let _ = self.commands.send(HandleCommand::Close);
    }
}

async fn drive(
    endpoint: &Url,
    sink: &EventSink,
    mut commands: mpsc::UnboundedReceiver<HandleCommand>,
    phase: &AtomicU8,
) -> Option<u16> {
    let connect = tokio::select! {
        result = connect_async(endpoint.as_str()) => result,
        _ = wait_for_close(&mut commands) => {
            debug!(event = "connect_abandoned", attempt = sink.attempt());
            return None;
        }
    };
    let (mut ws, _) = match connect {
        Ok(value) => value,
        Err(err) => {
            sink.emit(TransportEvent::Error(err.to_string()));
            return None;
        }
    };
    phase.store(OPEN, Ordering::Release);
    sink.emit(TransportEvent::Opened);

    let mut peer_code: Option<u16> = None;
    loop {
        tokio::select! {
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    sink.emit(TransportEvent::Message(text));
                }
                Some(Ok(Message::Close(frame))) => {
                    phase.store(CLOSED, Ordering::Release);
                    peer_code = Some(frame.map(|f| u16::from(f.code)).unwrap_or(NO_STATUS_CLOSE));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    sink.emit(TransportEvent::Error(err.to_string()));
                    return Some(peer_code.unwrap_or(ABNORMAL_CLOSE));
                }
                None => return Some(peer_code.unwrap_or(ABNORMAL_CLOSE)),
            },
            command = commands.recv() => match command {
                Some(HandleCommand::Send(text)) => {
                    if let Err(err) = ws.send(Message::Text(text)).await {
                        sink.emit(TransportEvent::Error(err.to_string()));
                        return Some(peer_code.unwrap_or(ABNORMAL_CLOSE));
                    }
                }
                Some(HandleCommand::Close) | None => {
                    phase.store(CLOSED, Ordering::Release);
                    let _ = ws.close(None).await;
                    return Some(NORMAL_CLOSE);
                }
            },
        }
    }
}

async fn wait_for_close(commands: &mut mpsc::UnboundedReceiver<HandleCommand>) {
    while let Some(command) = commands.recv().await {
        if matches!(command, HandleCommand::Close) {
            return;
        }
    }
}
