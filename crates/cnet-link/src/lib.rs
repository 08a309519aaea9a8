//! Client-side connection manager for the ComputeNet task broker.
//!
//! [`BrokerLink`] keeps one websocket session to the broker alive, retrying
//! on a fixed delay after every loss until it is shut down. Inbound envelopes
//! are classified and surfaced as [`LinkEvent`]s; task submissions and status
//! polls are only written while the session is connected.

pub mod config;
pub mod dashboard;
pub mod error;
pub mod gateway;
pub mod router;
pub mod supervisor;
pub mod transport;

pub use cnet_core::{DashboardSnapshot, InboundMessage, StatusPatch};
pub use config::LinkConfig;
pub use error::LinkError;
pub use supervisor::{BrokerLink, ConnectionState, ConnectivityStatus, DashboardObserver, LinkEvent};
pub use transport::{Connector, EventSink, TransportEvent, TransportHandle, WsConnector};
