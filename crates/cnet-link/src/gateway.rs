use crate::error::LinkError;
use crate::supervisor::ConnectionState;
use crate::transport::TransportHandle;
use chrono::{DateTime, Utc};
use cnet_core::OutboundRequest;
use tracing::debug;

/// Builds and writes outbound requests. Fire-and-forget: nothing is tracked
/// after the write.
#[derive(Debug, Clone, Copy)]
pub struct Gateway {
    clock: fn() -> DateTime<Utc>,
}

impl Default for Gateway {
    fn default() -> Self {
        Self { clock: Utc::now }
    }
}

impl Gateway {
    #[cfg(test)]
    pub(crate) fn with_clock(clock: fn() -> DateTime<Utc>) -> Self {
        Self { clock }
    }

    pub fn submit_task<H: TransportHandle + ?Sized>(
        &self,
        state: ConnectionState,
        handle: Option<&mut H>,
        name: &str,
        data: &str,
    ) -> Result<(), LinkError> {
        let handle = live_handle(state, handle)?;
        let request = OutboundRequest::submit_task(name, data, (self.clock)());
        write(handle, &request)
    }

    pub fn request_status<H: TransportHandle + ?Sized>(
        &self,
        state: ConnectionState,
        handle: Option<&mut H>,
    ) -> Result<(), LinkError> {
        let handle = live_handle(state, handle)?;
        write(handle, &OutboundRequest::RequestStatus)
    }
}

fn live_handle<H: TransportHandle + ?Sized>(
    state: ConnectionState,
    handle: Option<&mut H>,
) -> Result<&mut H, LinkError> {
    match (state, handle) {
        (ConnectionState::Connected, Some(handle)) => Ok(handle),
        _ => Err(LinkError::NotConnected),
    }
}

fn write<H: TransportHandle + ?Sized>(handle: &mut H, request: &OutboundRequest) -> Result<(), LinkError> {
    let text = request.encode()?;
    handle.send(text)?;
    debug!(event = "outbound", kind = request.kind());
    Ok(())
}
