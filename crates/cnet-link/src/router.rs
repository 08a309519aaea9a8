use cnet_core::{classify, InboundMessage, StatusPatch};
use tracing::{debug, warn};

const RAW_EXCERPT_CHARS: usize = 200;

/// Receivers for classified inbound messages.
pub trait InboundHandler {
    fn on_task_accepted(&mut self, task_id: &str);
    fn on_task_completed(&mut self, task_id: &str);
    fn on_status_update(&mut self, patch: &StatusPatch);
    fn on_unknown(&mut self, raw_type: Option<&str>, raw: &str);
}

/// Classifies one inbound payload and hands it to exactly one callback.
///
/// Never fails: malformed or unrecognized input is logged and routed to
/// `on_unknown`.
pub fn route<H: InboundHandler + ?Sized>(text: &str, handler: &mut H) -> InboundMessage {
    let message = classify(text);
    if let InboundMessage::Unknown { raw_type, .. } = &message {
        warn!(
            event = "inbound_unrecognized",
            raw_type = raw_type.as_deref().unwrap_or("-"),
            raw = %excerpt(text)
        );
    }
    debug!(event = "inbound", kind = message.kind());
    match &message {
        InboundMessage::TaskAccepted { task_id } => handler.on_task_accepted(task_id),
        InboundMessage::TaskCompleted { task_id } => handler.on_task_completed(task_id),
        InboundMessage::StatusUpdate(patch) => handler.on_status_update(patch),
        InboundMessage::Unknown { raw_type, raw } => handler.on_unknown(raw_type.as_deref(), raw),
    }
    message
}

fn excerpt(text: &str) -> &str {
    match text.char_indices().nth(RAW_EXCERPT_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
