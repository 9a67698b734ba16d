//! Engine-to-UI event contract.
//!
//! The engine never renders anything; it emits events over a channel and
//! the host (terminal frontend, test harness) decides what to do with
//! them.

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    /// History for a persona changed; re-render if it is on screen.
    Render { persona: String },
    /// One-line status for the status bar.
    Status { message: String },
    /// A persona produced a response (conversational or self-initiated).
    Response { persona: String, content: String },
    /// A user-visible error line.
    Error { message: String },
}

pub type EventSender = mpsc::UnboundedSender<UiEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<UiEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Fire-and-forget emit; a disconnected UI is not an engine error.
pub fn emit(sender: &EventSender, event: UiEvent) {
    if sender.send(event).is_err() {
        tracing::trace!("UI event dropped: no receiver");
    }
}
