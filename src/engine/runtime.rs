//! In-memory runtime state of one persona.
//!
//! All mutation of these records happens under the engine's runtime-map
//! lock; the timers they own are plain tokio tasks whose handles are
//! aborted when superseded.

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A submitted message waiting in the coalescing buffer, together with its
/// persisted history id so delivery state can be flipped later.
#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub id: String,
    pub text: String,
}

#[derive(Debug)]
pub struct PersonaRuntime {
    pub name: String,
    pub message_buffer: Vec<BufferedMessage>,
    pub is_processing: bool,
    /// Abort token of the in-flight response call, if any.
    pub abort: Option<CancellationToken>,
    pub debounce: Option<JoinHandle<()>>,
    pub heartbeat: Option<JoinHandle<()>>,
    pub pause_timer: Option<JoinHandle<()>>,
    /// Duplicate-submission guard: last submitted text and when.
    pub last_submit: Option<(String, Instant)>,
    pub last_activity: DateTime<Utc>,
    /// True while a conversation session is running (for the idle
    /// exposure-analysis trigger).
    pub session_open: bool,
    pub unread_count: u32,
}

impl PersonaRuntime {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            message_buffer: Vec::new(),
            is_processing: false,
            abort: None,
            debounce: None,
            heartbeat: None,
            pause_timer: None,
            last_submit: None,
            last_activity: Utc::now(),
            session_open: false,
            unread_count: 0,
        }
    }

    /// Total buffered text length, for the complete-thought threshold.
    pub fn buffer_len(&self) -> usize {
        self.message_buffer.iter().map(|m| m.text.len()).sum()
    }

    /// Identical text resubmitted inside the window is a UI double-fire.
    pub fn is_duplicate(&self, text: &str, now: Instant, window_ms: u64) -> bool {
        match &self.last_submit {
            Some((last_text, at)) => {
                last_text == text
                    && now.duration_since(*at).as_millis() < u128::from(window_ms)
            }
            None => false,
        }
    }

    pub fn cancel_debounce(&mut self) {
        if let Some(handle) = self.debounce.take() {
            handle.abort();
        }
    }

    pub fn cancel_heartbeat(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }

    pub fn cancel_pause_timer(&mut self) {
        if let Some(handle) = self.pause_timer.take() {
            handle.abort();
        }
    }

    /// Signal the in-flight call to stop, if there is one.
    pub fn abort_inflight(&mut self) {
        if let Some(token) = self.abort.take() {
            token.cancel();
        }
    }

    /// Release everything this runtime owns (archive, shutdown, restore).
    pub fn teardown(&mut self) {
        self.cancel_debounce();
        self.cancel_heartbeat();
        self.cancel_pause_timer();
        self.abort_inflight();
    }
}

impl Drop for PersonaRuntime {
    fn drop(&mut self) {
        self.teardown();
    }
}
