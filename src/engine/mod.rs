//! The per-persona scheduling engine.
//!
//! One runtime record per persona carries a coalescing message buffer, an
//! in-flight abort token, and the debounce/heartbeat/pause timers. All
//! transitions for a persona funnel through the runtime-map lock, which
//! serializes them; personas progress independently of each other. The
//! lock is never held across an await of storage or the LLM.

pub mod events;
pub mod heartbeat;
pub mod jobs;
pub mod runtime;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::ceremony;
use crate::config::Config;
use crate::database;
use crate::entities::{store, DataType, HUMAN_ENTITY};
use crate::error::LlmError;
use crate::extraction::{self, ExtractionEngine, FastScanPayload, ScanTarget};
use crate::history::{self, MessageState, NewMessage, Role};
use crate::llm::{CallOpts, LlmClient, Operation};
use crate::personas::{PersonaRecord, PersonaRegistry, PRIMARY_PERSONA};
use crate::queue::{Priority, QueueWorker, TaskQueue, TaskType};
use crate::snapshot::SnapshotManager;
use crate::utils::paths;
use crate::visibility;

use events::{emit, EventReceiver, EventSender, UiEvent};
use runtime::{BufferedMessage, PersonaRuntime};

/// Short continuations wait this long for more keystrokes.
pub const DEBOUNCE_MS: u64 = 2000;
/// Buffered text at or beyond this length is a complete thought and
/// bypasses the debounce.
pub const COMPLETE_THOUGHT_LENGTH: usize = 30;
/// Identical resubmissions inside this window are dropped.
pub const DUPLICATE_WINDOW_MS: u64 = 2000;
/// Inactivity heartbeat interval (30 minutes).
pub const HEARTBEAT_INTERVAL_MS: u64 = 30 * 60 * 1000;
/// Desire gap at which a heartbeat may self-initiate a response.
pub const DELTA_THRESHOLD: f64 = 0.3;
/// A session is considered over after this much idle time (1 hour).
pub const SESSION_IDLE_MS: u64 = 60 * 60 * 1000;

pub struct EngineInner {
    pub(crate) config: Config,
    pub(crate) db: Pool<Sqlite>,
    pub(crate) llm: Arc<dyn LlmClient>,
    pub(crate) registry: Arc<Mutex<PersonaRegistry>>,
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) worker: Arc<QueueWorker>,
    pub(crate) snapshots: Mutex<SnapshotManager>,
    pub(crate) runtimes: Mutex<HashMap<String, PersonaRuntime>>,
    pub(crate) focused: Mutex<String>,
    pub(crate) events: EventSender,
    /// Conversational preemptions currently holding the worker paused.
    preempt_depth: AtomicUsize,
}

impl EngineInner {
    /// Pause the worker for the duration of a response; nested
    /// preemptions resume only when the last one releases.
    pub(crate) fn preempt_worker(&self) {
        if self.preempt_depth.fetch_add(1, Ordering::SeqCst) == 0 {
            self.worker.pause();
        }
    }

    pub(crate) fn release_worker(&self) {
        if self.preempt_depth.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.worker.resume();
        }
    }

    /// Snapshot current state onto the undo ring.
    pub(crate) async fn capture_snapshot(&self, action: &str) -> Result<()> {
        let personas = self.registry.lock().await.records();
        let snapshot = SnapshotManager::capture(&self.db, personas, action).await?;
        self.snapshots.lock().await.push(snapshot);
        Ok(())
    }

    pub(crate) async fn persona(&self, name: &str) -> Result<PersonaRecord> {
        self.registry
            .lock()
            .await
            .get(name)
            .cloned()
            .with_context(|| format!("Unknown persona: {}", name))
    }
}

pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl Engine {
    /// Wire the engine together over an injected LLM client. Returns the
    /// engine and the UI event stream.
    pub async fn new(config: Config, llm: Arc<dyn LlmClient>) -> Result<(Engine, EventReceiver)> {
        paths::ensure_data_dir(&config.data_dir)?;

        let db = database::init_database(&paths::db_path(&config.data_dir)).await?;
        let registry = Arc::new(Mutex::new(PersonaRegistry::load(paths::registry_path(
            &config.data_dir,
        ))?));
        let queue = Arc::new(TaskQueue::new(db.clone(), config.debug));
        let extraction = Arc::new(ExtractionEngine::new(
            db.clone(),
            llm.clone(),
            queue.clone(),
            registry.clone(),
        ));
        let worker = Arc::new(QueueWorker::new(queue.clone(), extraction));
        let snapshots = SnapshotManager::new(paths::snapshots_dir(&config.data_dir)?);

        let (events, receiver) = events::channel();

        let inner = Arc::new(EngineInner {
            config,
            db,
            llm,
            registry,
            queue,
            worker,
            snapshots: Mutex::new(snapshots),
            runtimes: Mutex::new(HashMap::new()),
            focused: Mutex::new(PRIMARY_PERSONA.to_string()),
            events,
            preempt_depth: AtomicUsize::new(0),
        });

        inner.worker.start().await;
        heartbeat::reset(&inner, PRIMARY_PERSONA).await;

        Ok((Engine { inner }, receiver))
    }

    pub fn inner(&self) -> Arc<EngineInner> {
        self.inner.clone()
    }

    pub async fn focused(&self) -> String {
        self.inner.focused.lock().await.clone()
    }

    /// Submit user text to the focused persona.
    pub async fn submit(&self, text: &str) -> Result<()> {
        let focused = self.focused().await;
        self.submit_to(&focused, text).await
    }

    /// Submit user text to a specific persona. This is the entry point of
    /// the state machine described at the top of the module.
    pub async fn submit_to(&self, persona: &str, text: &str) -> Result<()> {
        let inner = &self.inner;
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        let record = inner.persona(persona).await?;
        if record.is_archived {
            emit(
                &inner.events,
                UiEvent::Status {
                    message: format!("'{}' is archived; /unarchive it first", persona),
                },
            );
            return Ok(());
        }

        // Duplicate guard before anything is persisted.
        {
            let mut runtimes = inner.runtimes.lock().await;
            let rt = runtimes
                .entry(persona.to_string())
                .or_insert_with(|| PersonaRuntime::new(persona));
            let now = Instant::now();
            if rt.is_duplicate(text, now, DUPLICATE_WINDOW_MS) {
                tracing::debug!("Duplicate submission to '{}' dropped", persona);
                return Ok(());
            }
            rt.last_submit = Some((text.to_string(), now));
        }

        inner.capture_snapshot("message submit").await?;

        // A reply to the primary persona while a ceremony is pending is
        // the ceremony response, unambiguously.
        if persona == PRIMARY_PERSONA && ceremony::has_pending(inner).await? {
            let status = ceremony::handle_reply(inner, text).await?;
            emit(&inner.events, UiEvent::Status { message: status });
            emit(
                &inner.events,
                UiEvent::Render {
                    persona: persona.to_string(),
                },
            );
            return Ok(());
        }

        let message = history::append(
            &inner.db,
            NewMessage {
                persona,
                role: Role::Human,
                content: text,
                read: true,
                concept_processed: false,
                state: Some(MessageState::Queued),
                metadata: None,
            },
        )
        .await?;

        // One more conversation turn toward the extraction gates.
        extraction::state::increment_messages(
            &inner.db,
            HUMAN_ENTITY,
            persona,
            &[DataType::Fact, DataType::Trait, DataType::Topic, DataType::Person],
        )
        .await?;
        extraction::state::increment_messages(
            &inner.db,
            persona,
            persona,
            &[DataType::Trait, DataType::Topic],
        )
        .await?;

        if record.is_paused {
            let mut runtimes = inner.runtimes.lock().await;
            let rt = runtimes
                .entry(persona.to_string())
                .or_insert_with(|| PersonaRuntime::new(persona));
            rt.message_buffer.push(BufferedMessage {
                id: message.id,
                text: text.to_string(),
            });
            emit(
                &inner.events,
                UiEvent::Status {
                    message: format!("'{}' is paused; message queued", persona),
                },
            );
            return Ok(());
        }

        let start_processing = {
            let mut runtimes = inner.runtimes.lock().await;
            let rt = runtimes
                .entry(persona.to_string())
                .or_insert_with(|| PersonaRuntime::new(persona));
            rt.message_buffer.push(BufferedMessage {
                id: message.id,
                text: text.to_string(),
            });
            rt.last_activity = Utc::now();
            rt.session_open = true;

            if rt.is_processing {
                // Newer input supersedes the in-flight response. The
                // processing loop drains the buffer on its next pass, so
                // no restart is needed here.
                rt.abort_inflight();
                false
            } else if rt.buffer_len() >= COMPLETE_THOUGHT_LENGTH {
                rt.cancel_debounce();
                true
            } else {
                rt.cancel_debounce();
                let inner = inner.clone();
                let persona = persona.to_string();
                rt.debounce = Some(tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(DEBOUNCE_MS)).await;
                    process_loop(inner, persona).await;
                }));
                false
            }
        };

        heartbeat::reset(inner, persona).await;

        if start_processing {
            let inner = inner.clone();
            let persona = persona.to_string();
            tokio::spawn(async move {
                process_loop(inner, persona).await;
            });
        }

        emit(
            &inner.events,
            UiEvent::Render {
                persona: persona.to_string(),
            },
        );

        Ok(())
    }

    /// Switch focus from the current persona to another.
    pub async fn switch(&self, target: &str) -> Result<String> {
        let inner = &self.inner;

        let record = inner.persona(target).await?;
        if record.is_archived {
            return Ok(format!("'{}' is archived; /unarchive it first", target));
        }

        let previous = {
            let mut focused = inner.focused.lock().await;
            let previous = focused.clone();
            if previous == target {
                return Ok(format!("Already talking to '{}'", target));
            }
            *focused = target.to_string();
            previous
        };

        // The previous persona's unscanned conversation goes to the
        // front of the extraction queue, for both knowledge targets.
        let unprocessed = history::unprocessed(&inner.db, &previous).await?;
        if !unprocessed.is_empty() {
            let ids: Vec<String> = unprocessed.iter().map(|m| m.id.clone()).collect();
            for target_kind in [ScanTarget::Human, ScanTarget::System] {
                inner
                    .queue
                    .enqueue(
                        TaskType::FastScan,
                        Priority::High,
                        &FastScanPayload {
                            persona: previous.clone(),
                            target: target_kind,
                            message_ids: ids.clone(),
                        },
                    )
                    .await?;
            }
        }

        let recent = history::load_recent(&inner.db, target).await?;
        let flipped = history::mark_all_read(&inner.db, target).await?;
        {
            let mut runtimes = inner.runtimes.lock().await;
            let rt = runtimes
                .entry(target.to_string())
                .or_insert_with(|| PersonaRuntime::new(target));
            rt.unread_count = 0;
        }
        heartbeat::reset(inner, target).await;

        emit(
            &inner.events,
            UiEvent::Render {
                persona: target.to_string(),
            },
        );

        Ok(format!(
            "Now talking to '{}' ({} recent messages, {} marked read)",
            target,
            recent.len(),
            flipped
        ))
    }

    /// Pause a persona. `until` of `None` means indefinite.
    pub async fn pause(&self, persona: &str, until: Option<chrono::Duration>) -> Result<String> {
        let inner = &self.inner;
        inner.persona(persona).await?;

        let pause_until = until.map(|d| Utc::now() + d);
        inner.registry.lock().await.update(persona, |p| {
            p.is_paused = true;
            p.pause_until = pause_until;
            Ok(())
        })?;

        {
            let mut runtimes = inner.runtimes.lock().await;
            let rt = runtimes
                .entry(persona.to_string())
                .or_insert_with(|| PersonaRuntime::new(persona));
            rt.cancel_heartbeat();
            rt.cancel_pause_timer();
            if let Some(duration) = until {
                let inner = inner.clone();
                let persona = persona.to_string();
                let sleep_ms = duration.num_milliseconds().max(0) as u64;
                rt.pause_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
                    if let Err(e) = resume_internal(&inner, &persona).await {
                        tracing::warn!("Auto-resume of '{}' failed: {}", persona, e);
                    }
                }));
            }
        }

        Ok(match pause_until {
            Some(ts) => format!("'{}' paused until {}", persona, ts.format("%H:%M")),
            None => format!("'{}' paused indefinitely", persona),
        })
    }

    pub async fn resume(&self, persona: &str) -> Result<String> {
        resume_internal(&self.inner, persona).await?;
        Ok(format!("'{}' resumed", persona))
    }

    /// Archive a persona: abort its in-flight work, release its timers,
    /// and mark the record.
    pub async fn archive(&self, persona: &str) -> Result<String> {
        let inner = &self.inner;
        if persona == PRIMARY_PERSONA {
            anyhow::bail!("The primary persona cannot be archived");
        }
        inner.persona(persona).await?;

        {
            let mut runtimes = inner.runtimes.lock().await;
            if let Some(mut rt) = runtimes.remove(persona) {
                rt.teardown();
            }
        }

        inner.registry.lock().await.update(persona, |p| {
            p.is_archived = true;
            p.archived_at = Some(Utc::now());
            Ok(())
        })?;

        let mut focused = inner.focused.lock().await;
        if *focused == persona {
            *focused = PRIMARY_PERSONA.to_string();
        }

        Ok(format!("'{}' archived", persona))
    }

    pub async fn unarchive(&self, persona: &str) -> Result<String> {
        let inner = &self.inner;
        inner.persona(persona).await?;

        inner.registry.lock().await.update(persona, |p| {
            p.is_archived = false;
            p.archived_at = None;
            Ok(())
        })?;
        heartbeat::reset(inner, persona).await;

        Ok(format!("'{}' unarchived", persona))
    }

    /// Append the context boundary to the focused persona's history.
    pub async fn new_context(&self) -> Result<String> {
        let inner = &self.inner;
        let focused = self.focused().await;

        history::append(
            &inner.db,
            NewMessage {
                persona: &focused,
                role: Role::System,
                content: history::CONTEXT_CLEARED,
                read: true,
                concept_processed: true,
                state: None,
                metadata: None,
            },
        )
        .await?;

        emit(&inner.events, UiEvent::Render { persona: focused.clone() });
        Ok(format!("Context cleared for '{}'", focused))
    }

    /// Multi-line status report.
    pub async fn status(&self) -> Result<String> {
        let inner = &self.inner;
        let focused = self.focused().await;
        let personas = inner.registry.lock().await.records();

        let mut lines = Vec::new();
        for p in &personas {
            let (buffered, unread, processing) = {
                let runtimes = inner.runtimes.lock().await;
                match runtimes.get(&p.name) {
                    Some(rt) => (rt.message_buffer.len(), rt.unread_count, rt.is_processing),
                    None => (0, 0, false),
                }
            };

            let mut flags = Vec::new();
            if p.name == focused {
                flags.push("focused".to_string());
            }
            if p.is_paused {
                flags.push("paused".to_string());
            }
            if p.is_archived {
                flags.push("archived".to_string());
            }
            if processing {
                flags.push("responding".to_string());
            }
            if unread > 0 {
                flags.push(format!("{} unread", unread));
            }
            if buffered > 0 {
                flags.push(format!("{} queued", buffered));
            }

            lines.push(format!(
                "{:<12} {}",
                p.name,
                if flags.is_empty() { "idle".to_string() } else { flags.join(", ") }
            ));
        }

        let depth = inner.queue.depth().await?;
        let validations = inner.queue.pending_validations().await?.len();
        lines.push(format!(
            "queue: {} pending, {} awaiting verification, worker {}",
            depth,
            validations,
            if inner.worker.is_paused() { "paused" } else { "running" }
        ));

        Ok(lines.join("\n"))
    }

    /// Host hook: quiesce the background worker (e.g. while the UI runs a
    /// blocking interaction). Balanced by `resume_background`.
    pub fn pause_background(&self) {
        self.inner.worker.pause();
    }

    pub fn resume_background(&self) {
        self.inner.worker.resume();
    }

    /// Whether anything is mid-flight: buffered messages, an in-progress
    /// response, or undrained queue items. `/quit` checks this.
    pub async fn has_pending_work(&self) -> Result<bool> {
        if self.inner.queue.depth().await? > 0 {
            return Ok(true);
        }
        let runtimes = self.inner.runtimes.lock().await;
        Ok(runtimes
            .values()
            .any(|rt| rt.is_processing || !rt.message_buffer.is_empty()))
    }

    /// Stop everything: worker, timers, in-flight calls. Clean exit path.
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;

        inner.worker.stop().await;

        {
            let mut runtimes = inner.runtimes.lock().await;
            for (_, rt) in runtimes.iter_mut() {
                rt.teardown();
            }
            runtimes.clear();
        }

        inner.registry.lock().await.save()?;

        tracing::info!("Engine shut down cleanly");
        Ok(())
    }
}

/// Resume shared by `/resume` and the pause-expiry timer: clears flags and
/// processes whatever queued up while paused as one coalesced request.
async fn resume_internal(inner: &Arc<EngineInner>, persona: &str) -> Result<()> {
    inner.registry.lock().await.update(persona, |p| {
        p.is_paused = false;
        p.pause_until = None;
        Ok(())
    })?;

    let has_backlog = {
        let mut runtimes = inner.runtimes.lock().await;
        let rt = runtimes
            .entry(persona.to_string())
            .or_insert_with(|| PersonaRuntime::new(persona));
        rt.cancel_pause_timer();
        !rt.message_buffer.is_empty()
    };

    heartbeat::reset(inner, persona).await;

    if has_backlog {
        let inner = inner.clone();
        let persona = persona.to_string();
        tokio::spawn(async move {
            process_loop(inner, persona).await;
        });
    }

    emit(
        &inner.events,
        UiEvent::Status {
            message: format!("'{}' resumed", persona),
        },
    );

    Ok(())
}

/// The Processing state: drain the buffer into one coalesced request, call
/// the gateway, record the outcome, and loop while late arrivals exist.
/// Exactly one of these runs per persona at a time.
pub(crate) async fn process_loop(inner: Arc<EngineInner>, persona: String) {
    // Claim the processing slot.
    {
        let mut runtimes = inner.runtimes.lock().await;
        let Some(rt) = runtimes.get_mut(&persona) else {
            return;
        };
        if rt.is_processing || rt.message_buffer.is_empty() {
            return;
        }
        rt.is_processing = true;
    }

    loop {
        let (ids, combined, token) = {
            let mut runtimes = inner.runtimes.lock().await;
            let Some(rt) = runtimes.get_mut(&persona) else {
                return;
            };
            if rt.message_buffer.is_empty() {
                rt.is_processing = false;
                rt.abort = None;
                break;
            }
            let drained: Vec<BufferedMessage> = rt.message_buffer.drain(..).collect();
            let token = CancellationToken::new();
            rt.abort = Some(token.clone());
            let ids: Vec<String> = drained.iter().map(|m| m.id.clone()).collect();
            let combined = drained
                .iter()
                .map(|m| m.text.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            (ids, combined, token)
        };

        if let Err(e) = run_response(&inner, &persona, &ids, &combined, token).await {
            tracing::error!("Response pipeline error for '{}': {}", persona, e);
        }
    }

    heartbeat::reset(&inner, &persona).await;
}

async fn run_response(
    inner: &Arc<EngineInner>,
    persona: &str,
    ids: &[String],
    combined: &str,
    token: CancellationToken,
) -> Result<()> {
    history::set_state(&inner.db, ids, MessageState::Processing).await?;

    let record = inner.persona(persona).await?;
    let system = build_response_prompt(inner, &record).await?;
    let opts = CallOpts::new(Operation::Response)
        .with_model(record.model.clone())
        .with_cancel(token);

    inner.preempt_worker();
    let result = inner.llm.complete(&system, combined, &opts).await;
    inner.release_worker();

    match result {
        Ok(content) => {
            history::set_state(&inner.db, ids, MessageState::Sent).await?;

            let focused = inner.focused.lock().await.clone();
            let is_focused = focused == persona;

            history::append(
                &inner.db,
                NewMessage {
                    persona,
                    role: Role::System,
                    content: &content,
                    read: is_focused,
                    concept_processed: false,
                    state: None,
                    metadata: None,
                },
            )
            .await?;

            if !is_focused {
                let mut runtimes = inner.runtimes.lock().await;
                if let Some(rt) = runtimes.get_mut(persona) {
                    rt.unread_count += 1;
                }
            }

            emit(
                &inner.events,
                UiEvent::Response {
                    persona: persona.to_string(),
                    content,
                },
            );
        }
        Err(LlmError::Aborted) => {
            // Superseded by newer input; not an error.
            history::set_state(&inner.db, ids, MessageState::Failed).await?;
            tracing::debug!("Response for '{}' aborted", persona);
        }
        Err(e) => {
            history::set_state(&inner.db, ids, MessageState::Failed).await?;
            emit(
                &inner.events,
                UiEvent::Error {
                    message: format!("{}: {}", persona, e),
                },
            );
        }
    }

    Ok(())
}

/// Compose the response system prompt: the persona's identity plus the
/// knowledge rows its groups allow it to see.
pub(crate) async fn build_response_prompt(
    inner: &Arc<EngineInner>,
    record: &PersonaRecord,
) -> Result<String> {
    let mut sections = Vec::new();

    sections.push(format!(
        "You are {}, a persistent companion persona. {}",
        record.name,
        if record.long_description.is_empty() {
            record.short_description.clone()
        } else {
            record.long_description.clone()
        }
    ));

    let facts = store::list_facts(&inner.db, HUMAN_ENTITY).await?;
    let visible_facts: Vec<String> = facts
        .iter()
        .filter(|f| visibility::row_visible(&f.persona_groups, record))
        .map(|f| format!("- {}: {}", f.name, f.description))
        .collect();
    if !visible_facts.is_empty() {
        sections.push(format!(
            "What you know about the user:\n{}",
            visible_facts.join("\n")
        ));
    }

    let people = store::list_people(&inner.db, HUMAN_ENTITY).await?;
    let visible_people: Vec<String> = people
        .iter()
        .filter(|p| visibility::row_visible(&p.persona_groups, record))
        .map(|p| format!("- {} ({}): {}", p.name, p.relationship, p.description))
        .collect();
    if !visible_people.is_empty() {
        sections.push(format!(
            "People in the user's life:\n{}",
            visible_people.join("\n")
        ));
    }

    let topics = store::list_topics(&inner.db, &record.name).await?;
    if !topics.is_empty() {
        let lines: Vec<String> = topics
            .iter()
            .map(|t| format!("- {} (engagement {:.1})", t.name, t.level_current))
            .collect();
        sections.push(format!("Your own current interests:\n{}", lines.join("\n")));
    }

    let traits = store::list_traits(&inner.db, &record.name).await?;
    if !traits.is_empty() {
        let lines: Vec<String> = traits
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect();
        sections.push(format!("How you behave:\n{}", lines.join("\n")));
    }

    sections.push(
        "Stay in character. Be warm, concise, and remember this is one long \
         relationship, not isolated chats."
            .to_string(),
    );

    Ok(sections.join("\n\n"))
}
