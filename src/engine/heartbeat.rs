//! Inactivity heartbeat, decay ticks, and the staleness sweep.
//!
//! Each persona's heartbeat re-arms on activity and fires after 30 quiet
//! minutes. A tick always runs decay; it only costs an LLM call when the
//! decayed levels have drifted far enough from ideal that the persona has
//! something to say.

use anyhow::Result;
use chrono::Utc;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::ceremony;
use crate::decay;
use crate::entities::{store, HUMAN_ENTITY};
use crate::extraction::{ExposureAnalysisPayload, FastScanPayload, ScanTarget};
use crate::history;
use crate::llm::{CallOpts, Operation};
use crate::personas::PersonaRecord;
use crate::queue::{Priority, TaskType};

use super::events::{emit, UiEvent};
use super::runtime::PersonaRuntime;
use super::{
    EngineInner, DELTA_THRESHOLD, HEARTBEAT_INTERVAL_MS, SESSION_IDLE_MS,
};

/// Human messages unseen by extraction for this long get swept.
const STALE_MESSAGE_MS: i64 = 20 * 60 * 1000;
/// Days without a human message before a persona counts as inactive.
const INACTIVE_AFTER_DAYS: i64 = 7;
/// Days between primary-persona pings about the same inactive persona.
const PING_COOLDOWN_DAYS: i64 = 3;

/// What the persona receives instead of user input on a self-initiated
/// turn.
const HEARTBEAT_USER_PROMPT: &str =
    "(The user has been quiet for a while. If something on your mind is worth \
     raising, reach out naturally. One short message.)";

/// (Re-)arm a persona's inactivity timer.
pub(crate) fn reset<'a>(
    inner: &'a Arc<EngineInner>,
    persona: &'a str,
) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        let mut runtimes = inner.runtimes.lock().await;
        let rt = runtimes
            .entry(persona.to_string())
            .or_insert_with(|| PersonaRuntime::new(persona));
        rt.cancel_heartbeat();

        let inner = inner.clone();
        let persona = persona.to_string();
        rt.heartbeat = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(HEARTBEAT_INTERVAL_MS)).await;
            if let Err(e) = tick(&inner, &persona).await {
                tracing::warn!("Heartbeat tick for '{}' failed: {}", persona, e);
            }
        }));
    })
}

/// One heartbeat firing.
pub async fn tick(inner: &Arc<EngineInner>, persona: &str) -> Result<()> {
    // Busy personas re-arm and try again later.
    {
        let runtimes = inner.runtimes.lock().await;
        if let Some(rt) = runtimes.get(persona) {
            if rt.is_processing || !rt.message_buffer.is_empty() {
                drop(runtimes);
                reset(inner, persona).await;
                return Ok(());
            }
        }
    }

    let record = inner.persona(persona).await?;
    if record.is_paused || record.is_archived {
        // Paused personas stay silent; resume re-arms the timer.
        return Ok(());
    }

    // While a ceremony awaits its answer, the primary persona holds its
    // tongue so the user's next reply stays unambiguous.
    if record.is_primary() && ceremony::has_pending(inner).await? {
        reset(inner, persona).await;
        return Ok(());
    }

    maybe_close_session(inner, persona).await?;

    // Decay runs every tick, LLM calls only past the threshold.
    let own_topics = decay_topics(inner, persona).await?;
    let mut gaps: Vec<(String, f64, f64)> = own_topics;

    let mut human_gaps: Vec<(String, f64, f64)> = Vec::new();
    if record.is_primary() {
        human_gaps.extend(decay_topics(inner, HUMAN_ENTITY).await?);
        human_gaps.extend(decay_people(inner).await?);
    }

    let gap = decay::desire_gap(
        gaps.iter()
            .chain(human_gaps.iter())
            .map(|(_, current, ideal)| (*current, *ideal)),
    );

    if gap >= DELTA_THRESHOLD {
        gaps.sort_by(|a, b| gap_of(b).partial_cmp(&gap_of(a)).unwrap_or(std::cmp::Ordering::Equal));
        human_gaps.sort_by(|a, b| gap_of(b).partial_cmp(&gap_of(a)).unwrap_or(std::cmp::Ordering::Equal));
        self_initiate(inner, &record, &gaps, &human_gaps).await?;
    } else {
        tracing::debug!(
            "Heartbeat for '{}': gap {:.2} below threshold, decay only",
            persona,
            gap
        );
    }

    reset(inner, persona).await;
    Ok(())
}

fn gap_of(entry: &(String, f64, f64)) -> f64 {
    (entry.2 - entry.1).abs()
}

/// Decay every topic of an entity; returns (name, current, ideal) after.
async fn decay_topics(
    inner: &Arc<EngineInner>,
    entity: &str,
) -> Result<Vec<(String, f64, f64)>> {
    let now = Utc::now();
    let mut out = Vec::new();

    for topic in store::list_topics(&inner.db, entity).await? {
        let hours = (now - topic.last_updated).num_minutes() as f64 / 60.0;
        let current = match decay::apply_decay(topic.level_current, topic.level_ideal, hours) {
            Some(level) => {
                store::set_topic_level(&inner.db, entity, &topic.name, level, now).await?;
                level
            }
            None => topic.level_current,
        };
        out.push((topic.name, current, topic.level_ideal));
    }

    Ok(out)
}

async fn decay_people(inner: &Arc<EngineInner>) -> Result<Vec<(String, f64, f64)>> {
    let now = Utc::now();
    let mut out = Vec::new();

    for person in store::list_people(&inner.db, HUMAN_ENTITY).await? {
        let hours = (now - person.last_updated).num_minutes() as f64 / 60.0;
        let current = match decay::apply_decay(person.level_current, person.level_ideal, hours) {
            Some(level) => {
                store::set_person_level(&inner.db, HUMAN_ENTITY, &person.name, level, now).await?;
                level
            }
            None => person.level_current,
        };
        out.push((person.name, current, person.level_ideal));
    }

    Ok(out)
}

/// After an hour of silence the session is over; its exposure analysis is
/// queued for the worker.
async fn maybe_close_session(inner: &Arc<EngineInner>, persona: &str) -> Result<()> {
    let close = {
        let mut runtimes = inner.runtimes.lock().await;
        match runtimes.get_mut(persona) {
            Some(rt)
                if rt.session_open
                    && (Utc::now() - rt.last_activity).num_milliseconds()
                        >= SESSION_IDLE_MS as i64 =>
            {
                rt.session_open = false;
                true
            }
            _ => false,
        }
    };

    if close {
        let session = history::load_recent(&inner.db, persona).await?;
        if !session.is_empty() {
            inner
                .queue
                .enqueue(
                    TaskType::ExposureAnalysis,
                    Priority::Normal,
                    &ExposureAnalysisPayload {
                        persona: persona.to_string(),
                        message_ids: session.iter().map(|m| m.id.clone()).collect(),
                    },
                )
                .await?;
        }
    }

    Ok(())
}

/// The conditional response of a heartbeat tick: no user input, the
/// persona speaks because its internal state diverged enough.
async fn self_initiate(
    inner: &Arc<EngineInner>,
    record: &PersonaRecord,
    own_gaps: &[(String, f64, f64)],
    human_gaps: &[(String, f64, f64)],
) -> Result<()> {
    let mut system = super::build_response_prompt(inner, record).await?;

    let format_gaps = |items: &[(String, f64, f64)]| {
        items
            .iter()
            .filter(|e| gap_of(e) >= DELTA_THRESHOLD)
            .map(|(name, current, ideal)| {
                format!("- {} (at {:.1}, wants {:.1})", name, current, ideal)
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let own = format_gaps(own_gaps);
    if !own.is_empty() {
        system.push_str(&format!("\n\nTopics you miss talking about:\n{}", own));
    }

    let inactive = if record.is_primary() {
        let human = format_gaps(human_gaps);
        if !human.is_empty() {
            system.push_str(&format!(
                "\n\nThings the user seems out of touch with:\n{}",
                human
            ));
        }

        let inactive = find_inactive_personas(inner).await?;
        if !inactive.is_empty() {
            let lines: Vec<String> = inactive
                .iter()
                .map(|p| format!("- {} ({})", p.name, p.short_description))
                .collect();
            system.push_str(&format!(
                "\n\nCompanions the user has not spoken with lately (mention one if it \
                 feels right):\n{}",
                lines.join("\n")
            ));
        }
        inactive
    } else {
        Vec::new()
    };

    let opts = CallOpts::new(Operation::Response).with_model(record.model.clone());

    inner.preempt_worker();
    let result = inner.llm.complete(&system, HEARTBEAT_USER_PROMPT, &opts).await;
    inner.release_worker();

    let content = match result {
        Ok(content) => content,
        Err(e) if e.is_aborted() => return Ok(()),
        Err(e) => {
            tracing::warn!("Self-initiated response for '{}' failed: {}", record.name, e);
            return Ok(());
        }
    };

    let focused = inner.focused.lock().await.clone();
    let is_focused = focused == record.name;

    history::append(
        &inner.db,
        crate::history::NewMessage {
            persona: &record.name,
            role: crate::history::Role::System,
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
        let rt = runtimes
            .entry(record.name.clone())
            .or_insert_with(|| PersonaRuntime::new(&record.name));
        rt.unread_count += 1;
    }

    // A mention of an inactive companion counts as a ping.
    for persona in &inactive {
        if content_mentions(&content, persona) {
            inner.registry.lock().await.update(&persona.name, |p| {
                p.last_inactivity_ping = Some(Utc::now());
                Ok(())
            })?;
        }
    }

    emit(
        &inner.events,
        UiEvent::Response {
            persona: record.name.clone(),
            content,
        },
    );

    Ok(())
}

fn content_mentions(content: &str, persona: &PersonaRecord) -> bool {
    let lowered = content.to_lowercase();
    if lowered.contains(&persona.name.to_lowercase()) {
        return true;
    }
    persona
        .aliases
        .iter()
        .any(|a| lowered.contains(&a.to_lowercase()))
}

/// Personas the user has drifted away from: quiet for a week and not
/// pinged about in the last few days.
async fn find_inactive_personas(inner: &Arc<EngineInner>) -> Result<Vec<PersonaRecord>> {
    let now = Utc::now();
    let records = inner.registry.lock().await.records();
    let mut inactive = Vec::new();

    for record in records {
        if record.is_primary() || record.is_archived || record.is_paused {
            continue;
        }
        let Some(last) = history::last_human_activity(&inner.db, &record.name).await? else {
            continue;
        };
        if (now - last).num_days() < INACTIVE_AFTER_DAYS {
            continue;
        }
        let recently_pinged = record
            .last_inactivity_ping
            .map(|ts| (now - ts).num_days() < PING_COOLDOWN_DAYS)
            .unwrap_or(false);
        if recently_pinged {
            continue;
        }
        inactive.push(record);
    }

    Ok(inactive)
}

/// Five-minute housekeeping: conversation nobody scanned within twenty
/// minutes gets queued for extraction at normal priority.
pub async fn staleness_sweep(inner: &Arc<EngineInner>) -> Result<()> {
    let cutoff = Utc::now() - chrono::Duration::milliseconds(STALE_MESSAGE_MS);
    let records = inner.registry.lock().await.records();

    for record in records {
        if record.is_archived {
            continue;
        }
        let stale = history::unprocessed_older_than(&inner.db, &record.name, cutoff).await?;
        if stale.is_empty() {
            continue;
        }
        let ids: Vec<String> = stale.iter().map(|m| m.id.clone()).collect();
        for target in [ScanTarget::Human, ScanTarget::System] {
            inner
                .queue
                .enqueue(
                    TaskType::FastScan,
                    Priority::Normal,
                    &FastScanPayload {
                        persona: record.name.clone(),
                        target,
                        message_ids: ids.clone(),
                    },
                )
                .await?;
        }
        tracing::debug!(
            "Staleness sweep queued {} messages for '{}'",
            ids.len(),
            record.name
        );
    }

    Ok(())
}
