//! The daily verification ceremony.
//!
//! Once a day the primary persona gathers the low-confidence items that
//! extraction was unsure about, asks the user about them in one message,
//! and applies the parsed answer. Errors here are never surfaced to the
//! user; affected items simply wait for the next round.

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::database::schema;
use crate::engine::events::{emit, UiEvent};
use crate::engine::EngineInner;
use crate::entities::{is_protected_relationship, store, DataType};
use crate::extraction::{Confidence, DetailUpdatePayload, ValidationPayload};
use crate::history::{self, NewMessage, Role};
use crate::llm::{call_for_json, CallOpts, Operation};
use crate::personas::PRIMARY_PERSONA;
use crate::queue::{Priority, TaskType};

/// At most this many items per ceremony.
const BATCH_SIZE: usize = 5;
/// Staleness suggestion thresholds: low engagement, long untouched.
const STALE_LEVEL: f64 = 0.2;
const STALE_DAYS: i64 = 180;

const META_LAST_DATE: &str = "ceremony_last_date";
const META_PENDING: &str = "ceremony_pending";

/// One item the user is being asked about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingItem {
    /// Queue id of the backing validation, or None for a staleness
    /// suggestion.
    pub queue_id: Option<String>,
    pub entity: String,
    pub persona: String,
    pub data_type: DataType,
    pub name: String,
    pub confidence: Option<Confidence>,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct Correction {
    pub name: String,
    pub correction: String,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct RoleplayItem {
    pub name: String,
    /// The fiction/campaign group the item belongs to.
    pub group: String,
}

/// Parsed shape of the user's free-form ceremony reply.
#[derive(Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct CeremonyOutcome {
    #[serde(default)]
    pub confirmed: Vec<String>,
    #[serde(default)]
    pub corrected: Vec<Correction>,
    #[serde(default)]
    pub rejected: Vec<String>,
    #[serde(default)]
    pub roleplay: Vec<RoleplayItem>,
    #[serde(default)]
    pub unclear: Vec<String>,
}

/// Whether a ceremony message is out, awaiting the user's reply.
pub async fn has_pending(inner: &Arc<EngineInner>) -> Result<bool> {
    Ok(load_pending(inner).await?.is_some_and(|p| !p.is_empty()))
}

async fn load_pending(inner: &Arc<EngineInner>) -> Result<Option<Vec<PendingItem>>> {
    match schema::get_meta(&inner.db, META_PENDING).await? {
        Some(json) => Ok(serde_json::from_str(&json).ok()),
        None => Ok(None),
    }
}

async fn store_pending(inner: &Arc<EngineInner>, items: &[PendingItem]) -> Result<()> {
    if items.is_empty() {
        schema::delete_meta(&inner.db, META_PENDING).await
    } else {
        schema::set_meta(&inner.db, META_PENDING, &serde_json::to_string(items)?).await
    }
}

/// Scheduled entry point: at most once per calendar day.
pub async fn run_daily(inner: &Arc<EngineInner>) -> Result<()> {
    let today = Local::now().date_naive().to_string();
    if schema::get_meta(&inner.db, META_LAST_DATE).await?.as_deref() == Some(today.as_str()) {
        return Ok(());
    }
    if has_pending(inner).await? {
        // Yesterday's ceremony is still unanswered.
        return Ok(());
    }

    if run(inner, None).await?.is_some() {
        schema::set_meta(&inner.db, META_LAST_DATE, &today).await?;
    }
    Ok(())
}

/// `/clarify` entry point: run now, optionally filtered by category or a
/// specific item name.
pub async fn run_manual(inner: &Arc<EngineInner>, filter: Option<&str>) -> Result<String> {
    if has_pending(inner).await? {
        return Ok("A verification is already waiting for your reply".to_string());
    }
    match run(inner, filter).await? {
        Some(count) => Ok(format!("Asked about {} item(s)", count)),
        None => Ok("Nothing needs verification right now".to_string()),
    }
}

/// Select the batch, emit the question via the primary persona, and stash
/// the pending list. Returns how many items were asked about.
async fn run(inner: &Arc<EngineInner>, filter: Option<&str>) -> Result<Option<usize>> {
    let mut batch = select_batch(inner, filter).await?;
    if batch.len() < BATCH_SIZE && filter.is_none() {
        let room = BATCH_SIZE - batch.len();
        batch.extend(staleness_suggestions(inner, &batch, room).await?);
    }
    if batch.is_empty() {
        return Ok(None);
    }

    let message = compose_message(&batch);

    let focused = inner.focused.lock().await.clone();
    let is_focused = focused == PRIMARY_PERSONA;
    history::append(
        &inner.db,
        NewMessage {
            persona: PRIMARY_PERSONA,
            role: Role::System,
            content: &message,
            read: is_focused,
            concept_processed: true,
            state: None,
            metadata: Some(serde_json::json!({"ceremony": true})),
        },
    )
    .await?;

    if !is_focused {
        let mut runtimes = inner.runtimes.lock().await;
        if let Some(rt) = runtimes.get_mut(PRIMARY_PERSONA) {
            rt.unread_count += 1;
        }
    }

    store_pending(inner, &batch).await?;

    emit(
        &inner.events,
        UiEvent::Response {
            persona: PRIMARY_PERSONA.to_string(),
            content: message,
        },
    );

    tracing::info!("Ceremony issued with {} item(s)", batch.len());
    Ok(Some(batch.len()))
}

/// Pending validations ordered by data-type priority then ascending
/// confidence, capped at the batch size.
async fn select_batch(inner: &Arc<EngineInner>, filter: Option<&str>) -> Result<Vec<PendingItem>> {
    let validations = inner.queue.pending_validations().await?;

    let mut items: Vec<PendingItem> = Vec::new();
    for item in validations {
        let payload: ValidationPayload = match item.payload_as() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Skipping malformed validation {}: {}", item.id, e);
                continue;
            }
        };
        items.push(PendingItem {
            queue_id: Some(item.id),
            entity: payload.entity,
            persona: payload.persona,
            data_type: payload.data_type,
            name: payload.name,
            confidence: Some(payload.confidence),
            note: payload.reason,
        });
    }

    if let Some(filter) = filter {
        let lowered = filter.to_lowercase();
        items.retain(|i| {
            i.data_type.as_str() == lowered || i.name.eq_ignore_ascii_case(filter)
        });
    }

    items.sort_by_key(|i| {
        (
            i.data_type.ceremony_priority(),
            i.confidence.map(|c| c.rank()).unwrap_or(u8::MAX),
        )
    });
    items.truncate(BATCH_SIZE);
    Ok(items)
}

/// Low-engagement rows untouched for half a year, excluding protected
/// relationships and anything already in the batch.
async fn staleness_suggestions(
    inner: &Arc<EngineInner>,
    batch: &[PendingItem],
    room: usize,
) -> Result<Vec<PendingItem>> {
    let cutoff = Utc::now() - chrono::Duration::days(STALE_DAYS);
    let stale = store::stale_rows(&inner.db, STALE_LEVEL, cutoff).await?;

    let mut out = Vec::new();
    for row in stale {
        if out.len() >= room {
            break;
        }
        if is_protected_relationship(&row.name)
            || row
                .relationship
                .as_deref()
                .is_some_and(is_protected_relationship)
        {
            continue;
        }
        if batch
            .iter()
            .any(|b| b.name.eq_ignore_ascii_case(&row.name))
        {
            continue;
        }
        out.push(PendingItem {
            queue_id: None,
            entity: row.entity,
            persona: PRIMARY_PERSONA.to_string(),
            data_type: row.data_type,
            name: row.name,
            confidence: None,
            note: Some("has gone quiet for a long time".to_string()),
        });
    }
    Ok(out)
}

fn compose_message(batch: &[PendingItem]) -> String {
    let mut lines = vec![
        "Quick check-in! I want to make sure I have a few things right:".to_string(),
    ];
    for (i, item) in batch.iter().enumerate() {
        let mut line = format!("{}. {} ({})", i + 1, item.name, item.data_type.as_str());
        if let Some(note) = &item.note {
            line.push_str(&format!(" — {}", note));
        }
        lines.push(line);
    }
    lines.push(
        "Just answer naturally; tell me what's right, what's wrong, and what was \
         only roleplay."
            .to_string(),
    );
    lines.join("\n")
}

/// The user's reply to an outstanding ceremony. Applies every outcome the
/// parse could attribute; anything unclear or unmentioned stays pending.
pub async fn handle_reply(inner: &Arc<EngineInner>, reply: &str) -> Result<String> {
    let pending = load_pending(inner).await?.unwrap_or_default();
    if pending.is_empty() {
        return Ok("No verification pending".to_string());
    }

    history::append(
        &inner.db,
        NewMessage {
            persona: PRIMARY_PERSONA,
            role: Role::Human,
            content: reply,
            read: true,
            concept_processed: true,
            state: Some(crate::history::MessageState::Sent),
            metadata: None,
        },
    )
    .await?;

    let outcome = match parse_reply(inner, &pending, reply).await {
        Ok(Some(outcome)) => outcome,
        Ok(None) | Err(_) => {
            // Never surface ceremony errors; ask again another day.
            tracing::warn!("Could not parse ceremony reply; items stay pending");
            return Ok("Noted — I'll ask again another time".to_string());
        }
    };

    let mut processed: Vec<PendingItem> = Vec::new();

    for name in &outcome.confirmed {
        if let Some(item) = find_item(&pending, name) {
            if let Err(e) = apply_confirm(inner, item).await {
                tracing::warn!("Ceremony confirm of '{}' failed: {}", item.name, e);
            } else {
                processed.push(item.clone());
            }
        }
    }

    for correction in &outcome.corrected {
        if let Some(item) = find_item(&pending, &correction.name) {
            if let Err(e) = apply_correction(inner, item, &correction.correction).await {
                tracing::warn!("Ceremony correction of '{}' failed: {}", item.name, e);
            } else {
                processed.push(item.clone());
            }
        }
    }

    for name in &outcome.rejected {
        if let Some(item) = find_item(&pending, name) {
            if let Err(e) =
                store::delete_row(&inner.db, item.data_type, &item.entity, &item.name).await
            {
                tracing::warn!("Ceremony rejection of '{}' failed: {}", item.name, e);
            } else {
                processed.push(item.clone());
            }
        }
    }

    for roleplay in &outcome.roleplay {
        if let Some(item) = find_item(&pending, &roleplay.name) {
            let mut groups = BTreeSet::new();
            groups.insert(roleplay.group.clone());
            if let Err(e) =
                store::set_row_groups(&inner.db, item.data_type, &item.entity, &item.name, &groups)
                    .await
            {
                tracing::warn!("Ceremony roleplay move of '{}' failed: {}", item.name, e);
            } else {
                processed.push(item.clone());
            }
        }
    }

    // Clear the queue entries behind everything we resolved.
    let resolved_ids: Vec<String> = processed.iter().filter_map(|i| i.queue_id.clone()).collect();
    if !resolved_ids.is_empty() {
        inner.queue.clear_validations(&resolved_ids).await?;
    }

    let remaining: Vec<PendingItem> = pending
        .iter()
        .filter(|p| {
            !processed
                .iter()
                .any(|done| done.name.eq_ignore_ascii_case(&p.name))
        })
        .cloned()
        .collect();
    store_pending(inner, &remaining).await?;

    let ack = format!(
        "Thanks! Updated {} item(s){}",
        processed.len(),
        if remaining.is_empty() {
            String::new()
        } else {
            format!("; {} still open", remaining.len())
        }
    );
    history::append(
        &inner.db,
        NewMessage {
            persona: PRIMARY_PERSONA,
            role: Role::System,
            content: &ack,
            read: true,
            concept_processed: true,
            state: None,
            metadata: None,
        },
    )
    .await?;

    Ok(ack)
}

async fn parse_reply(
    inner: &Arc<EngineInner>,
    pending: &[PendingItem],
    reply: &str,
) -> Result<Option<CeremonyOutcome>> {
    let item_list = pending
        .iter()
        .map(|i| format!("- {} ({})", i.name, i.data_type.as_str()))
        .collect::<Vec<_>>()
        .join("\n");

    let schema = schemars::schema_for!(CeremonyOutcome);
    let system = format!(
        "The assistant asked the user to verify these items:\n{}\n\n\
         Classify the user's reply per item: confirmed, corrected (with the \
         correction text), rejected (not true, delete it), roleplay (true only \
         inside a fiction; include the fiction's name as the group), or unclear. \
         Items the reply does not mention belong in no list. Respond with JSON \
         matching this schema:\n{}",
        item_list,
        serde_json::to_string_pretty(&schema).unwrap_or_else(|_| "{}".to_string()),
    );

    let opts = CallOpts::new(Operation::Concept);
    Ok(call_for_json(inner.llm.as_ref(), &system, reply, &opts).await?)
}

async fn apply_confirm(inner: &Arc<EngineInner>, item: &PendingItem) -> Result<()> {
    match item.data_type {
        DataType::Fact => {
            if store::confirm_fact(&inner.db, &item.entity, &item.name).await? {
                return Ok(());
            }
        }
        DataType::Topic => {
            if store::get_topic(&inner.db, &item.entity, &item.name).await?.is_some() {
                return Ok(());
            }
        }
        DataType::Person => {
            if store::get_person(&inner.db, &item.entity, &item.name).await?.is_some() {
                return Ok(());
            }
        }
        DataType::Trait => {
            if store::get_trait(&inner.db, &item.entity, &item.name).await?.is_some() {
                return Ok(());
            }
        }
    }

    // Confirmed but never written (it was only a proposal): build the row.
    enqueue_detail(inner, item, Some("confirmed by the user".to_string())).await
}

async fn apply_correction(
    inner: &Arc<EngineInner>,
    item: &PendingItem,
    correction: &str,
) -> Result<()> {
    enqueue_detail(inner, item, Some(format!("user correction: {}", correction))).await
}

async fn enqueue_detail(
    inner: &Arc<EngineInner>,
    item: &PendingItem,
    context: Option<String>,
) -> Result<()> {
    inner
        .queue
        .enqueue(
            TaskType::DetailUpdate,
            Priority::High,
            &DetailUpdatePayload {
                persona: item.persona.clone(),
                entity: item.entity.clone(),
                data_type: item.data_type,
                name: item.name.clone(),
                context,
                message_ids: vec![],
            },
        )
        .await
        .context("Failed to enqueue ceremony detail update")?;
    Ok(())
}

fn find_item<'a>(pending: &'a [PendingItem], name: &str) -> Option<&'a PendingItem> {
    pending.iter().find(|i| i.name.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, data_type: DataType, confidence: Option<Confidence>) -> PendingItem {
        PendingItem {
            queue_id: Some(format!("q-{}", name)),
            entity: "human".to_string(),
            persona: PRIMARY_PERSONA.to_string(),
            data_type,
            name: name.to_string(),
            confidence,
            note: None,
        }
    }

    #[test]
    fn test_find_item_case_insensitive() {
        let pending = vec![item("Birthday", DataType::Fact, Some(Confidence::Low))];
        assert!(find_item(&pending, "birthday").is_some());
        assert!(find_item(&pending, "BIRTHDAY").is_some());
        assert!(find_item(&pending, "Cat").is_none());
    }

    #[test]
    fn test_compose_message_lists_items() {
        let batch = vec![
            item("Birthday", DataType::Fact, Some(Confidence::Low)),
            item("Pip", DataType::Person, Some(Confidence::Low)),
        ];
        let message = compose_message(&batch);
        assert!(message.contains("1. Birthday (fact)"));
        assert!(message.contains("2. Pip (person)"));
    }

    #[test]
    fn test_outcome_parses_partial_json() {
        let json = serde_json::json!({
            "confirmed": ["Birthday"],
            "roleplay": [{"name": "Pip", "group": "Campaign X"}]
        });
        let outcome: CeremonyOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(outcome.confirmed, vec!["Birthday"]);
        assert_eq!(outcome.roleplay[0].group, "Campaign X");
        assert!(outcome.rejected.is_empty());
        assert!(outcome.unclear.is_empty());
    }
}
