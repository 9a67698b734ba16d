//! Prompt builders for the extraction pipeline.
//!
//! Each builder returns a `(system, user)` pair. JSON-returning prompts
//! embed the schemars-derived schema of the expected response so the
//! model has the exact shape in front of it.

use crate::entities::{DataType, FactRow, PersonRow, TopicRow, TraitRow};
use crate::history::Message;

use super::ScanTarget;

fn schema_of<T: schemars::JsonSchema>() -> String {
    let schema = schemars::schema_for!(T);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| "{}".to_string())
}

pub(crate) fn transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn fast_scan_prompt(
    persona: &str,
    target: ScanTarget,
    messages: &[Message],
    known: &[(DataType, String)],
) -> (String, String) {
    let subject = match target {
        ScanTarget::Human => "the human user".to_string(),
        ScanTarget::System => format!("the persona '{}'", persona),
    };

    let known_list = if known.is_empty() {
        "(none yet)".to_string()
    } else {
        known
            .iter()
            .map(|(t, name)| format!("- {} ({})", name, t.as_str()))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let system = format!(
        "You classify what a conversation excerpt touched on, building a structured \
         profile of {subject}. Known items:\n{known_list}\n\n\
         Report which known items were discussed and propose genuinely new ones. \
         Types: fact (a stable fact), trait (a personality trait), topic (an \
         interest or subject), person (someone in the user's life). Rate each with \
         confidence high, medium, or low. Respond with JSON matching this schema:\n{schema}",
        subject = subject,
        known_list = known_list,
        schema = schema_of::<super::FastScanResponse>(),
    );

    let user = format!("Conversation with '{}':\n{}", persona, transcript(messages));

    (system, user)
}

fn existing_block(existing: Option<String>) -> String {
    match existing {
        Some(json) => format!("Current row:\n{}\n\nMerge new information into it; never discard established details for vague ones.", json),
        None => "There is no existing row; create one from the conversation.".to_string(),
    }
}

pub fn fact_detail_prompt(
    name: &str,
    existing: Option<&FactRow>,
    context: Option<&str>,
    messages: &[Message],
) -> (String, String) {
    let system = format!(
        "You maintain one structured fact about the human user: '{name}'. {existing}\n\
         Respond with JSON matching this schema:\n{schema}",
        name = name,
        existing = existing_block(existing.and_then(|r| serde_json::to_string(r).ok())),
        schema = schema_of::<super::detail::FactDetail>(),
    );
    (system, detail_user(name, context, messages))
}

pub fn trait_detail_prompt(
    entity: &str,
    name: &str,
    existing: Option<&TraitRow>,
    context: Option<&str>,
    messages: &[Message],
) -> (String, String) {
    let system = format!(
        "You maintain one personality trait of '{entity}': '{name}'. {existing}\n\
         Respond with JSON matching this schema:\n{schema}",
        entity = entity,
        name = name,
        existing = existing_block(existing.and_then(|r| serde_json::to_string(r).ok())),
        schema = schema_of::<super::detail::TraitDetail>(),
    );
    (system, detail_user(name, context, messages))
}

pub fn topic_detail_prompt(
    entity: &str,
    name: &str,
    existing: Option<&TopicRow>,
    context: Option<&str>,
    messages: &[Message],
) -> (String, String) {
    let system = format!(
        "You maintain one topic of interest for '{entity}': '{name}'. \
         level_current is how present the topic is right now, level_ideal how \
         present it should ideally be; both in [0,1]. {existing}\n\
         Respond with JSON matching this schema:\n{schema}",
        entity = entity,
        name = name,
        existing = existing_block(existing.and_then(|r| serde_json::to_string(r).ok())),
        schema = schema_of::<super::detail::TopicDetail>(),
    );
    (system, detail_user(name, context, messages))
}

pub fn person_detail_prompt(
    name: &str,
    existing: Option<&PersonRow>,
    context: Option<&str>,
    messages: &[Message],
) -> (String, String) {
    let system = format!(
        "You maintain the record of one person in the human user's life: '{name}'. \
         Capture the relationship and how engaged the user currently is with them. {existing}\n\
         Respond with JSON matching this schema:\n{schema}",
        name = name,
        existing = existing_block(existing.and_then(|r| serde_json::to_string(r).ok())),
        schema = schema_of::<super::detail::PersonDetail>(),
    );
    (system, detail_user(name, context, messages))
}

fn detail_user(name: &str, context: Option<&str>, messages: &[Message]) -> String {
    let mut user = format!("Update '{}' from this conversation:\n{}", name, transcript(messages));
    if let Some(ctx) = context {
        user.push_str(&format!("\n\nAdditional context: {}", ctx));
    }
    user
}

pub fn behavior_gate_prompt(messages: &[Message]) -> (String, String) {
    let system = format!(
        "Decide whether the human is explicitly asking the assistant persona to \
         change its behavior (tone, style, rules of engagement). Roleplay content, \
         jokes, or statements about the world are NOT behavior change requests. \
         Respond with JSON matching this schema:\n{}",
        schema_of::<super::behavior::BehaviorGate>(),
    );
    (system, transcript(messages))
}

pub fn behavior_extract_prompt(messages: &[Message]) -> (String, String) {
    let system = format!(
        "The human asked the persona to change its behavior. State the specific \
         requested behavior in one sentence. Respond with JSON matching this schema:\n{}",
        schema_of::<super::behavior::BehaviorExtract>(),
    );
    (system, transcript(messages))
}

pub fn behavior_trait_prompt(
    persona: &str,
    behavior: &str,
    existing: &[TraitRow],
) -> (String, String) {
    let existing_list = if existing.is_empty() {
        "(none)".to_string()
    } else {
        existing
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let system = format!(
        "Map a requested behavior change onto a trait row for the persona \
         '{persona}'. Existing traits:\n{existing_list}\n\n\
         Reuse an existing trait name when the request refines it; otherwise \
         choose a concise new name. Respond with JSON matching this schema:\n{schema}",
        persona = persona,
        existing_list = existing_list,
        schema = schema_of::<super::behavior::BehaviorTrait>(),
    );
    (system, format!("Requested behavior: {}", behavior))
}

pub fn exposure_prompt(
    messages: &[Message],
    topic_names: &[String],
    people_names: &[String],
) -> (String, String) {
    let system = format!(
        "A conversation session just ended. For each listed topic or person that \
         the session meaningfully engaged with, report a delta in [-1,1] to apply \
         to its exposure level (positive = more present). Omit anything the \
         session did not touch.\nTopics: {}\nPeople: {}\n\
         Respond with JSON matching this schema:\n{}",
        topic_names.join(", "),
        people_names.join(", "),
        schema_of::<super::exposure::ExposureResponse>(),
    );
    (system, transcript(messages))
}

pub fn description_regen_prompt(
    persona: &str,
    recent: &[Message],
    traits: &[TraitRow],
) -> (String, String) {
    let trait_list = traits
        .iter()
        .map(|t| format!("- {} ({:.1}): {}", t.name, t.strength, t.description))
        .collect::<Vec<_>>()
        .join("\n");

    let system = format!(
        "Write a short (one sentence) and a long (one paragraph) description of \
         the persona '{persona}', grounded in its traits and how it has actually \
         been talking. Traits:\n{traits}\n\
         Respond with JSON matching this schema:\n{schema}",
        persona = persona,
        traits = if trait_list.is_empty() { "(none)".to_string() } else { trait_list },
        schema = schema_of::<super::DescriptionResponse>(),
    );
    (system, transcript(recent))
}
