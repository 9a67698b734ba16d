//! Structured knowledge about the human and about each persona.
//!
//! Four buckets: facts and people exist only on the human entity; traits
//! and topics exist on both. Every row carries a `persona_groups` set that
//! scopes its visibility (empty = global) and, on the human entity, a
//! `learned_by` attribution.

pub mod store;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Entity name of the human. Persona entities use the persona name.
pub const HUMAN_ENTITY: &str = "human";

/// The four data buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Fact,
    Trait,
    Topic,
    Person,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Fact => "fact",
            DataType::Trait => "trait",
            DataType::Topic => "topic",
            DataType::Person => "person",
        }
    }

    pub fn parse(s: &str) -> Option<DataType> {
        match s.to_lowercase().as_str() {
            "fact" => Some(DataType::Fact),
            "trait" => Some(DataType::Trait),
            "topic" => Some(DataType::Topic),
            "person" => Some(DataType::Person),
            _ => None,
        }
    }

    /// Ceremony batch ordering: facts are verified first, topics last.
    pub fn ceremony_priority(&self) -> u8 {
        match self {
            DataType::Fact => 0,
            DataType::Person => 1,
            DataType::Trait => 2,
            DataType::Topic => 3,
        }
    }

    /// Whether persona entities carry this bucket at all.
    pub fn valid_for_persona(&self) -> bool {
        matches!(self, DataType::Trait | DataType::Topic)
    }
}

/// Clamp to the `[0, 1]` range used by confidence, strength, and levels.
pub fn clamp_unit(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Clamp to the `[-1, 1]` sentiment range.
pub fn clamp_sentiment(v: f64) -> f64 {
    v.clamp(-1.0, 1.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactRow {
    pub id: String,
    pub entity: String,
    pub name: String,
    pub description: String,
    pub sentiment: f64,
    pub confidence: f64,
    pub last_confirmed: Option<DateTime<Utc>>,
    pub persona_groups: BTreeSet<String>,
    pub learned_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraitRow {
    pub id: String,
    pub entity: String,
    pub name: String,
    pub description: String,
    pub sentiment: f64,
    pub strength: f64,
    pub persona_groups: BTreeSet<String>,
    pub learned_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicRow {
    pub id: String,
    pub entity: String,
    pub name: String,
    pub description: String,
    pub sentiment: f64,
    pub level_current: f64,
    pub level_ideal: f64,
    pub last_updated: DateTime<Utc>,
    pub persona_groups: BTreeSet<String>,
    pub learned_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonRow {
    pub id: String,
    pub entity: String,
    pub name: String,
    pub relationship: String,
    pub description: String,
    pub sentiment: f64,
    pub level_current: f64,
    pub level_ideal: f64,
    pub last_updated: DateTime<Utc>,
    pub persona_groups: BTreeSet<String>,
    pub learned_by: Option<String>,
}

/// Relationship terms that are never candidates for staleness or removal
/// suggestions. Losing touch with a hobby is normal; suggesting the user
/// has lost touch with their mother is not.
pub const PROTECTED_RELATIONSHIPS: &[&str] = &[
    "mother", "mom", "mum", "mommy", "mama", "father", "dad", "daddy", "papa", "pa",
    "parent", "parents", "stepmother", "stepmom", "stepfather", "stepdad", "stepparent",
    "wife", "husband", "spouse", "partner", "fiancee", "fiance", "girlfriend", "boyfriend",
    "significant other", "son", "daughter", "child", "children", "kid", "kids", "baby",
    "stepson", "stepdaughter", "stepchild", "brother", "sister", "sibling", "siblings",
    "half-brother", "half-sister", "stepbrother", "stepsister", "twin",
    "grandmother", "grandma", "granny", "nana", "grandfather", "grandpa", "granddad",
    "grandparent", "grandparents", "grandson", "granddaughter", "grandchild", "grandchildren",
    "aunt", "auntie", "uncle", "niece", "nephew", "cousin",
    "mother-in-law", "father-in-law", "sister-in-law", "brother-in-law",
    "daughter-in-law", "son-in-law", "in-laws", "godmother", "godfather", "godparent",
    "godson", "goddaughter", "godchild", "guardian", "foster mother", "foster father",
    "foster parent", "foster child", "adoptive mother", "adoptive father", "adopted son",
    "adopted daughter", "best friend", "widow", "widower", "husband-to-be", "wife-to-be",
    "ex-wife", "ex-husband", "caregiver", "caretaker",
];

/// Whether a relationship (or person name used as one) is protected.
pub fn is_protected_relationship(term: &str) -> bool {
    let lowered = term.trim().to_lowercase();
    PROTECTED_RELATIONSHIPS.iter().any(|p| *p == lowered)
}
