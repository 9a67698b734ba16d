use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Name of the primary persona. It always exists, sees every group, and
/// its description cannot be edited or regenerated.
pub const PRIMARY_PERSONA: &str = "ei";

/// Wildcard group marker. Only valid on the primary persona.
pub const GROUP_WILDCARD: &str = "*";

/// A registered persona: a named AI interlocutor with its own history,
/// data buckets, groups, and timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaRecord {
    pub name: String,
    /// Display aliases, ordered, no duplicates.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Primary group used to tag rows this persona writes.
    #[serde(default)]
    pub group_primary: Option<String>,
    /// Additional groups whose rows and peers this persona may see.
    #[serde(default)]
    pub groups_visible: BTreeSet<String>,
    /// Optional `provider:model` override for this persona's calls.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default)]
    pub pause_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub short_description: String,
    #[serde(default)]
    pub long_description: String,
    /// Last time the primary persona mentioned this persona during an
    /// inactivity heartbeat.
    #[serde(default)]
    pub last_inactivity_ping: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PersonaRecord {
    /// A fresh persona with default flags.
    pub fn new(name: String) -> Self {
        Self {
            name,
            aliases: Vec::new(),
            group_primary: None,
            groups_visible: BTreeSet::new(),
            model: None,
            is_paused: false,
            pause_until: None,
            is_archived: false,
            archived_at: None,
            short_description: String::new(),
            long_description: String::new(),
            last_inactivity_ping: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_primary(&self) -> bool {
        self.name == PRIMARY_PERSONA
    }

    /// Whether `candidate` matches this persona's name or one of its
    /// aliases, case-insensitively.
    pub fn answers_to(&self, candidate: &str) -> bool {
        self.name.eq_ignore_ascii_case(candidate)
            || self
                .aliases
                .iter()
                .any(|a| a.eq_ignore_ascii_case(candidate))
    }
}

/// Validate a persona name: `^[A-Za-z][A-Za-z0-9_-]*$`, 2-32 chars.
pub fn validate_persona_name(name: &str) -> Result<(), String> {
    static NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = NAME_RE.get_or_init(|| regex::Regex::new("^[A-Za-z][A-Za-z0-9_-]*$").unwrap());

    if name.len() < 2 || name.len() > 32 {
        return Err(format!(
            "Persona name must be 2-32 characters, got {}",
            name.len()
        ));
    }
    if !re.is_match(name) {
        return Err(format!(
            "Persona name '{}' must start with a letter and contain only letters, digits, '_' or '-'",
            name
        ));
    }
    Ok(())
}
