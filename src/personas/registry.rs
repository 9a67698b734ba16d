use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::models::{validate_persona_name, PersonaRecord, GROUP_WILDCARD, PRIMARY_PERSONA};

/// Locked description for the primary persona. Attempts to edit or
/// regenerate it are rejected.
const PRIMARY_SHORT_DESCRIPTION: &str = "Your primary companion and caretaker of the others.";
const PRIMARY_LONG_DESCRIPTION: &str = "ei is the primary persona: it coordinates the other \
personas, runs the daily verification ceremony, and keeps an eye on companions you have not \
spoken with in a while. It sees every group.";

/// Outcome of resolving a possibly-partial persona name.
#[derive(Debug, PartialEq, Eq)]
pub enum NameMatch {
    Exact(String),
    /// The prefix matched exactly one persona.
    Partial(String),
    Ambiguous(Vec<String>),
    NotFound,
}

/// Manages all persona records, persisted as a single JSON document.
pub struct PersonaRegistry {
    personas: BTreeMap<String, PersonaRecord>,
    path: PathBuf,
}

impl PersonaRegistry {
    /// Load the registry from disk (or start empty), then enforce the
    /// primary-persona invariants and expire any elapsed pauses.
    pub fn load(path: PathBuf) -> Result<Self> {
        let personas = if path.exists() {
            let contents =
                std::fs::read_to_string(&path).context("Failed to read persona registry")?;
            serde_json::from_str(&contents).context("Failed to parse persona registry")?
        } else {
            BTreeMap::new()
        };

        let mut registry = Self { personas, path };
        registry.ensure_primary();
        registry.expire_pauses();
        registry.save()?;

        tracing::debug!("Loaded {} personas", registry.personas.len());

        Ok(registry)
    }

    /// The primary persona always exists, always sees everything, and
    /// carries a locked description.
    fn ensure_primary(&mut self) {
        let primary = self
            .personas
            .entry(PRIMARY_PERSONA.to_string())
            .or_insert_with(|| PersonaRecord::new(PRIMARY_PERSONA.to_string()));

        primary.groups_visible.clear();
        primary.groups_visible.insert(GROUP_WILDCARD.to_string());
        primary.short_description = PRIMARY_SHORT_DESCRIPTION.to_string();
        primary.long_description = PRIMARY_LONG_DESCRIPTION.to_string();
        primary.is_archived = false;
    }

    /// Auto-resume personas whose pause window elapsed while the process
    /// was down.
    fn expire_pauses(&mut self) {
        let now = Utc::now();
        for persona in self.personas.values_mut() {
            if persona.is_paused {
                if let Some(until) = persona.pause_until {
                    if until <= now {
                        persona.is_paused = false;
                        persona.pause_until = None;
                        tracing::info!("Persona '{}' auto-resumed (pause expired)", persona.name);
                    }
                }
            }
        }
    }

    /// Create a new persona. The name must validate and be unused by any
    /// name or alias.
    pub fn create(&mut self, name: &str) -> Result<&PersonaRecord> {
        validate_persona_name(name).map_err(|e| anyhow::anyhow!(e))?;

        if self.personas.values().any(|p| p.answers_to(name)) {
            anyhow::bail!("Persona '{}' already exists", name);
        }

        self.personas
            .insert(name.to_string(), PersonaRecord::new(name.to_string()));
        self.save()?;

        tracing::info!("Created persona '{}'", name);

        Ok(self.personas.get(name).unwrap())
    }

    pub fn get(&self, name: &str) -> Option<&PersonaRecord> {
        self.personas.get(name)
    }

    /// Mutate a persona record through a closure, then persist. The
    /// closure's error (if any) aborts without saving.
    pub fn update<F>(&mut self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut PersonaRecord) -> Result<()>,
    {
        let persona = self
            .personas
            .get_mut(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown persona: {}", name))?;
        f(persona)?;

        if name == PRIMARY_PERSONA {
            self.ensure_primary();
        }
        self.save()
    }

    pub fn list(&self) -> Vec<&PersonaRecord> {
        self.personas.values().collect()
    }

    pub fn records(&self) -> Vec<PersonaRecord> {
        self.personas.values().cloned().collect()
    }

    /// All names and aliases, used by extraction to filter proposed items
    /// that collide with persona identities.
    pub fn all_names_and_aliases(&self) -> Vec<String> {
        let mut out = Vec::new();
        for persona in self.personas.values() {
            out.push(persona.name.clone());
            out.extend(persona.aliases.iter().cloned());
        }
        out
    }

    /// Resolve user input to a persona name: exact name/alias match first
    /// (case-insensitive), then unique prefix of a name.
    pub fn resolve(&self, input: &str) -> NameMatch {
        for persona in self.personas.values() {
            if persona.answers_to(input) {
                return NameMatch::Exact(persona.name.clone());
            }
        }

        let lowered = input.to_lowercase();
        let matches: Vec<String> = self
            .personas
            .values()
            .filter(|p| p.name.to_lowercase().starts_with(&lowered))
            .map(|p| p.name.clone())
            .collect();

        match matches.len() {
            0 => NameMatch::NotFound,
            1 => NameMatch::Partial(matches.into_iter().next().unwrap()),
            _ => NameMatch::Ambiguous(matches),
        }
    }

    /// Replace every record (snapshot restore). The primary invariants are
    /// re-applied afterwards.
    pub fn replace_all(&mut self, records: Vec<PersonaRecord>) -> Result<()> {
        self.personas = records.into_iter().map(|p| (p.name.clone(), p)).collect();
        self.ensure_primary();
        self.save()
    }

    /// Persist the registry document.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create registry directory")?;
        }
        let contents = serde_json::to_string_pretty(&self.personas)
            .context("Failed to serialize persona registry")?;
        std::fs::write(&self.path, contents).context("Failed to write persona registry")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> (PersonaRegistry, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let registry = PersonaRegistry::load(tmp.path().join("personas.json")).unwrap();
        (registry, tmp)
    }

    #[test]
    fn test_primary_always_exists_with_wildcard() {
        let (registry, _tmp) = test_registry();
        let primary = registry.get(PRIMARY_PERSONA).unwrap();
        assert!(primary.groups_visible.contains(GROUP_WILDCARD));
        assert!(!primary.short_description.is_empty());
    }

    #[test]
    fn test_create_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("personas.json");

        {
            let mut registry = PersonaRegistry::load(path.clone()).unwrap();
            registry.create("Bob").unwrap();
        }

        let registry = PersonaRegistry::load(path).unwrap();
        assert!(registry.get("Bob").is_some());
        assert!(registry.get(PRIMARY_PERSONA).is_some());
    }

    #[test]
    fn test_create_rejects_duplicate_and_alias_collision() {
        let (mut registry, _tmp) = test_registry();
        registry.create("Bob").unwrap();
        assert!(registry.create("Bob").is_err());
        assert!(registry.create("bob").is_err());

        registry
            .update("Bob", |p| {
                p.aliases.push("Robert".to_string());
                Ok(())
            })
            .unwrap();
        assert!(registry.create("Robert").is_err());
    }

    #[test]
    fn test_resolve_partial_and_ambiguous() {
        let (mut registry, _tmp) = test_registry();
        registry.create("Gandalf").unwrap();
        registry.create("Gimli").unwrap();

        assert_eq!(
            registry.resolve("gandalf"),
            NameMatch::Exact("Gandalf".to_string())
        );
        assert_eq!(
            registry.resolve("Gan"),
            NameMatch::Partial("Gandalf".to_string())
        );
        assert!(matches!(registry.resolve("G"), NameMatch::Ambiguous(_)));
        assert_eq!(registry.resolve("Frodo"), NameMatch::NotFound);
    }

    #[test]
    fn test_pause_expiry_on_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("personas.json");

        {
            let mut registry = PersonaRegistry::load(path.clone()).unwrap();
            registry.create("Bob").unwrap();
            registry
                .update("Bob", |p| {
                    p.is_paused = true;
                    p.pause_until = Some(Utc::now() - chrono::Duration::minutes(5));
                    Ok(())
                })
                .unwrap();
        }

        let registry = PersonaRegistry::load(path).unwrap();
        let bob = registry.get("Bob").unwrap();
        assert!(!bob.is_paused);
        assert!(bob.pause_until.is_none());
    }

    #[test]
    fn test_indefinite_pause_survives_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("personas.json");

        {
            let mut registry = PersonaRegistry::load(path.clone()).unwrap();
            registry.create("Bob").unwrap();
            registry
                .update("Bob", |p| {
                    p.is_paused = true;
                    p.pause_until = None;
                    Ok(())
                })
                .unwrap();
        }

        let registry = PersonaRegistry::load(path).unwrap();
        assert!(registry.get("Bob").unwrap().is_paused);
    }

    #[test]
    fn test_primary_description_is_locked() {
        let (mut registry, _tmp) = test_registry();
        registry
            .update(PRIMARY_PERSONA, |p| {
                p.short_description = "hacked".to_string();
                Ok(())
            })
            .unwrap();

        assert_ne!(
            registry.get(PRIMARY_PERSONA).unwrap().short_description,
            "hacked"
        );
    }
}
