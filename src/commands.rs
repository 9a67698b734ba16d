//! The slash-command surface.
//!
//! Parsing is strict: quoted arguments are single tokens and every command
//! validates its argument count before anything touches the engine.
//! Dispatch returns a status line; user errors never change state.

use anyhow::{bail, Result};
use std::sync::Arc;

use crate::engine::events::{emit, UiEvent};
use crate::engine::{heartbeat, Engine, EngineInner};
use crate::llm::gateway::resolve_model;
use crate::personas::{validate_persona_name, NameMatch, PRIMARY_PERSONA};
use crate::snapshot::{Snapshot, SnapshotManager};
use crate::ceremony;
use crate::visibility;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NickAction {
    List,
    Add(String),
    Remove(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelAction {
    Show,
    Set(String),
    Clear,
    List,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupAction {
    Show,
    Set(String),
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupsAction {
    List,
    Add(String),
    Remove(String),
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/persona` lists; `/persona <name>` switches (creating if new).
    Persona { name: Option<String> },
    Pause { spec: Option<String> },
    Resume,
    Archive { name: Option<String> },
    Unarchive { name: String },
    Nick(NickAction),
    Model(ModelAction),
    Group(GroupAction),
    Groups(GroupsAction),
    Status,
    New,
    Undo { steps: usize },
    SaveState { name: Option<String> },
    RestoreState { selector: Option<String> },
    Clarify { filter: Option<String> },
    Quit { force: bool },
}

/// Split a command line into tokens, treating double-quoted spans as
/// single tokens.
pub fn tokenize(input: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in input.chars() {
        match c {
            '"' => {
                if in_quotes {
                    tokens.push(std::mem::take(&mut current));
                }
                in_quotes = !in_quotes;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }

    if in_quotes {
        return Err("Unterminated quote".to_string());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn expect_args(tokens: &[String], min: usize, max: usize, usage: &str) -> Result<(), String> {
    let count = tokens.len() - 1;
    if count < min || count > max {
        return Err(format!("Usage: {}", usage));
    }
    Ok(())
}

/// Parse one slash-command line.
pub fn parse(line: &str) -> Result<Command, String> {
    let tokens = tokenize(line)?;
    let Some(head) = tokens.first() else {
        return Err("Empty command".to_string());
    };

    match head.to_lowercase().as_str() {
        "/persona" | "/p" => {
            expect_args(&tokens, 0, 1, "/persona [name]")?;
            Ok(Command::Persona {
                name: tokens.get(1).cloned(),
            })
        }
        "/pause" => {
            expect_args(&tokens, 0, 1, "/pause [NmNh | indefinite]")?;
            Ok(Command::Pause {
                spec: tokens.get(1).cloned(),
            })
        }
        "/resume" => {
            expect_args(&tokens, 0, 0, "/resume")?;
            Ok(Command::Resume)
        }
        "/archive" => {
            expect_args(&tokens, 0, 1, "/archive [name]")?;
            Ok(Command::Archive {
                name: tokens.get(1).cloned(),
            })
        }
        "/unarchive" => {
            expect_args(&tokens, 1, 1, "/unarchive <name>")?;
            Ok(Command::Unarchive {
                name: tokens[1].clone(),
            })
        }
        "/nick" => {
            expect_args(&tokens, 1, 2, "/nick {list | add <alias> | remove <alias>}")?;
            match tokens[1].to_lowercase().as_str() {
                "list" => Ok(Command::Nick(NickAction::List)),
                "add" => match tokens.get(2) {
                    Some(alias) => Ok(Command::Nick(NickAction::Add(alias.clone()))),
                    None => Err("Usage: /nick add <alias>".to_string()),
                },
                "remove" => match tokens.get(2) {
                    Some(alias) => Ok(Command::Nick(NickAction::Remove(alias.clone()))),
                    None => Err("Usage: /nick remove <alias>".to_string()),
                },
                _ => Err("Usage: /nick {list | add <alias> | remove <alias>}".to_string()),
            }
        }
        "/model" => {
            expect_args(&tokens, 0, 2, "/model {show | set <provider:model> | clear | list}")?;
            match tokens.get(1).map(|s| s.to_lowercase()).as_deref() {
                None | Some("show") => Ok(Command::Model(ModelAction::Show)),
                Some("set") => match tokens.get(2) {
                    Some(spec) => Ok(Command::Model(ModelAction::Set(spec.clone()))),
                    None => Err("Usage: /model set <provider:model>".to_string()),
                },
                Some("clear") => Ok(Command::Model(ModelAction::Clear)),
                Some("list") => Ok(Command::Model(ModelAction::List)),
                Some(_) => {
                    Err("Usage: /model {show | set <provider:model> | clear | list}".to_string())
                }
            }
        }
        "/group" | "/g" => {
            expect_args(&tokens, 0, 1, "/group {show | <name> | clear}")?;
            match tokens.get(1).map(|s| s.as_str()) {
                None | Some("show") => Ok(Command::Group(GroupAction::Show)),
                Some("clear") => Ok(Command::Group(GroupAction::Clear)),
                Some(name) => Ok(Command::Group(GroupAction::Set(name.to_string()))),
            }
        }
        "/groups" | "/gs" => {
            expect_args(&tokens, 0, 2, "/groups {list | <name> | remove <name> | clear}")?;
            match tokens.get(1).map(|s| s.as_str()) {
                None | Some("list") => Ok(Command::Groups(GroupsAction::List)),
                Some("clear") => Ok(Command::Groups(GroupsAction::Clear)),
                Some("remove") => match tokens.get(2) {
                    Some(name) => Ok(Command::Groups(GroupsAction::Remove(name.clone()))),
                    None => Err("Usage: /groups remove <name>".to_string()),
                },
                Some(name) => Ok(Command::Groups(GroupsAction::Add(name.to_string()))),
            }
        }
        "/status" | "/s" => {
            expect_args(&tokens, 0, 0, "/status")?;
            Ok(Command::Status)
        }
        "/new" => {
            expect_args(&tokens, 0, 0, "/new")?;
            Ok(Command::New)
        }
        "/undo" => {
            expect_args(&tokens, 0, 1, "/undo [n]")?;
            let steps = match tokens.get(1) {
                Some(n) => n
                    .parse::<usize>()
                    .map_err(|_| "Usage: /undo [n] (n must be a number)".to_string())?,
                None => 1,
            };
            if steps == 0 {
                return Err("Usage: /undo [n] (n must be at least 1)".to_string());
            }
            Ok(Command::Undo { steps })
        }
        "/savestate" => {
            expect_args(&tokens, 0, 1, "/saveState [name]")?;
            Ok(Command::SaveState {
                name: tokens.get(1).cloned(),
            })
        }
        "/restorestate" => {
            expect_args(&tokens, 0, 1, "/restoreState [name|#]")?;
            Ok(Command::RestoreState {
                selector: tokens.get(1).cloned(),
            })
        }
        "/clarify" => {
            expect_args(&tokens, 0, 1, "/clarify [category|\"<item>\"]")?;
            Ok(Command::Clarify {
                filter: tokens.get(1).cloned(),
            })
        }
        "/quit" => {
            expect_args(&tokens, 0, 1, "/quit [--force]")?;
            match tokens.get(1).map(|s| s.as_str()) {
                None => Ok(Command::Quit { force: false }),
                Some("--force") => Ok(Command::Quit { force: true }),
                Some(_) => Err("Usage: /quit [--force]".to_string()),
            }
        }
        other => Err(format!("Unknown command: {}", other)),
    }
}

impl Engine {
    /// Execute a parsed command, returning a status line. `Quit` is the
    /// host's job and must be handled before calling this.
    pub async fn execute(&self, command: Command) -> Result<String> {
        let inner = self.inner();
        match command {
            Command::Persona { name: None } => self.list_personas().await,
            Command::Persona { name: Some(name) } => self.switch_or_create(&name).await,
            Command::Pause { spec } => {
                let duration = parse_pause_spec(spec.as_deref())?;
                let focused = self.focused().await;
                inner.capture_snapshot("pause").await?;
                self.pause(&focused, duration).await
            }
            Command::Resume => {
                let focused = self.focused().await;
                self.resume(&focused).await
            }
            Command::Archive { name } => {
                let target = match name {
                    Some(name) => resolve_persona(&inner, &name).await?,
                    None => self.focused().await,
                };
                inner.capture_snapshot("archive").await?;
                self.archive(&target).await
            }
            Command::Unarchive { name } => {
                let target = resolve_persona(&inner, &name).await?;
                inner.capture_snapshot("unarchive").await?;
                self.unarchive(&target).await
            }
            Command::Nick(action) => self.nick(action).await,
            Command::Model(action) => self.model(action).await,
            Command::Group(action) => self.group(action).await,
            Command::Groups(action) => self.groups(action).await,
            Command::Status => self.status().await,
            Command::New => {
                inner.capture_snapshot("new context").await?;
                self.new_context().await
            }
            Command::Undo { steps } => self.undo(steps).await,
            Command::SaveState { name } => self.save_state(name).await,
            Command::RestoreState { selector } => self.restore_state(selector).await,
            Command::Clarify { filter } => {
                ceremony::run_manual(&inner, filter.as_deref()).await
            }
            Command::Quit { .. } => bail!("Quit must be handled by the host"),
        }
    }

    /// Personas visible to the focused persona's viewpoint, plus itself.
    async fn list_personas(&self) -> Result<String> {
        let inner = self.inner();
        let focused = self.focused().await;
        let records = inner.registry.lock().await.records();
        let viewer = records
            .iter()
            .find(|p| p.name == focused)
            .cloned()
            .unwrap_or_else(|| records[0].clone());

        let mut lines = vec![format!("* {} (you are here)", viewer.name)];
        for peer in visibility::visible_personas(&viewer, &records) {
            let mut line = format!("  {}", peer.name);
            if peer.is_archived {
                line.push_str(" [archived]");
            }
            if peer.is_paused {
                line.push_str(" [paused]");
            }
            if !peer.short_description.is_empty() {
                line.push_str(&format!(" — {}", peer.short_description));
            }
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }

    async fn switch_or_create(&self, input: &str) -> Result<String> {
        let inner = self.inner();
        let resolved = { inner.registry.lock().await.resolve(input) };
        match resolved {
            NameMatch::Exact(name) | NameMatch::Partial(name) => self.switch(&name).await,
            NameMatch::Ambiguous(matches) => {
                bail!("Ambiguous persona '{}': {}", input, matches.join(", "))
            }
            NameMatch::NotFound => {
                validate_persona_name(input).map_err(|e| anyhow::anyhow!(e))?;
                inner.capture_snapshot("persona create").await?;
                inner.registry.lock().await.create(input)?;
                let status = self.switch(input).await?;
                Ok(format!("Created persona '{}'. {}", input, status))
            }
        }
    }

    async fn nick(&self, action: NickAction) -> Result<String> {
        let inner = self.inner();
        let focused = self.focused().await;
        match action {
            NickAction::List => {
                let record = inner.persona(&focused).await?;
                Ok(if record.aliases.is_empty() {
                    format!("'{}' has no aliases", focused)
                } else {
                    format!("Aliases for '{}': {}", focused, record.aliases.join(", "))
                })
            }
            NickAction::Add(alias) => {
                inner.capture_snapshot("nick change").await?;
                inner.registry.lock().await.update(&focused, |p| {
                    if p.answers_to(&alias) {
                        anyhow::bail!("'{}' already answers to that", p.name);
                    }
                    p.aliases.push(alias.clone());
                    Ok(())
                })?;
                Ok(format!("'{}' now also answers to '{}'", focused, alias))
            }
            NickAction::Remove(alias) => {
                inner.capture_snapshot("nick change").await?;
                inner.registry.lock().await.update(&focused, |p| {
                    let before = p.aliases.len();
                    p.aliases.retain(|a| !a.eq_ignore_ascii_case(&alias));
                    if p.aliases.len() == before {
                        anyhow::bail!("No such alias: {}", alias);
                    }
                    Ok(())
                })?;
                Ok(format!("Removed alias '{}'", alias))
            }
        }
    }

    async fn model(&self, action: ModelAction) -> Result<String> {
        let inner = self.inner();
        let focused = self.focused().await;
        match action {
            ModelAction::Show => {
                let record = inner.persona(&focused).await?;
                Ok(match record.model {
                    Some(model) => format!("'{}' uses {}", focused, model),
                    None => format!(
                        "'{}' uses the default ({})",
                        focused,
                        inner.config.model_for(crate::llm::Operation::Response)
                    ),
                })
            }
            ModelAction::Set(spec) => {
                resolve_model(&spec).map_err(|e| anyhow::anyhow!(e.to_string()))?;
                inner.capture_snapshot("model change").await?;
                inner.registry.lock().await.update(&focused, |p| {
                    p.model = Some(spec.clone());
                    Ok(())
                })?;
                Ok(format!("'{}' now uses {}", focused, spec))
            }
            ModelAction::Clear => {
                inner.capture_snapshot("model change").await?;
                inner.registry.lock().await.update(&focused, |p| {
                    p.model = None;
                    Ok(())
                })?;
                Ok(format!("'{}' back to the default model", focused))
            }
            ModelAction::List => {
                let statuses = inner.llm.provider_statuses();
                let lines: Vec<String> = statuses
                    .iter()
                    .map(|s| {
                        format!(
                            "{:<10} {} {}",
                            s.provider,
                            if s.configured { "configured" } else { "not configured" },
                            if s.validated { "(validated this session)" } else { "" }
                        )
                    })
                    .collect();
                Ok(lines.join("\n"))
            }
        }
    }

    async fn group(&self, action: GroupAction) -> Result<String> {
        let inner = self.inner();
        let focused = self.focused().await;
        match action {
            GroupAction::Show => {
                let record = inner.persona(&focused).await?;
                Ok(match record.group_primary {
                    Some(group) => format!("'{}' writes to group '{}'", focused, group),
                    None => format!("'{}' has no primary group (writes globally)", focused),
                })
            }
            GroupAction::Set(group) => {
                inner.capture_snapshot("group change").await?;
                inner.registry.lock().await.update(&focused, |p| {
                    p.group_primary = Some(group.clone());
                    Ok(())
                })?;
                Ok(format!("'{}' primary group set to '{}'", focused, group))
            }
            GroupAction::Clear => {
                inner.capture_snapshot("group change").await?;
                inner.registry.lock().await.update(&focused, |p| {
                    p.group_primary = None;
                    Ok(())
                })?;
                Ok(format!("'{}' primary group cleared", focused))
            }
        }
    }

    async fn groups(&self, action: GroupsAction) -> Result<String> {
        let inner = self.inner();
        let focused = self.focused().await;
        if focused == PRIMARY_PERSONA && !matches!(action, GroupsAction::List) {
            bail!("The primary persona always sees every group");
        }
        match action {
            GroupsAction::List => {
                let record = inner.persona(&focused).await?;
                Ok(if record.groups_visible.is_empty() {
                    format!("'{}' sees no extra groups", focused)
                } else {
                    format!(
                        "'{}' sees: {}",
                        focused,
                        record
                            .groups_visible
                            .iter()
                            .cloned()
                            .collect::<Vec<_>>()
                            .join(", ")
                    )
                })
            }
            GroupsAction::Add(group) => {
                inner.capture_snapshot("group change").await?;
                inner.registry.lock().await.update(&focused, |p| {
                    p.groups_visible.insert(group.clone());
                    Ok(())
                })?;
                Ok(format!("'{}' can now see group '{}'", focused, group))
            }
            GroupsAction::Remove(group) => {
                inner.capture_snapshot("group change").await?;
                inner.registry.lock().await.update(&focused, |p| {
                    if !p.groups_visible.remove(&group) {
                        anyhow::bail!("'{}' does not see group '{}'", p.name, group);
                    }
                    Ok(())
                })?;
                Ok(format!("'{}' no longer sees group '{}'", focused, group))
            }
            GroupsAction::Clear => {
                inner.capture_snapshot("group change").await?;
                inner.registry.lock().await.update(&focused, |p| {
                    p.groups_visible.clear();
                    Ok(())
                })?;
                Ok(format!("'{}' extra groups cleared", focused))
            }
        }
    }

    async fn undo(&self, steps: usize) -> Result<String> {
        let inner = self.inner();
        let snapshot = { inner.snapshots.lock().await.undo(steps) };
        match snapshot {
            None => Ok("No undo history".to_string()),
            Some(snapshot) => {
                let action = snapshot.action.clone();
                restore_snapshot(&inner, snapshot).await?;
                let remaining = inner.snapshots.lock().await.ring_len();
                Ok(format!(
                    "Undid '{}' ({} snapshot(s) remain)",
                    action, remaining
                ))
            }
        }
    }

    async fn save_state(&self, name: Option<String>) -> Result<String> {
        let inner = self.inner();
        let personas = inner.registry.lock().await.records();
        let snapshot = SnapshotManager::capture(&inner.db, personas, "manual save").await?;
        let info = inner.snapshots.lock().await.save_to_disk(snapshot, name)?;
        Ok(match info.name {
            Some(name) => format!("Saved state '{}' ({})", name, info.id),
            None => format!("Saved state {}", info.id),
        })
    }

    async fn restore_state(&self, selector: Option<String>) -> Result<String> {
        let inner = self.inner();
        match selector {
            None => {
                let saved = inner.snapshots.lock().await.list_saved()?;
                if saved.is_empty() {
                    return Ok("No saved states".to_string());
                }
                let lines: Vec<String> = saved
                    .iter()
                    .enumerate()
                    .map(|(i, s)| {
                        format!(
                            "{}. {} [{}] {}",
                            i + 1,
                            s.name.as_deref().unwrap_or("(unnamed)"),
                            s.timestamp.format("%Y-%m-%d %H:%M"),
                            s.id
                        )
                    })
                    .collect();
                Ok(lines.join("\n"))
            }
            Some(selector) => {
                // The pre-restore state goes onto the undo ring first.
                inner.capture_snapshot("restore").await?;
                let snapshot = { inner.snapshots.lock().await.load_saved(&selector)? };
                restore_snapshot(&inner, snapshot).await?;
                Ok(format!("Restored state '{}'", selector))
            }
        }
    }
}

/// Replace the world with a snapshot: abort everything in flight, rewrite
/// the documents, reload the registry, re-arm the focused heartbeat.
async fn restore_snapshot(inner: &Arc<EngineInner>, snapshot: Snapshot) -> Result<()> {
    inner.worker.pause();

    {
        let mut runtimes = inner.runtimes.lock().await;
        for (_, rt) in runtimes.iter_mut() {
            rt.teardown();
        }
        runtimes.clear();
    }

    let result = SnapshotManager::restore(&inner.db, &snapshot.payload).await;
    if result.is_ok() {
        inner
            .registry
            .lock()
            .await
            .replace_all(snapshot.payload.personas.clone())?;
    }
    inner.worker.resume();
    result?;

    // If the restored world no longer has the focused persona, fall back
    // to the primary one.
    let focused = {
        let registry = inner.registry.lock().await;
        let mut focused = inner.focused.lock().await;
        if registry.get(&focused).is_none() {
            *focused = PRIMARY_PERSONA.to_string();
        }
        focused.clone()
    };
    heartbeat::reset(inner, &focused).await;

    emit(&inner.events, UiEvent::Render { persona: focused });
    Ok(())
}

async fn resolve_persona(inner: &Arc<EngineInner>, input: &str) -> Result<String> {
    let resolved = inner.registry.lock().await.resolve(input);
    match resolved {
        NameMatch::Exact(name) | NameMatch::Partial(name) => Ok(name),
        NameMatch::Ambiguous(matches) => {
            bail!("Ambiguous persona '{}': {}", input, matches.join(", "))
        }
        NameMatch::NotFound => bail!("Unknown persona: {}", input),
    }
}

/// Parse `/pause` durations: `30m`, `2h`, `1h30m`, or `indefinite`.
/// `None` input defaults to indefinite.
pub fn parse_pause_spec(spec: Option<&str>) -> Result<Option<chrono::Duration>> {
    let Some(spec) = spec else {
        return Ok(None);
    };
    if spec.eq_ignore_ascii_case("indefinite") {
        return Ok(None);
    }

    let mut total_minutes: i64 = 0;
    let mut digits = String::new();
    let mut matched = false;

    for c in spec.chars() {
        match c {
            '0'..='9' => digits.push(c),
            'h' | 'H' => {
                if digits.is_empty() {
                    bail!("Invalid pause duration: {}", spec);
                }
                total_minutes += digits.parse::<i64>()? * 60;
                digits.clear();
                matched = true;
            }
            'm' | 'M' => {
                if digits.is_empty() {
                    bail!("Invalid pause duration: {}", spec);
                }
                total_minutes += digits.parse::<i64>()?;
                digits.clear();
                matched = true;
            }
            _ => bail!("Invalid pause duration: {}", spec),
        }
    }

    if !digits.is_empty() || !matched || total_minutes <= 0 {
        bail!("Invalid pause duration: {} (try 30m, 2h, or indefinite)", spec);
    }

    Ok(Some(chrono::Duration::minutes(total_minutes)))
}
