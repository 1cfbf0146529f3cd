//! Batch commands, their validation, and the temp-id dependency graph.
//!
//! A command may name an entity created earlier in the same batch by its
//! `temp_id`. Such references are found by scanning `args` for string values
//! equal to a batch temp id; each one is an edge from the producing command to
//! the consuming one. [`DependencyGraph::stages`] orders the commands into
//! levels so that every producer is submitted in an earlier level than its
//! consumers. A cycle rejects the batch.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ValidationError;

/// Largest batch the upstream accepts in one request.
pub const MAX_BATCH_SIZE: usize = 100;

macro_rules! command_kinds {
    ($($variant:ident => $wire:literal, $alias:literal, $create:literal;)+) => {
        /// The closed set of mutations a batch may contain.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "&'static str")]
        pub enum CommandKind {
            $($variant,)+
        }

        impl CommandKind {
            pub const ALL: &'static [CommandKind] = &[$(CommandKind::$variant,)+];

            /// Name used on the wire.
            pub fn wire_name(self) -> &'static str {
                match self {
                    $(CommandKind::$variant => $wire,)+
                }
            }

            /// Descriptive name accepted from callers, e.g. `create-task`.
            pub fn alias(self) -> &'static str {
                match self {
                    $(CommandKind::$variant => $alias,)+
                }
            }

            /// Whether the command creates an entity, and so may carry a
            /// `temp_id`.
            pub fn is_create(self) -> bool {
                match self {
                    $(CommandKind::$variant => $create,)+
                }
            }
        }
    };
}

command_kinds! {
    ItemAdd => "item_add", "create-task", true;
    ItemUpdate => "item_update", "update-task", false;
    ItemDelete => "item_delete", "delete-task", false;
    ItemClose => "item_close", "complete-task", false;
    ItemUncomplete => "item_uncomplete", "uncomplete-task", false;
    ItemMove => "item_move", "move-task", false;
    ProjectAdd => "project_add", "create-project", true;
    SectionAdd => "section_add", "create-section", true;
    LabelAdd => "label_add", "create-label", true;
    NoteAdd => "note_add", "create-comment", true;
    FilterAdd => "filter_add", "create-filter", true;
    ReminderAdd => "reminder_add", "create-reminder", true;
    ReminderUpdate => "reminder_update", "update-reminder", false;
    ReminderDelete => "reminder_delete", "delete-reminder", false;
    SharedLabelRename => "shared_label_rename", "rename-shared-label", false;
    SharedLabelRemove => "shared_label_remove", "remove-shared-label", false;
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command type `{0}`")]
pub struct UnknownCommandKind(pub String);

impl FromStr for CommandKind {
    type Err = UnknownCommandKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandKind::ALL
            .iter()
            .copied()
            .find(|k| k.wire_name() == s || k.alias() == s)
            .ok_or_else(|| UnknownCommandKind(s.to_string()))
    }
}

impl TryFrom<String> for CommandKind {
    type Error = UnknownCommandKind;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CommandKind> for &'static str {
    fn from(kind: CommandKind) -> Self {
        kind.wire_name()
    }
}

/// One mutation directive within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    #[serde(alias = "uuid")]
    pub correlation_id: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl Command {
    /// A command with a fresh random correlation id.
    ///
    /// `args` is meant to be a JSON object. Any other value (`null`, an
    /// array, a scalar) carries no named arguments, so the command is built
    /// with empty `args`. Untrusted input goes through [`parse_commands`],
    /// which rejects non-object `args` instead.
    pub fn new(kind: CommandKind, args: Value) -> Self {
        let args = match args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                tracing::warn!(%kind, args = %other, "non-object args dropped");
                Map::new()
            }
        };
        Self {
            kind,
            temp_id: None,
            correlation_id: Uuid::new_v4().to_string(),
            args,
        }
    }

    #[must_use]
    pub fn with_temp_id(mut self, temp_id: impl Into<String>) -> Self {
        self.temp_id = Some(temp_id.into());
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// A copy whose `args` have every mapped temp id replaced by its real id.
    pub fn resolved(&self, mapping: &HashMap<String, String>) -> Command {
        let mut resolved = self.clone();
        for value in resolved.args.values_mut() {
            substitute(value, mapping);
        }
        resolved
    }
}

fn substitute(value: &mut Value, mapping: &HashMap<String, String>) {
    match value {
        Value::String(s) => {
            if let Some(real) = mapping.get(s.as_str()) {
                *s = real.clone();
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| substitute(v, mapping)),
        Value::Object(map) => map.values_mut().for_each(|v| substitute(v, mapping)),
        _ => {}
    }
}

/// Parses tool-handler JSON into commands.
///
/// An unknown `type` is reported with its position instead of as a generic
/// deserialization failure.
pub fn parse_commands(value: &Value) -> Result<Vec<Command>, ValidationError> {
    let items = value.as_array().ok_or(ValidationError::NotAList)?;
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let kind = item
                .get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| ValidationError::MalformedCommand {
                    index,
                    reason: "missing string field `type`".to_string(),
                })?;
            if kind.parse::<CommandKind>().is_err() {
                return Err(ValidationError::UnknownCommandType {
                    index,
                    kind: kind.to_string(),
                });
            }
            serde_json::from_value(item.clone()).map_err(|e| ValidationError::MalformedCommand {
                index,
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Structural checks run before anything is sent upstream.
pub fn validate_batch(commands: &[Command], max_batch_size: usize) -> Result<(), ValidationError> {
    if commands.is_empty() {
        return Err(ValidationError::EmptyBatch);
    }
    if commands.len() > max_batch_size {
        return Err(ValidationError::BatchTooLarge {
            len: commands.len(),
            max: max_batch_size,
        });
    }

    let mut correlation_ids = HashSet::new();
    let mut temp_ids = HashSet::new();
    for (index, command) in commands.iter().enumerate() {
        if command.correlation_id.trim().is_empty() {
            return Err(ValidationError::MissingCorrelationId { index });
        }
        if !correlation_ids.insert(command.correlation_id.as_str()) {
            return Err(ValidationError::DuplicateCorrelationId {
                index,
                correlation_id: command.correlation_id.clone(),
            });
        }
        if let Some(temp_id) = &command.temp_id {
            if temp_id.trim().is_empty() {
                return Err(ValidationError::EmptyTempId { index });
            }
            if !command.kind.is_create() {
                return Err(ValidationError::TempIdOnNonCreate {
                    index,
                    kind: command.kind,
                });
            }
            if !temp_ids.insert(temp_id.as_str()) {
                return Err(ValidationError::DuplicateTempId {
                    index,
                    temp_id: temp_id.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Producer edges between the commands of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    /// `producers[i]` are the commands whose temp ids command `i` references,
    /// ascending.
    producers: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Builds the graph. Expects temp ids to be unique (see
    /// [`validate_batch`]).
    pub fn build(commands: &[Command]) -> Self {
        let owners: HashMap<&str, usize> = commands
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.temp_id.as_deref().map(|t| (t, i)))
            .collect();

        let producers = commands
            .iter()
            .map(|command| {
                let mut found = BTreeSet::new();
                for value in command.args.values() {
                    collect_refs(value, &owners, &mut found);
                }
                found.into_iter().collect()
            })
            .collect();
        Self { producers }
    }

    pub fn producers_of(&self, index: usize) -> &[usize] {
        &self.producers[index]
    }

    /// Groups command indices into submission levels.
    ///
    /// Level 0 holds commands with no references; level `n` holds commands
    /// whose producers all sit in levels below `n`. Indices within a level
    /// keep submission order.
    pub fn stages(&self) -> Result<Vec<Vec<usize>>, ValidationError> {
        let n = self.producers.len();
        let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut pending: Vec<usize> = vec![0; n];
        for (consumer, producers) in self.producers.iter().enumerate() {
            pending[consumer] = producers.len();
            for &producer in producers {
                consumers[producer].push(consumer);
            }
        }

        let mut stages = Vec::new();
        let mut current: Vec<usize> = (0..n).filter(|&i| pending[i] == 0).collect();
        let mut placed = 0;
        while !current.is_empty() {
            placed += current.len();
            let mut next = Vec::new();
            for &producer in &current {
                for &consumer in &consumers[producer] {
                    pending[consumer] -= 1;
                    if pending[consumer] == 0 {
                        next.push(consumer);
                    }
                }
            }
            next.sort_unstable();
            stages.push(current);
            current = next;
        }

        if placed < n {
            let indices = (0..n).filter(|&i| pending[i] > 0).collect();
            return Err(ValidationError::DependencyCycle { indices });
        }
        Ok(stages)
    }
}

fn collect_refs(value: &Value, owners: &HashMap<&str, usize>, found: &mut BTreeSet<usize>) {
    match value {
        Value::String(s) => {
            if let Some(&owner) = owners.get(s.as_str()) {
                found.insert(owner);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_refs(v, owners, found)),
        Value::Object(map) => map.values().for_each(|v| collect_refs(v, owners, found)),
        _ => {}
    }
}
