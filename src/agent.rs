//! Agent kinds and their durable records

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A capability role a task is routed to
///
/// The hub never interprets a kind; it only uses it to pick a worker slot and
/// an [`AgentRecord`]. Kinds outside the built-in set travel as [`AgentKind::Custom`]
/// and must be registered through `HubConfig::extra_kinds`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AgentKind {
    Architect,
    Database,
    Backend,
    Frontend,
    Mobile,
    Design,
    Deployment,
    Generic,
    Custom(CustomKind),
}

/// Name of a kind outside the built-in set
///
/// Only built by [`AgentKind::from`], which lowercases the name and maps
/// built-in names to their own variants, so one name is always one kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CustomKind(String);

impl CustomKind {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AgentKind {
    /// All kinds known at compile time
    pub const BUILTIN: [AgentKind; 8] = [
        AgentKind::Architect,
        AgentKind::Database,
        AgentKind::Backend,
        AgentKind::Frontend,
        AgentKind::Mobile,
        AgentKind::Design,
        AgentKind::Deployment,
        AgentKind::Generic,
    ];

    /// Wire name of this kind
    pub fn as_str(&self) -> &str {
        match self {
            AgentKind::Architect => "architect",
            AgentKind::Database => "database",
            AgentKind::Backend => "backend",
            AgentKind::Frontend => "frontend",
            AgentKind::Mobile => "mobile",
            AgentKind::Design => "design",
            AgentKind::Deployment => "deployment",
            AgentKind::Generic => "generic",
            AgentKind::Custom(name) => name.as_str(),
        }
    }

    /// Whether `name` can key a record on disk
    ///
    /// Non-empty, no path separators, no `..`.
    pub fn is_valid_name(name: &str) -> bool {
        !name.is_empty()
            && name != "."
            && !name.contains("..")
            && !name.contains(|c: char| matches!(c, '/' | '\\' | '\0'))
    }

    /// Whether this kind is one of the built-in roles
    pub fn is_builtin(&self) -> bool {
        !matches!(self, AgentKind::Custom(_))
    }
}

impl From<String> for AgentKind {
    fn from(name: String) -> Self {
        let name = name.trim().to_ascii_lowercase();
        let builtin = AgentKind::BUILTIN
            .into_iter()
            .find(|kind| kind.as_str() == name);
        builtin.unwrap_or_else(|| AgentKind::Custom(CustomKind(name)))
    }
}

impl From<&str> for AgentKind {
    fn from(name: &str) -> Self {
        AgentKind::from(name.to_string())
    }
}

impl From<AgentKind> for String {
    fn from(kind: AgentKind) -> Self {
        match kind {
            AgentKind::Custom(name) => name.0,
            other => other.as_str().to_string(),
        }
    }
}

impl FromStr for AgentKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(AgentKind::from(s))
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an agent kind, as last written by the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Running,
    Blocked,
    Failed,
    Done,
}

/// Durable per-kind memory
///
/// The hub owns `status` and `current_task_id`; the worker owns `notes`.
/// Records are created on first reference and never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub kind: AgentKind,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub notes: String,
    pub last_updated: DateTime<Utc>,
}

impl AgentRecord {
    /// Fresh idle record for a kind
    pub fn new(kind: AgentKind) -> Self {
        Self {
            kind,
            status: AgentStatus::Idle,
            current_task_id: None,
            notes: String::new(),
            last_updated: Utc::now(),
        }
    }

    /// Stamp the record as modified now
    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    /// Whether some task of this kind is currently in flight
    pub fn is_busy(&self) -> bool {
        self.status == AgentStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_name() {
        assert_eq!(AgentKind::from("database"), AgentKind::Database);
        assert_eq!(AgentKind::from("Backend"), AgentKind::Backend);
        assert_eq!(AgentKind::from("qa").as_str(), "qa");
        assert!(!AgentKind::from("qa").is_builtin());
    }

    #[test]
    fn test_kind_names_normalize() {
        assert_eq!(AgentKind::from("QA"), AgentKind::from("qa"));
        assert_eq!(AgentKind::from(" Security "), AgentKind::from("security"));
        for kind in AgentKind::BUILTIN {
            let shouted = AgentKind::from(kind.as_str().to_ascii_uppercase());
            assert_eq!(shouted, kind);
            assert!(shouted.is_builtin());
        }
    }

    #[test]
    fn test_valid_names() {
        assert!(AgentKind::is_valid_name("security"));
        assert!(AgentKind::is_valid_name("qa-team"));
        for name in ["", ".", "..", "../escaped", "a/b", "a\\b", "x..y"] {
            assert!(!AgentKind::is_valid_name(name), "{name:?} accepted");
        }
    }

    #[test]
    fn test_kind_serde_as_string() {
        let json = serde_json::to_string(&AgentKind::Frontend).unwrap();
        assert_eq!(json, r#""frontend""#);

        let kind: AgentKind = serde_json::from_str(r#""security""#).unwrap();
        assert_eq!(kind, AgentKind::from("security"));
        assert_eq!(kind.as_str(), "security");
        assert!(!kind.is_builtin());
    }

    #[test]
    fn test_builtin_names_round_trip() {
        for kind in AgentKind::BUILTIN {
            assert_eq!(AgentKind::from(kind.to_string()), kind);
        }
    }

    #[test]
    fn test_new_record_is_idle() {
        let record = AgentRecord::new(AgentKind::Mobile);
        assert_eq!(record.status, AgentStatus::Idle);
        assert!(record.current_task_id.is_none());
        assert!(record.notes.is_empty());
        assert!(!record.is_busy());
    }
}
