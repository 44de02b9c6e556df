//! Delegation requests and their JSON wire format
//!
//! A worker asks the hub for help with a [`DelegationRequest`]. On the wire a
//! request takes one of two shapes:
//!
//! ```text
//! single:    {"type": "single", "agent": "backend", "reason": "...", "prompt": "...", "blocking": true}
//! compound:  {"type": "sequential" | "parallel",
//!             "agents": [{"agent": "database", "prompt": "...", "depends_on": "..."}],
//!             "parallel_groups": [["frontend", "mobile"]],
//!             "return_to": "architect"}
//! ```
//!
//! A single request may also name its agent directly in `type`
//! (`{"type": "database", "prompt": "..."}`). Serializing a request always
//! produces the canonical form, which parses back to an equal value.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::AgentKind;
use crate::error::WireError;

/// How the tasks of a request relate to one another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationMode {
    Single,
    Sequential,
    Parallel,
}

/// One unit of delegated work
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub id: String,
    pub agent: AgentKind,
    pub prompt: String,
    pub depends_on: Vec<String>,
    pub parallel_group: Option<String>,
    pub reason: Option<String>,
    /// Whole milliseconds, the wire's resolution
    pub timeout: Option<Duration>,
}

impl TaskSpec {
    /// Task whose id is the agent name
    pub fn new(agent: impl Into<AgentKind>, prompt: impl Into<String>) -> Self {
        let agent = agent.into();
        Self {
            id: agent.to_string(),
            agent,
            prompt: prompt.into(),
            depends_on: Vec::new(),
            parallel_group: None,
            reason: None,
            timeout: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.parallel_group = Some(group.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Deadline for the task, rounded up to whole milliseconds
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(Duration::from_millis(whole_millis(timeout)));
        self
    }
}

/// Milliseconds covering `duration`, rounded up and saturating at `u64::MAX`
pub(crate) fn whole_millis(duration: Duration) -> u64 {
    let partial = duration.subsec_nanos() % 1_000_000 != 0;
    let millis = duration.as_millis() + u128::from(partial);
    u64::try_from(millis).unwrap_or(u64::MAX)
}

/// A structured ask from one agent for other agents' work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireRequest", into = "WireRequest")]
pub struct DelegationRequest {
    /// Who is asking; `None` for an external caller
    pub requesting_agent: Option<AgentKind>,
    pub mode: DelegationMode,
    pub tasks: Vec<TaskSpec>,
    /// Who receives the aggregated result; `None` returns it to the caller
    pub return_to: Option<AgentKind>,
    /// Whether the requester waits for the result
    pub blocking: bool,
    /// Nesting depth of the invocation that issued this request
    pub depth: u32,
    /// Kinds of the invocations waiting on this request, outermost first
    pub lineage: Vec<AgentKind>,
}

impl DelegationRequest {
    fn with_mode(mode: DelegationMode, tasks: Vec<TaskSpec>) -> Self {
        Self {
            requesting_agent: None,
            mode,
            tasks,
            return_to: None,
            blocking: true,
            depth: 0,
            lineage: Vec::new(),
        }
    }

    pub fn single(task: TaskSpec) -> Self {
        Self::with_mode(DelegationMode::Single, vec![task])
    }

    pub fn sequential(tasks: Vec<TaskSpec>) -> Self {
        Self::with_mode(DelegationMode::Sequential, tasks)
    }

    pub fn parallel(tasks: Vec<TaskSpec>) -> Self {
        Self::with_mode(DelegationMode::Parallel, tasks)
    }

    pub fn from_agent(mut self, kind: AgentKind) -> Self {
        self.requesting_agent = Some(kind);
        self
    }

    pub fn return_to(mut self, kind: AgentKind) -> Self {
        self.return_to = Some(kind);
        self
    }

    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }

    pub fn at_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    /// Record the chain of invocations this request is issued from
    pub fn within(mut self, lineage: Vec<AgentKind>) -> Self {
        self.lineage = lineage;
        self
    }

    /// Parse a JSON payload
    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    /// Canonical JSON form
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// `depends_on` accepts a single id or a list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(id) => vec![id],
            OneOrMany::Many(ids) => ids,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireTask {
    agent: AgentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default)]
    prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    depends_on: Option<OneOrMany>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parallel_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireRequest {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    agent: Option<AgentKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    agents: Vec<WireTask>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    parallel_groups: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<AgentKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    return_to: Option<AgentKind>,
    #[serde(default = "default_blocking")]
    blocking: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    depth: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    lineage: Vec<AgentKind>,
}

fn default_blocking() -> bool {
    true
}

fn is_zero(depth: &u32) -> bool {
    *depth == 0
}

/// Agent name, suffixed until it is unused
fn default_task_id(agent: &AgentKind, taken: &HashSet<String>) -> String {
    let base = agent.to_string();
    if !taken.contains(&base) {
        return base;
    }
    (2..)
        .map(|n| format!("{base}-{n}"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or(base)
}

impl TryFrom<WireRequest> for DelegationRequest {
    type Error = WireError;

    fn try_from(wire: WireRequest) -> Result<Self, Self::Error> {
        let mode = match (wire.kind.as_deref(), wire.agents.is_empty()) {
            (Some("sequential"), _) => DelegationMode::Sequential,
            (Some("parallel"), _) => DelegationMode::Parallel,
            (Some("single"), _) => DelegationMode::Single,
            // `type` carries the agent name, or is omitted for a single ask
            (_, true) => DelegationMode::Single,
            (Some(other), false) => return Err(WireError::UnknownType(other.to_string())),
            (None, false) => return Err(WireError::MissingField("type")),
        };

        let tasks = if mode == DelegationMode::Single && wire.agents.is_empty() {
            let agent = wire
                .agent
                .clone()
                .or_else(|| wire.kind.clone().filter(|k| k != "single").map(AgentKind::from))
                .ok_or(WireError::MissingField("agent"))?;
            let prompt = wire.prompt.clone().ok_or(WireError::MissingField("prompt"))?;
            let mut task = TaskSpec::new(agent, prompt);
            if let Some(id) = wire.id.clone() {
                task.id = id;
            }
            task.reason = wire.reason.clone();
            task.timeout = wire.timeout_ms.map(Duration::from_millis);
            vec![task]
        } else {
            let mut taken = HashSet::new();
            let mut tasks = Vec::with_capacity(wire.agents.len());
            for entry in wire.agents {
                let id = entry
                    .id
                    .unwrap_or_else(|| default_task_id(&entry.agent, &taken));
                taken.insert(id.clone());
                tasks.push(TaskSpec {
                    id,
                    agent: entry.agent,
                    prompt: entry.prompt,
                    depends_on: entry.depends_on.map(OneOrMany::into_vec).unwrap_or_default(),
                    parallel_group: entry.parallel_group,
                    reason: entry.reason,
                    timeout: entry.timeout_ms.map(Duration::from_millis),
                });
            }
            tasks
        };

        let mut tasks = tasks;
        assign_parallel_groups(&mut tasks, &wire.parallel_groups)?;

        Ok(DelegationRequest {
            requesting_agent: wire.from,
            mode,
            tasks,
            return_to: wire.return_to,
            blocking: wire.blocking,
            depth: wire.depth,
            lineage: wire.lineage,
        })
    }
}

/// Fold top-level `parallel_groups` into per-task group ids
fn assign_parallel_groups(tasks: &mut [TaskSpec], groups: &[Vec<String>]) -> Result<(), WireError> {
    if groups.is_empty() {
        return Ok(());
    }
    let index: HashMap<String, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.clone(), i))
        .collect();

    for (n, members) in groups.iter().enumerate() {
        let group = format!("group-{n}");
        for member in members {
            let &i = index
                .get(member)
                .ok_or_else(|| WireError::UnknownGroupMember(member.clone()))?;
            match &tasks[i].parallel_group {
                Some(existing) if *existing != group => {
                    return Err(WireError::ConflictingGroup(member.clone()));
                }
                _ => tasks[i].parallel_group = Some(group.clone()),
            }
        }
    }
    Ok(())
}

impl From<DelegationRequest> for WireRequest {
    fn from(request: DelegationRequest) -> Self {
        let mut wire = WireRequest {
            kind: None,
            agent: None,
            id: None,
            reason: None,
            prompt: None,
            timeout_ms: None,
            agents: Vec::new(),
            parallel_groups: Vec::new(),
            from: request.requesting_agent,
            return_to: request.return_to,
            blocking: request.blocking,
            depth: request.depth,
            lineage: request.lineage,
        };

        let timeout_ms = |t: Option<Duration>| t.map(whole_millis);

        match (request.mode, request.tasks.as_slice()) {
            (DelegationMode::Single, [task])
                if task.depends_on.is_empty() && task.parallel_group.is_none() =>
            {
                wire.kind = Some("single".into());
                wire.id = (task.id != task.agent.as_str()).then(|| task.id.clone());
                wire.agent = Some(task.agent.clone());
                wire.reason = task.reason.clone();
                wire.prompt = Some(task.prompt.clone());
                wire.timeout_ms = timeout_ms(task.timeout);
            }
            (mode, tasks) => {
                let name = match mode {
                    DelegationMode::Single => "single",
                    DelegationMode::Sequential => "sequential",
                    DelegationMode::Parallel => "parallel",
                };
                wire.kind = Some(name.into());
                wire.agents = tasks
                    .iter()
                    .map(|task| WireTask {
                        agent: task.agent.clone(),
                        id: Some(task.id.clone()),
                        prompt: task.prompt.clone(),
                        reason: task.reason.clone(),
                        depends_on: (!task.depends_on.is_empty())
                            .then(|| OneOrMany::Many(task.depends_on.clone())),
                        parallel_group: task.parallel_group.clone(),
                        timeout_ms: timeout_ms(task.timeout),
                    })
                    .collect();
            }
        }

        wire
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_request() {
        let request = DelegationRequest::from_json(
            r#"{"agent": "backend", "reason": "need auth", "prompt": "create endpoints", "blocking": false}"#,
        )
        .unwrap();

        assert_eq!(request.mode, DelegationMode::Single);
        assert!(!request.blocking);
        assert_eq!(request.tasks.len(), 1);
        assert_eq!(request.tasks[0].id, "backend");
        assert_eq!(request.tasks[0].agent, AgentKind::Backend);
        assert_eq!(request.tasks[0].reason.as_deref(), Some("need auth"));
    }

    #[test]
    fn test_parse_single_with_agent_in_type() {
        let request =
            DelegationRequest::from_json(r#"{"type": "database", "prompt": "add index"}"#).unwrap();
        assert_eq!(request.mode, DelegationMode::Single);
        assert_eq!(request.tasks[0].agent, AgentKind::Database);
        assert!(request.blocking);
    }

    #[test]
    fn test_parse_single_missing_prompt() {
        let err = DelegationRequest::from_json(r#"{"agent": "backend"}"#).unwrap_err();
        assert!(err.to_string().contains("prompt"));
    }

    #[test]
    fn test_parse_sequential_request() {
        let request = DelegationRequest::from_json(
            r#"{
                "type": "sequential",
                "agents": [
                    {"agent": "database", "prompt": "create users table"},
                    {"agent": "backend", "prompt": "create auth endpoints", "depends_on": "database"},
                    {"agent": "frontend", "prompt": "create login form", "depends_on": ["backend"]}
                ],
                "return_to": "architect"
            }"#,
        )
        .unwrap();

        assert_eq!(request.mode, DelegationMode::Sequential);
        assert_eq!(request.return_to, Some(AgentKind::Architect));
        let ids: Vec<_> = request.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["database", "backend", "frontend"]);
        assert_eq!(request.tasks[1].depends_on, vec!["database".to_string()]);
        assert_eq!(request.tasks[2].depends_on, vec!["backend".to_string()]);
    }

    #[test]
    fn test_parse_parallel_groups() {
        let request = DelegationRequest::from_json(
            r#"{
                "type": "parallel",
                "agents": [
                    {"agent": "frontend", "prompt": "web"},
                    {"agent": "mobile", "prompt": "app"},
                    {"agent": "deployment", "prompt": "ship"}
                ],
                "parallel_groups": [["frontend", "mobile"]]
            }"#,
        )
        .unwrap();

        assert_eq!(request.tasks[0].parallel_group.as_deref(), Some("group-0"));
        assert_eq!(request.tasks[1].parallel_group.as_deref(), Some("group-0"));
        assert!(request.tasks[2].parallel_group.is_none());
    }

    #[test]
    fn test_parallel_group_unknown_member() {
        let err = DelegationRequest::from_json(
            r#"{"type": "parallel", "agents": [{"agent": "frontend", "prompt": "x"}], "parallel_groups": [["mobile"]]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("mobile"));
    }

    #[test]
    fn test_duplicate_agents_get_suffixed_ids() {
        let request = DelegationRequest::from_json(
            r#"{"type": "sequential", "agents": [
                {"agent": "backend", "prompt": "one"},
                {"agent": "backend", "prompt": "two"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(request.tasks[0].id, "backend");
        assert_eq!(request.tasks[1].id, "backend-2");
    }

    #[test]
    fn test_round_trip_is_lossless() {
        let request = DelegationRequest::sequential(vec![
            TaskSpec::new(AgentKind::Database, "schema"),
            TaskSpec::new(AgentKind::Backend, "api")
                .depends_on("database")
                .with_timeout(Duration::from_millis(1500)),
            TaskSpec::new(AgentKind::Frontend, "ui").in_group("ui"),
            TaskSpec::new(AgentKind::Mobile, "app").in_group("ui"),
        ])
        .from_agent(AgentKind::Architect)
        .return_to(AgentKind::Architect)
        .at_depth(1)
        .within(vec![AgentKind::Architect]);

        let json = request.to_json().unwrap();
        let parsed = DelegationRequest::from_json(&json).unwrap();
        assert_eq!(parsed, request);
        assert_eq!(parsed.to_json().unwrap(), json);
    }

    #[test]
    fn test_single_round_trip() {
        let request = DelegationRequest::single(
            TaskSpec::new(AgentKind::Design, "mockups").with_reason("need visuals"),
        )
        .non_blocking();

        let parsed = DelegationRequest::from_json(&request.to_json().unwrap()).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_compound_request_needs_known_type() {
        let err = DelegationRequest::from_json(
            r#"{"type": "paralel", "agents": [{"agent": "frontend", "prompt": "web"}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown delegation type: paralel"));

        let err = DelegationRequest::from_json(r#"{"agents": [{"agent": "frontend", "prompt": "web"}]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("Missing field: type"));
    }

    #[test]
    fn test_sub_millisecond_timeout_survives_round_trip() {
        let request = DelegationRequest::single(
            TaskSpec::new(AgentKind::Backend, "api").with_timeout(Duration::from_micros(500)),
        );
        assert_eq!(request.tasks[0].timeout, Some(Duration::from_millis(1)));

        let parsed = DelegationRequest::from_json(&request.to_json().unwrap()).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_whole_millis_saturates() {
        assert_eq!(whole_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(whole_millis(Duration::from_nanos(1_000_001)), 2);
        assert_eq!(whole_millis(Duration::MAX), u64::MAX);
    }
}
