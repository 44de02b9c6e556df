//! Task graph compilation
//!
//! Turns a [`DelegationRequest`] into a [`Graph`]: the validated tasks plus an
//! ordered partition into waves. Every task's dependencies lie in strictly
//! earlier waves; a wave is either a single sequential step or every ready
//! task of one parallel group.

use std::collections::{HashMap, HashSet};

use crate::agent::AgentKind;
use crate::error::CompileError;
use crate::request::{DelegationMode, DelegationRequest, TaskSpec};

/// Group shared by ungrouped tasks of a `parallel` request
const IMPLICIT_PARALLEL_GROUP: &str = "__parallel";

/// Limits applied while compiling
#[derive(Debug, Clone)]
pub struct CompileLimits {
    /// Deepest delegation level a compiled request may reach
    pub max_depth: u32,
    /// Custom kinds accepted in addition to the built-in ones
    pub extra_kinds: HashSet<String>,
}

impl Default for CompileLimits {
    fn default() -> Self {
        Self {
            max_depth: 2,
            extra_kinds: HashSet::new(),
        }
    }
}

/// Node in the compiled graph
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub spec: TaskSpec,
    /// Declaration index of each dependency
    pub deps: Vec<usize>,
    /// Effective parallel group after mode defaults are applied
    pub group: Option<String>,
}

/// Executable form of a delegation request
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<GraphNode>,
    waves: Vec<Vec<usize>>,
    index: HashMap<String, usize>,
    mode: DelegationMode,
    depth: u32,
    requesting_agent: Option<AgentKind>,
    return_to: Option<AgentKind>,
    lineage: Vec<AgentKind>,
}

impl Graph {
    /// Tasks in declaration order
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> &GraphNode {
        &self.nodes[idx]
    }

    /// Waves of declaration indices, in execution order
    pub fn waves(&self) -> &[Vec<usize>] {
        &self.waves
    }

    /// Waves as task ids
    pub fn wave_ids(&self) -> Vec<Vec<&str>> {
        self.waves
            .iter()
            .map(|wave| wave.iter().map(|&i| self.nodes[i].spec.id.as_str()).collect())
            .collect()
    }

    pub fn index_of(&self, task_id: &str) -> Option<usize> {
        self.index.get(task_id).copied()
    }

    pub fn mode(&self) -> DelegationMode {
        self.mode
    }

    /// Depth at which this graph's tasks run
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn requesting_agent(&self) -> Option<&AgentKind> {
        self.requesting_agent.as_ref()
    }

    pub fn return_to(&self) -> Option<&AgentKind> {
        self.return_to.as_ref()
    }

    /// Kinds held by the invocations waiting on this graph
    pub fn lineage(&self) -> &[AgentKind] {
        &self.lineage
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Wave number a task was placed in
    pub fn wave_of(&self, idx: usize) -> Option<usize> {
        self.waves.iter().position(|wave| wave.contains(&idx))
    }
}

/// Validate a request and compile it into waves
pub fn compile(request: &DelegationRequest, limits: &CompileLimits) -> Result<Graph, CompileError> {
    let tasks = &request.tasks;

    if tasks.is_empty() {
        return Err(CompileError::EmptyRequest);
    }
    if request.mode == DelegationMode::Single && tasks.len() != 1 {
        return Err(CompileError::SingleModeArity(tasks.len()));
    }

    let mut index = HashMap::with_capacity(tasks.len());
    for (i, task) in tasks.iter().enumerate() {
        if let AgentKind::Custom(name) = &task.agent {
            if !limits.extra_kinds.contains(name.as_str()) {
                return Err(CompileError::UnknownAgent(name.as_str().to_string()));
            }
        }
        if index.insert(task.id.clone(), i).is_some() {
            return Err(CompileError::DuplicateTaskId(task.id.clone()));
        }
    }

    let mut nodes = Vec::with_capacity(tasks.len());
    for task in tasks {
        let mut deps = Vec::with_capacity(task.depends_on.len());
        for dep in &task.depends_on {
            let &d = index.get(dep).ok_or_else(|| CompileError::InvalidReference {
                task: task.id.clone(),
                missing: dep.clone(),
            })?;
            if !deps.contains(&d) {
                deps.push(d);
            }
        }
        let group = match (&task.parallel_group, request.mode) {
            (Some(group), _) => Some(group.clone()),
            (None, DelegationMode::Parallel) => Some(IMPLICIT_PARALLEL_GROUP.to_string()),
            (None, _) => None,
        };
        nodes.push(GraphNode {
            spec: task.clone(),
            deps,
            group,
        });
    }

    let waves = partition_waves(&nodes)?;

    let depth = request.depth + 1;
    if depth > limits.max_depth {
        return Err(CompileError::NestingExceeded {
            depth,
            max: limits.max_depth,
        });
    }

    // Those kinds' slots are held until this request finishes
    if let Some(task) = tasks.iter().find(|t| request.lineage.contains(&t.agent)) {
        return Err(CompileError::ReentrantDelegation {
            task: task.id.clone(),
            agent: task.agent.clone(),
        });
    }

    Ok(Graph {
        nodes,
        waves,
        index,
        mode: request.mode,
        depth,
        requesting_agent: request.requesting_agent.clone(),
        return_to: request.return_to.clone(),
        lineage: request.lineage.clone(),
    })
}

/// Kahn's algorithm, emitting one wave per step
///
/// Ready tasks are considered in declaration order. The first ready task
/// decides the wave: alone if ungrouped, or together with every other ready
/// task of its group.
fn partition_waves(nodes: &[GraphNode]) -> Result<Vec<Vec<usize>>, CompileError> {
    let n = nodes.len();
    let mut remaining: Vec<usize> = nodes.iter().map(|node| node.deps.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, node) in nodes.iter().enumerate() {
        for &d in &node.deps {
            dependents[d].push(i);
        }
    }

    let mut placed = vec![false; n];
    let mut waves = Vec::new();
    let mut placed_count = 0;

    while placed_count < n {
        let ready: Vec<usize> = (0..n).filter(|&i| !placed[i] && remaining[i] == 0).collect();

        let Some(&first) = ready.first() else {
            let stuck = (0..n)
                .filter(|&i| !placed[i])
                .map(|i| nodes[i].spec.id.clone())
                .collect();
            return Err(CompileError::CyclicDependency(stuck));
        };

        let wave: Vec<usize> = match &nodes[first].group {
            Some(group) => ready
                .into_iter()
                .filter(|&i| nodes[i].group.as_ref() == Some(group))
                .collect(),
            None => vec![first],
        };

        for &i in &wave {
            placed[i] = true;
            placed_count += 1;
        }
        for &i in &wave {
            for &dependent in &dependents[i] {
                remaining[dependent] -= 1;
            }
        }
        waves.push(wave);
    }

    Ok(waves)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> CompileLimits {
        CompileLimits::default()
    }

    fn task(agent: AgentKind, id: &str) -> TaskSpec {
        TaskSpec::new(agent, format!("do {id}")).with_id(id)
    }

    fn assert_deps_in_earlier_waves(graph: &Graph) {
        for (i, node) in graph.nodes().iter().enumerate() {
            let wave = graph.wave_of(i).unwrap();
            for &d in &node.deps {
                assert!(graph.wave_of(d).unwrap() < wave, "{} not after its deps", node.spec.id);
            }
        }
    }

    // === Validation ===

    #[test]
    fn test_empty_request() {
        let request = DelegationRequest::sequential(vec![]);
        assert_eq!(compile(&request, &limits()).unwrap_err(), CompileError::EmptyRequest);
    }

    #[test]
    fn test_single_mode_arity() {
        let mut request = DelegationRequest::single(task(AgentKind::Backend, "a"));
        request.tasks.push(task(AgentKind::Frontend, "b"));
        assert_eq!(compile(&request, &limits()).unwrap_err(), CompileError::SingleModeArity(2));
    }

    #[test]
    fn test_duplicate_ids() {
        let request = DelegationRequest::sequential(vec![
            task(AgentKind::Backend, "a"),
            task(AgentKind::Frontend, "a"),
        ]);
        assert_eq!(
            compile(&request, &limits()).unwrap_err(),
            CompileError::DuplicateTaskId("a".into())
        );
    }

    #[test]
    fn test_invalid_reference() {
        let request = DelegationRequest::sequential(vec![
            task(AgentKind::Backend, "a").depends_on("ghost"),
        ]);
        assert_eq!(
            compile(&request, &limits()).unwrap_err(),
            CompileError::InvalidReference {
                task: "a".into(),
                missing: "ghost".into()
            }
        );
    }

    #[test]
    fn test_unknown_custom_kind() {
        let request = DelegationRequest::single(task(AgentKind::from("qa"), "a"));
        assert_eq!(
            compile(&request, &limits()).unwrap_err(),
            CompileError::UnknownAgent("qa".into())
        );

        let mut limits = limits();
        limits.extra_kinds.insert("qa".into());
        assert!(compile(&request, &limits).is_ok());
    }

    // === Cycles ===

    #[test]
    fn test_cycle_detected() {
        let request = DelegationRequest::sequential(vec![
            task(AgentKind::Database, "a").depends_on("c"),
            task(AgentKind::Backend, "b").depends_on("a"),
            task(AgentKind::Frontend, "c").depends_on("b"),
            task(AgentKind::Design, "d"),
        ]);
        match compile(&request, &limits()).unwrap_err() {
            CompileError::CyclicDependency(ids) => assert_eq!(ids, ["a", "b", "c"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let request = DelegationRequest::single(task(AgentKind::Backend, "a").depends_on("a"));
        assert_eq!(
            compile(&request, &limits()).unwrap_err(),
            CompileError::CyclicDependency(vec!["a".into()])
        );
    }

    // === Nesting ===

    #[test]
    fn test_nesting_within_bound() {
        let request = DelegationRequest::single(task(AgentKind::Backend, "a")).at_depth(1);
        let graph = compile(&request, &limits()).unwrap();
        assert_eq!(graph.depth(), 2);
    }

    #[test]
    fn test_nesting_exceeded() {
        let request = DelegationRequest::single(task(AgentKind::Backend, "a")).at_depth(2);
        assert_eq!(
            compile(&request, &limits()).unwrap_err(),
            CompileError::NestingExceeded { depth: 3, max: 2 }
        );
    }

    #[test]
    fn test_delegating_back_into_the_lineage() {
        let request = DelegationRequest::sequential(vec![
            task(AgentKind::Frontend, "ui"),
            task(AgentKind::Backend, "helper"),
        ])
        .at_depth(1)
        .within(vec![AgentKind::Backend]);
        assert_eq!(
            compile(&request, &limits()).unwrap_err(),
            CompileError::ReentrantDelegation {
                task: "helper".into(),
                agent: AgentKind::Backend
            }
        );

        let request = DelegationRequest::single(task(AgentKind::Frontend, "ui"))
            .at_depth(1)
            .within(vec![AgentKind::Backend]);
        let graph = compile(&request, &limits()).unwrap();
        assert_eq!(graph.lineage(), [AgentKind::Backend]);
    }

    // === Waves ===

    #[test]
    fn test_sequential_waves_are_singletons() {
        let request = DelegationRequest::sequential(vec![
            task(AgentKind::Database, "a"),
            task(AgentKind::Backend, "b").depends_on("a"),
            task(AgentKind::Frontend, "c"),
        ]);
        let graph = compile(&request, &limits()).unwrap();
        assert_eq!(graph.wave_ids(), vec![vec!["a"], vec!["b"], vec!["c"]]);
        assert_deps_in_earlier_waves(&graph);
    }

    #[test]
    fn test_dependency_reorders_stably() {
        let request = DelegationRequest::sequential(vec![
            task(AgentKind::Frontend, "ui").depends_on("api"),
            task(AgentKind::Backend, "api"),
            task(AgentKind::Design, "look"),
        ]);
        let graph = compile(&request, &limits()).unwrap();
        assert_eq!(graph.wave_ids(), vec![vec!["api"], vec!["ui"], vec!["look"]]);
    }

    #[test]
    fn test_parallel_mode_groups_ready_tasks() {
        let request = DelegationRequest::parallel(vec![
            task(AgentKind::Frontend, "web"),
            task(AgentKind::Mobile, "app"),
            task(AgentKind::Deployment, "ship").depends_on("web").depends_on("app"),
        ]);
        let graph = compile(&request, &limits()).unwrap();
        assert_eq!(graph.wave_ids(), vec![vec!["web", "app"], vec!["ship"]]);
        assert_deps_in_earlier_waves(&graph);
    }

    #[test]
    fn test_explicit_groups_in_sequential_request() {
        let request = DelegationRequest::sequential(vec![
            task(AgentKind::Database, "schema"),
            task(AgentKind::Backend, "api").depends_on("schema").in_group("build"),
            task(AgentKind::Frontend, "ui").depends_on("schema").in_group("build"),
            task(AgentKind::Design, "style").in_group("build"),
            task(AgentKind::Deployment, "ship").depends_on("api").depends_on("ui"),
        ]);
        let graph = compile(&request, &limits()).unwrap();
        assert_eq!(
            graph.wave_ids(),
            vec![vec!["schema"], vec!["api", "ui", "style"], vec!["ship"]]
        );
        assert_deps_in_earlier_waves(&graph);
    }

    #[test]
    fn test_group_members_with_unmet_deps_wait() {
        let request = DelegationRequest::sequential(vec![
            task(AgentKind::Frontend, "web").in_group("g"),
            task(AgentKind::Backend, "api"),
            task(AgentKind::Mobile, "app").depends_on("api").in_group("g"),
        ]);
        let graph = compile(&request, &limits()).unwrap();
        assert_eq!(graph.wave_ids(), vec![vec!["web"], vec!["api"], vec!["app"]]);
    }

    #[test]
    fn test_graph_metadata() {
        let request = DelegationRequest::single(task(AgentKind::Backend, "a"))
            .from_agent(AgentKind::Architect)
            .return_to(AgentKind::Architect);
        let graph = compile(&request, &limits()).unwrap();
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.index_of("a"), Some(0));
        assert_eq!(graph.requesting_agent(), Some(&AgentKind::Architect));
        assert_eq!(graph.return_to(), Some(&AgentKind::Architect));
        assert_eq!(graph.mode(), DelegationMode::Single);
    }
}
