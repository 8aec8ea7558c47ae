//! Graph compiler.
//!
//! Pure transform from a dependency-annotated agent list to a linked list of
//! execution stages. Cycles are detected with Kahn in-degree reduction and
//! repaired by dropping edges between cyclic nodes (keeping edges onto
//! non-cyclic nodes whenever any exist, so the surviving partial order stays
//! as close to the planner's intent as possible). Dangling dependency ids
//! are dropped with a warning. The only fatal condition is a plan with no
//! runnable agent at all.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::error::{Error, Result};
use crate::plan::{Plan, VIRTUAL_ROOT_ID};

/// One stage in the compiled execution order. A singly-linked list: stages
/// execute in order, and the members of a `Parallel` stage run concurrently.
#[derive(Debug, Clone, PartialEq)]
pub enum StageNode {
    Normal {
        agent_id: String,
        next: Option<Box<StageNode>>,
    },
    Parallel {
        agent_ids: Vec<String>,
        next: Option<Box<StageNode>>,
    },
}

impl StageNode {
    pub fn next(&self) -> Option<&StageNode> {
        match self {
            Self::Normal { next, .. } | Self::Parallel { next, .. } => next.as_deref(),
        }
    }

    /// Agent ids of this stage, in deterministic (ordinal) order.
    pub fn agent_ids(&self) -> Vec<&str> {
        match self {
            Self::Normal { agent_id, .. } => vec![agent_id.as_str()],
            Self::Parallel { agent_ids, .. } => agent_ids.iter().map(String::as_str).collect(),
        }
    }

    /// All agent ids reachable from this stage onward.
    pub fn all_agent_ids(&self) -> Vec<&str> {
        let mut ids = self.agent_ids();
        if let Some(next) = self.next() {
            ids.extend(next.all_agent_ids());
        }
        ids
    }

    pub fn stage_count(&self) -> usize {
        1 + self.next().map_or(0, StageNode::stage_count)
    }
}

/// Compile the plan into an execution tree, setting each agent's `parallel`
/// flag as a side effect.
pub fn compile(plan: &mut Plan) -> Result<StageNode> {
    if plan.agents.is_empty() {
        return Err(Error::NoExecutableAgent);
    }

    let ids: Vec<String> = plan.agents.iter().map(|a| a.id.clone()).collect();
    let known: HashSet<&str> = ids.iter().map(String::as_str).collect();

    // Effective dependency sets: dangling ids and the virtual root are
    // dropped up front (a dependency on the virtual root marks an entry
    // node, which is exactly what an empty set means here).
    let mut deps: Vec<HashSet<usize>> = Vec::with_capacity(ids.len());
    let index_of: HashMap<&str, usize> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    for agent in &plan.agents {
        let mut set = HashSet::new();
        for dep in &agent.depends_on {
            if dep == VIRTUAL_ROOT_ID || dep == &agent.id {
                continue;
            }
            if !known.contains(dep.as_str()) {
                warn!(agent = %agent.id, dependency = %dep, "dropping dangling dependency");
                continue;
            }
            set.insert(index_of[dep.as_str()]);
        }
        deps.push(set);
    }

    repair_cycles(&ids, &mut deps);

    // Walk ready-sets into the stage list, back to front.
    let order = stage_order(&deps);
    for stage in &order {
        if stage.len() > 1 {
            for &member in stage {
                plan.agents[member].parallel = true;
            }
        }
    }

    let mut next: Option<Box<StageNode>> = None;
    for stage in order.into_iter().rev() {
        let node = if stage.len() == 1 {
            StageNode::Normal {
                agent_id: ids[stage[0]].clone(),
                next,
            }
        } else {
            StageNode::Parallel {
                agent_ids: stage.iter().map(|&i| ids[i].clone()).collect(),
                next,
            }
        };
        next = Some(Box::new(node));
    }

    match next {
        Some(root) => Ok(*root),
        None => Err(Error::NoExecutableAgent),
    }
}

/// Nodes left with nonzero in-degree after Kahn reduction are cyclic.
fn cyclic_nodes(deps: &[HashSet<usize>]) -> HashSet<usize> {
    let mut remaining: Vec<HashSet<usize>> = deps.to_vec();
    let mut done: HashSet<usize> = HashSet::new();

    loop {
        let ready: Vec<usize> = (0..remaining.len())
            .filter(|i| !done.contains(i) && remaining[*i].is_empty())
            .collect();
        if ready.is_empty() {
            break;
        }
        for i in ready {
            done.insert(i);
            for set in remaining.iter_mut() {
                set.remove(&i);
            }
        }
    }

    (0..deps.len()).filter(|i| !done.contains(i)).collect()
}

/// Break cycles one edge-drop at a time, lowest ordinal first, so the
/// repair is deterministic and keeps as many original edges as possible.
fn repair_cycles(ids: &[String], deps: &mut [HashSet<usize>]) {
    loop {
        let cyclic = cyclic_nodes(deps);
        if cyclic.is_empty() {
            return;
        }

        let mut ordered: Vec<usize> = cyclic.iter().copied().collect();
        ordered.sort_unstable();
        let node = ordered[0];

        let onto_cyclic: Vec<usize> = deps[node]
            .iter()
            .copied()
            .filter(|d| cyclic.contains(d))
            .collect();
        for dropped in onto_cyclic {
            warn!(
                agent = %ids[node],
                dependency = %ids[dropped],
                "dropping cyclic dependency edge"
            );
            deps[node].remove(&dropped);
        }
    }
}

/// Ready-set walk over an acyclic dependency map. Each stage is the set of
/// nodes whose entire dependency set is satisfied, sorted by ordinal.
fn stage_order(deps: &[HashSet<usize>]) -> Vec<Vec<usize>> {
    let mut done: HashSet<usize> = HashSet::new();
    let mut stages = Vec::new();

    while done.len() < deps.len() {
        let mut ready: Vec<usize> = (0..deps.len())
            .filter(|i| !done.contains(i) && deps[*i].iter().all(|d| done.contains(d)))
            .collect();
        if ready.is_empty() {
            // Unreachable after repair; bail rather than spin.
            break;
        }
        ready.sort_unstable();
        done.extend(ready.iter().copied());
        stages.push(ready);
    }

    stages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{AgentStatus, PlanAgent};

    fn agent(ordinal: usize, deps: &[usize]) -> PlanAgent {
        PlanAgent {
            id: format!("t-{ordinal}"),
            provider: format!("P{ordinal}"),
            depends_on: deps.iter().map(|d| format!("t-{d}")).collect(),
            task: String::new(),
            nodes: vec![],
            status: AgentStatus::Init,
            parallel: false,
            markup: String::new(),
            error: None,
        }
    }

    fn plan(agents: Vec<PlanAgent>) -> Plan {
        Plan {
            id: "t".to_string(),
            name: String::new(),
            rationale: String::new(),
            agents,
            markup: String::new(),
        }
    }

    #[test]
    fn diamond_compiles_to_normal_parallel_normal() {
        // A:[], B:[A], C:[A], D:[B,C]
        let mut plan = plan(vec![
            agent(0, &[]),
            agent(1, &[0]),
            agent(2, &[0]),
            agent(3, &[1, 2]),
        ]);
        let root = compile(&mut plan).unwrap();

        assert!(matches!(&root, StageNode::Normal { agent_id, .. } if agent_id == "t-0"));
        let second = root.next().unwrap();
        assert!(
            matches!(second, StageNode::Parallel { agent_ids, .. }
                if agent_ids == &["t-1".to_string(), "t-2".to_string()])
        );
        let third = second.next().unwrap();
        assert!(matches!(third, StageNode::Normal { agent_id, .. } if agent_id == "t-3"));
        assert!(third.next().is_none());

        assert!(!plan.agents[0].parallel);
        assert!(plan.agents[1].parallel);
        assert!(plan.agents[2].parallel);
        assert!(!plan.agents[3].parallel);
    }

    #[test]
    fn compilation_is_deterministic() {
        let build = || {
            let mut p = plan(vec![
                agent(0, &[]),
                agent(1, &[0]),
                agent(2, &[0]),
                agent(3, &[1, 2]),
                agent(4, &[]),
            ]);
            compile(&mut p).unwrap()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn two_cycle_is_repaired_and_covering() {
        // A depends on B, B depends on A.
        let mut plan = plan(vec![agent(0, &[1]), agent(1, &[0])]);
        let root = compile(&mut plan).unwrap();
        let mut covered = root.all_agent_ids();
        covered.sort_unstable();
        assert_eq!(covered, vec!["t-0", "t-1"]);
        // The lower ordinal lost its edge, so the partial order survives.
        assert!(matches!(&root, StageNode::Normal { agent_id, .. } if agent_id == "t-0"));
    }

    #[test]
    fn cycle_with_external_dependency_keeps_it() {
        // E:[], A:[E, B], B:[A]; A keeps its edge onto E.
        let mut plan = plan(vec![agent(0, &[]), agent(1, &[0, 2]), agent(2, &[1])]);
        let root = compile(&mut plan).unwrap();
        let ids = root.all_agent_ids();
        assert_eq!(ids, vec!["t-0", "t-1", "t-2"]);
        assert_eq!(root.stage_count(), 3);
    }

    #[test]
    fn larger_cycles_terminate() {
        // Three-cycle plus a tail.
        let mut plan = plan(vec![
            agent(0, &[2]),
            agent(1, &[0]),
            agent(2, &[1]),
            agent(3, &[2]),
        ]);
        let root = compile(&mut plan).unwrap();
        let mut covered = root.all_agent_ids();
        covered.sort_unstable();
        assert_eq!(covered, vec!["t-0", "t-1", "t-2", "t-3"]);
    }

    #[test]
    fn dangling_dependencies_are_dropped() {
        let mut p = plan(vec![agent(0, &[7]), agent(1, &[0])]);
        let root = compile(&mut p).unwrap();
        assert!(matches!(&root, StageNode::Normal { agent_id, .. } if agent_id == "t-0"));
        assert_eq!(root.stage_count(), 2);
    }

    #[test]
    fn virtual_root_dependency_marks_entry() {
        let mut p = plan(vec![agent(0, &[]), agent(1, &[])]);
        p.agents[1].depends_on = vec![VIRTUAL_ROOT_ID.to_string()];
        let root = compile(&mut p).unwrap();
        assert!(matches!(&root, StageNode::Parallel { agent_ids, .. } if agent_ids.len() == 2));
    }

    #[test]
    fn empty_plan_is_fatal() {
        let mut p = plan(vec![]);
        assert!(matches!(compile(&mut p), Err(Error::NoExecutableAgent)));
    }
}
