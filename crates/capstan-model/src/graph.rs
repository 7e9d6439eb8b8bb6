//! Adjacency index over a workflow's transitions
//!
//! The index is built once per definition and answers the two questions the
//! coordinator asks on every advance: which transitions leave this node
//! (pre-sorted for selection), and is this node terminal. It also hosts the
//! definition-time unguarded-cycle check.

use std::collections::HashMap;

use crate::context::ContextDocument;
use crate::definition::{Transition, WorkflowDefinition};
use crate::error::DefinitionError;

/// Pre-sorted outgoing-transition index for one definition
#[derive(Debug, Clone)]
pub struct TransitionIndex {
    /// node id -> outgoing transitions, sorted by descending priority with
    /// declaration order breaking ties
    outgoing: HashMap<String, Vec<Transition>>,
}

impl TransitionIndex {
    /// Build the index from a definition
    pub fn new(def: &WorkflowDefinition) -> Self {
        let mut outgoing: HashMap<String, Vec<Transition>> = HashMap::new();
        for node in &def.nodes {
            outgoing.entry(node.id.clone()).or_default();
        }
        for transition in &def.transitions {
            outgoing
                .entry(transition.from_node.clone())
                .or_default()
                .push(transition.clone());
        }
        // Stable sort keeps declaration order within equal priorities.
        for transitions in outgoing.values_mut() {
            transitions.sort_by_key(|t| std::cmp::Reverse(t.priority));
        }
        Self { outgoing }
    }

    /// Outgoing transitions from a node, in selection order
    pub fn outgoing(&self, node_id: &str) -> &[Transition] {
        self.outgoing.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// A node with no outgoing transitions is terminal
    pub fn is_terminal(&self, node_id: &str) -> bool {
        self.outgoing(node_id).is_empty()
    }

    /// Select the transition to fire from a node, if any is eligible
    ///
    /// Exactly one transition is selected per evaluation: the
    /// highest-priority eligible one, with declaration order breaking
    /// priority ties.
    pub fn select(&self, node_id: &str, ctx: &ContextDocument) -> Option<&Transition> {
        self.outgoing(node_id).iter().find(|t| t.is_eligible(ctx))
    }

    /// Reject cycles in which no edge carries a condition
    ///
    /// A condition on any edge of a cycle can become false and break the
    /// loop; a cycle made solely of unconditional edges never terminates.
    /// Detection is a depth-first search over the subgraph of unconditional
    /// edges only.
    pub fn check_unguarded_cycles(&self) -> Result<(), DefinitionError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = self
            .outgoing
            .keys()
            .map(|id| (id.as_str(), Mark::Unvisited))
            .collect();

        // Iterative DFS with an explicit path so the offending cycle can be
        // reported.
        for start in self.outgoing.keys() {
            if marks[start.as_str()] != Mark::Unvisited {
                continue;
            }

            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            let mut path: Vec<&str> = Vec::new();

            while let Some((node, next_edge)) = stack.pop() {
                if next_edge == 0 {
                    // A node can sit on the stack twice when two edges lead
                    // to it; the second visit is already resolved.
                    if marks[node] != Mark::Unvisited {
                        continue;
                    }
                    marks.insert(node, Mark::InProgress);
                    path.push(node);
                }

                let unconditional: Vec<&str> = self
                    .outgoing(node)
                    .iter()
                    .filter(|t| t.condition.is_none())
                    .map(|t| t.to_node.as_str())
                    .collect();

                if next_edge < unconditional.len() {
                    stack.push((node, next_edge + 1));
                    let target = unconditional[next_edge];
                    // Unknown targets (possible on an unvalidated graph)
                    // have no outgoing edges and cannot close a cycle.
                    match marks.get(target).copied().unwrap_or(Mark::Done) {
                        Mark::InProgress => {
                            let cycle_start =
                                path.iter().position(|n| *n == target).unwrap_or(0);
                            let mut cycle: Vec<String> =
                                path[cycle_start..].iter().map(|n| n.to_string()).collect();
                            cycle.push(target.to_string());
                            return Err(DefinitionError::UnguardedCycle(cycle));
                        }
                        Mark::Unvisited => stack.push((target, 0)),
                        Mark::Done => {}
                    }
                } else {
                    marks.insert(node, Mark::Done);
                    path.pop();
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::definition::{Node, TaskRef};
    use serde_json::json;

    fn def_with(transitions: Vec<Transition>) -> WorkflowDefinition {
        let node_ids = ["a", "b", "c"];
        WorkflowDefinition::new("wf", 1, "a")
            .with_nodes(
                node_ids
                    .iter()
                    .map(|id| Node::new(*id, TaskRef::new("t", 1)))
                    .collect(),
            )
            .with_transitions(transitions)
    }

    #[test]
    fn test_outgoing_sorted_by_priority() {
        let def = def_with(vec![
            Transition::new("a", "b").with_priority(5),
            Transition::new("a", "c").with_priority(10),
        ]);
        let index = TransitionIndex::new(&def);

        let targets: Vec<&str> = index.outgoing("a").iter().map(|t| t.to_node.as_str()).collect();
        assert_eq!(targets, vec!["c", "b"]);
    }

    #[test]
    fn test_select_highest_priority_regardless_of_declaration_order() {
        let ctx = ContextDocument::empty();

        for transitions in [
            vec![
                Transition::new("a", "b").with_priority(10),
                Transition::new("a", "c").with_priority(5),
            ],
            vec![
                Transition::new("a", "c").with_priority(5),
                Transition::new("a", "b").with_priority(10),
            ],
        ] {
            let def = def_with(transitions);
            let index = TransitionIndex::new(&def);
            assert_eq!(index.select("a", &ctx).unwrap().to_node, "b");
        }
    }

    #[test]
    fn test_select_tie_breaks_by_declaration_order() {
        let def = def_with(vec![
            Transition::new("a", "c").with_priority(1),
            Transition::new("a", "b").with_priority(1),
        ]);
        let index = TransitionIndex::new(&def);

        assert_eq!(index.select("a", &ContextDocument::empty()).unwrap().to_node, "c");
    }

    #[test]
    fn test_select_skips_ineligible() {
        let mut ctx = ContextDocument::empty();
        ctx.set("state.go", json!(false));

        let def = def_with(vec![
            Transition::new("a", "b")
                .with_priority(10)
                .with_condition(Condition::parse("state.go == true").unwrap()),
            Transition::new("a", "c").with_priority(5),
        ]);
        let index = TransitionIndex::new(&def);

        assert_eq!(index.select("a", &ctx).unwrap().to_node, "c");
    }

    #[test]
    fn test_select_none_eligible() {
        let def = def_with(vec![Transition::new("a", "b")
            .with_condition(Condition::parse("state.never == true").unwrap())]);
        let index = TransitionIndex::new(&def);

        assert!(index.select("a", &ContextDocument::empty()).is_none());
    }

    #[test]
    fn test_is_terminal() {
        let def = def_with(vec![Transition::new("a", "b")]);
        let index = TransitionIndex::new(&def);

        assert!(!index.is_terminal("a"));
        assert!(index.is_terminal("b"));
        assert!(index.is_terminal("unknown"));
    }

    #[test]
    fn test_unguarded_cycle_detected() {
        let def = def_with(vec![
            Transition::new("a", "b"),
            Transition::new("b", "c"),
            Transition::new("c", "a"),
        ]);

        let err = TransitionIndex::new(&def).check_unguarded_cycles().unwrap_err();
        match err {
            DefinitionError::UnguardedCycle(cycle) => {
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.len() >= 4);
            }
            other => panic!("expected UnguardedCycle, got {other:?}"),
        }
    }

    #[test]
    fn test_guarded_cycle_allowed() {
        let def = def_with(vec![
            Transition::new("a", "b"),
            Transition::new("b", "a")
                .with_condition(Condition::parse("state.again == true").unwrap()),
        ]);

        assert!(TransitionIndex::new(&def).check_unguarded_cycles().is_ok());
    }

    #[test]
    fn test_self_loop_unguarded() {
        let def = def_with(vec![Transition::new("a", "a")]);
        assert!(TransitionIndex::new(&def).check_unguarded_cycles().is_err());
    }

    #[test]
    fn test_acyclic_graph_passes() {
        let def = def_with(vec![
            Transition::new("a", "b"),
            Transition::new("a", "c"),
            Transition::new("b", "c"),
        ]);
        assert!(TransitionIndex::new(&def).check_unguarded_cycles().is_ok());
    }
}
