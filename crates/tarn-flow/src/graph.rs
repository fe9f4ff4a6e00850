//! Structural validation of a chain declaration.
//!
//! Builds a [`ChainNode`] per declared step from the references found in
//! its bodies and validation branches, then walks every path checking for
//! cycles. Cycle detection is path-relative rather than visited-set
//! relative, so diamond dependencies (two steps both feeding a third) are
//! legal while any path revisiting a step is not. Both checks run before
//! any step is submitted; a failure aborts the chain with nothing written.

use std::collections::{BTreeMap, BTreeSet};

use crate::chain::{BranchAction, ChainStep, ValidationSpec};
use crate::error::{Error, Result};
use crate::reference::scan_references;

/// A step's edges, computed at validation time and discarded afterwards.
#[derive(Debug, Clone)]
pub struct ChainNode {
    /// The step name.
    pub name: String,
    /// Whether the step waits on a condition.
    pub conditional: bool,
    /// Steps this node's bodies reference.
    pub direct_references: BTreeSet<String>,
    /// Step unlocked or terminated on a SUCCESS classification.
    pub on_success_reference: Option<String>,
    /// Step unlocked or terminated on a FAILURE classification.
    pub on_failure_reference: Option<String>,
    /// Steps whose bodies reference this node.
    pub referenced_by: BTreeSet<String>,
}

/// Returns the step name a branch action unlocks, if any.
fn branch_target(branch: Option<&BranchAction>) -> Option<String> {
    match branch {
        Some(BranchAction::ExecuteStep(name)) => Some(name.clone()),
        Some(BranchAction::TerminateChain) | None => None,
    }
}

/// The validated dependency graph of a chain declaration.
#[derive(Debug)]
pub struct ChainGraph {
    nodes: BTreeMap<String, ChainNode>,
}

impl ChainGraph {
    /// Builds nodes from declared steps.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateStepName`] when a name repeats,
    /// [`Error::MalformedReference`] for unparseable reference values, and
    /// [`Error::UndefinedReference`] when a body or validation branch
    /// targets an undeclared step.
    pub fn build(steps: &[ChainStep]) -> Result<Self> {
        let mut nodes: BTreeMap<String, ChainNode> = BTreeMap::new();

        for step in steps {
            let (on_success_reference, on_failure_reference) = match &step.validation {
                Some(ValidationSpec {
                    on_success,
                    on_failure,
                    ..
                }) => (
                    branch_target(on_success.as_ref()),
                    branch_target(on_failure.as_ref()),
                ),
                None => (None, None),
            };

            let node = ChainNode {
                name: step.name.clone(),
                conditional: step.conditional,
                direct_references: scan_references(&step.body)?,
                on_success_reference,
                on_failure_reference,
                referenced_by: BTreeSet::new(),
            };

            if nodes.insert(step.name.clone(), node).is_some() {
                return Err(Error::DuplicateStepName {
                    name: step.name.clone(),
                });
            }
        }

        // Check targets and record reverse edges.
        let names: Vec<String> = nodes.keys().cloned().collect();
        for name in &names {
            let node = &nodes[name];
            let direct = node.direct_references.clone();
            let branches: Vec<String> = node
                .on_success_reference
                .iter()
                .chain(node.on_failure_reference.iter())
                .cloned()
                .collect();

            for target in direct.iter().chain(branches.iter()) {
                if !nodes.contains_key(target) {
                    return Err(Error::UndefinedReference {
                        referrer: name.clone(),
                        target: target.clone(),
                    });
                }
            }
            for target in &direct {
                if let Some(target_node) = nodes.get_mut(target) {
                    target_node.referenced_by.insert(name.clone());
                }
            }
        }

        Ok(Self { nodes })
    }

    /// Returns the node for a step name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&ChainNode> {
        self.nodes.get(name)
    }

    /// Walks every path checking for cycles.
    ///
    /// Entry points are nodes nothing references; nodes unreachable from
    /// any entry point (which only happens inside cycle-only components)
    /// are walked afterwards so isolated cycles and self-loops are still
    /// caught.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CycleDetected`] with the offending path, ending at
    /// the revisited step.
    #[tracing::instrument(skip(self), fields(steps = self.nodes.len()))]
    pub fn validate(&self) -> Result<()> {
        let mut visited = BTreeSet::new();

        for node in self.nodes.values().filter(|n| n.referenced_by.is_empty()) {
            self.walk_path(node, &mut Vec::new(), &mut visited)?;
        }

        let unvisited: Vec<&ChainNode> = self
            .nodes
            .values()
            .filter(|n| !visited.contains(&n.name))
            .collect();
        for node in unvisited {
            if !visited.contains(&node.name) {
                self.walk_path(node, &mut Vec::new(), &mut visited)?;
            }
        }

        Ok(())
    }

    fn walk_path(
        &self,
        node: &ChainNode,
        path: &mut Vec<String>,
        visited: &mut BTreeSet<String>,
    ) -> Result<()> {
        if path.contains(&node.name) {
            let mut cycle = path.clone();
            cycle.push(node.name.clone());
            return Err(Error::CycleDetected { path: cycle });
        }

        visited.insert(node.name.clone());
        path.push(node.name.clone());

        for target in &node.direct_references {
            if let Some(next) = self.nodes.get(target) {
                self.walk_path(next, path, visited)?;
            }
        }

        // Branch edges only carry execution flow out of conditional steps.
        if node.conditional {
            for target in node
                .on_success_reference
                .iter()
                .chain(node.on_failure_reference.iter())
            {
                if let Some(next) = self.nodes.get(target) {
                    self.walk_path(next, path, visited)?;
                }
            }
        }

        path.pop();
        Ok(())
    }
}

/// Builds and validates the graph for a set of declared steps.
///
/// # Errors
///
/// Propagates [`ChainGraph::build`] and [`ChainGraph::validate`] errors.
pub fn validate_steps(steps: &[ChainStep]) -> Result<ChainGraph> {
    let graph = ChainGraph::build(steps)?;
    graph.validate()?;
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::request::RequestBody;

    fn step(name: &str, refs: &[&str]) -> ChainStep {
        let query: String = refs
            .first()
            .map_or_else(|| "plain query".to_string(), |r| format!("REF:{r}.content"));
        let mut body = RequestBody {
            lookup_instructions: vec![json!({"archive": "BASIC", "query": query})],
            processing_instructions: json!({"processor": "SUMMARIZE"}),
            response_config: json!({"responder": "DIRECT"}),
        };
        if let Some(second) = refs.get(1) {
            body.processing_instructions = json!({"previous": format!("REF:{second}.id")});
        }
        ChainStep::new(name, body)
    }

    #[test]
    fn linear_chain_is_valid() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])];
        assert!(validate_steps(&steps).is_ok());
    }

    #[test]
    fn diamond_is_legal() {
        let steps = vec![
            step("root", &[]),
            step("left", &["root"]),
            step("right", &["root"]),
            step("join", &["left", "right"]),
        ];
        assert!(validate_steps(&steps).is_ok());
    }

    #[test]
    fn orphan_steps_are_legal_roots() {
        let steps = vec![step("a", &[]), step("lonely", &[])];
        assert!(validate_steps(&steps).is_ok());
    }

    #[test]
    fn duplicate_names_rejected() {
        let steps = vec![step("a", &[]), step("a", &[])];
        assert!(matches!(
            validate_steps(&steps),
            Err(Error::DuplicateStepName { name }) if name == "a"
        ));
    }

    #[test]
    fn undefined_reference_rejected() {
        let steps = vec![step("a", &["ghost"])];
        assert!(matches!(
            validate_steps(&steps),
            Err(Error::UndefinedReference { referrer, target })
                if referrer == "a" && target == "ghost"
        ));
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let steps = vec![step("a", &["a"])];
        let err = validate_steps(&steps).unwrap_err();
        assert!(matches!(err, Error::CycleDetected { ref path } if path.last() == Some(&"a".to_string())));
    }

    #[test]
    fn two_step_cycle_detected_with_path() {
        let steps = vec![step("a", &["b"]), step("b", &["a"])];
        let Err(Error::CycleDetected { path }) = validate_steps(&steps) else {
            panic!("expected cycle");
        };
        assert_eq!(path.first(), path.last());
        assert!(path.len() >= 3);
    }

    #[test]
    fn conditional_branch_edge_can_form_cycle() {
        // "retry" depends on "check", whose failure branch unlocks "retry"
        // again: check -> retry -> check.
        let mut check = step("check", &[]);
        check.conditional = true;
        check.validation = Some(ValidationSpec {
            prompt: "did it work".into(),
            model_id: None,
            on_success: None,
            on_failure: Some(BranchAction::ExecuteStep("retry".into())),
        });
        let retry = step("retry", &["check"]);
        assert!(matches!(
            validate_steps(&[check, retry]),
            Err(Error::CycleDetected { .. })
        ));
    }

    #[test]
    fn branch_target_must_be_declared() {
        let mut gather = step("gather", &[]);
        gather.validation = Some(ValidationSpec {
            prompt: "check it".into(),
            model_id: None,
            on_success: Some(BranchAction::ExecuteStep("ghost".into())),
            on_failure: None,
        });
        assert!(matches!(
            validate_steps(&[gather]),
            Err(Error::UndefinedReference { .. })
        ));
    }

    #[test]
    fn terminate_branch_adds_no_edge() {
        let mut gather = step("gather", &[]);
        gather.validation = Some(ValidationSpec {
            prompt: "check it".into(),
            model_id: None,
            on_success: Some(BranchAction::TerminateChain),
            on_failure: Some(BranchAction::TerminateChain),
        });
        let graph = validate_steps(&[gather]).unwrap();
        let node = graph.node("gather").unwrap();
        assert!(node.on_success_reference.is_none());
        assert!(node.on_failure_reference.is_none());
    }
}
