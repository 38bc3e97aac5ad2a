//! Dependency graph store
//!
//! Owns all package nodes and the dependency -> dependent edges. Built once
//! per run from the loaded recipe set, validated (no missing references, no
//! cycles), and read-mostly afterwards: status changes flow through
//! `mark_*` calls which keep readiness bookkeeping incremental.

use std::collections::{HashMap, HashSet};

use crate::core::package::{now_unix_millis, BuildStatus, PackageId, PackageNode};
use crate::core::recipe::RecipeSet;
use crate::error::GraphError;

/// Dependency graph of package nodes
#[derive(Debug)]
pub struct Graph {
    /// Nodes in recipe-tree insertion order
    nodes: Vec<PackageNode>,
    /// Identity -> node index
    index: HashMap<PackageId, usize>,
    /// Direct dependents (reverse build-time edges)
    dependents: Vec<Vec<usize>>,
    /// Per-node count of build-time dependencies not yet succeeded
    unmet: Vec<usize>,
    /// Per-node count of transitive dependents, for scheduling priority
    weight: Vec<usize>,
}

impl Graph {
    /// Build and validate the graph from a loaded recipe set
    ///
    /// Unresolved dependency references and cycles are hard construction
    /// failures: both indicate an inconsistent recipe set, not a
    /// per-package problem. Recipes that failed to parse enter the graph
    /// already `Failed` so their dependents can be cascade-skipped.
    pub fn build(set: &RecipeSet) -> Result<Self, GraphError> {
        let mut nodes = Vec::with_capacity(set.len());
        let mut index = HashMap::with_capacity(set.len());

        for record in &set.records {
            index.insert(record.id.clone(), nodes.len());
            nodes.push(PackageNode {
                id: record.id.clone(),
                build_depends: record.build_depends.clone(),
                run_depends: record.run_depends.clone(),
                command: record.command.clone(),
                status: BuildStatus::Pending,
                detail: None,
                started_at: None,
                finished_at: None,
            });
        }
        for broken in &set.broken {
            index.insert(broken.id.clone(), nodes.len());
            nodes.push(PackageNode {
                id: broken.id.clone(),
                build_depends: Vec::new(),
                run_depends: Vec::new(),
                command: String::new(),
                status: BuildStatus::Failed,
                detail: Some(format!("recipe failed to parse: {}", broken.error)),
                started_at: None,
                finished_at: Some(now_unix_millis()),
            });
        }

        // Every referenced identity must exist, run-time references included.
        let mut depends_on = vec![Vec::new(); nodes.len()];
        let mut dependents = vec![Vec::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            for dep in node.build_depends.iter().chain(&node.run_depends) {
                if !index.contains_key(dep) {
                    return Err(GraphError::MissingDependency {
                        package: node.id.to_string(),
                        dependency: dep.to_string(),
                    });
                }
            }
            for dep in &node.build_depends {
                let dep_idx = index[dep];
                depends_on[i].push(dep_idx);
                dependents[dep_idx].push(i);
            }
        }

        detect_cycles(&nodes, &depends_on)?;

        let unmet = depends_on.iter().map(Vec::len).collect();
        let weight = compute_weights(&dependents);

        Ok(Self {
            nodes,
            index,
            dependents,
            unmet,
            weight,
        })
    }

    /// Packages whose build-time dependencies are all satisfied
    ///
    /// Seeds the scheduler; afterwards readiness updates arrive
    /// incrementally from `mark_terminal`.
    pub fn ready_frontier(&self) -> Vec<PackageId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(i, node)| node.status == BuildStatus::Pending && self.unmet[*i] == 0)
            .map(|(_, node)| node.id.clone())
            .collect()
    }

    /// Move a package forward to a non-terminal status
    pub fn mark_status(&mut self, id: &PackageId, status: BuildStatus) -> Result<(), GraphError> {
        let idx = self.index_of(id)?;
        self.transition(idx, status, None)?;
        Ok(())
    }

    /// Record a terminal status
    ///
    /// On success, readiness is recomputed only for the direct dependents
    /// of the affected node and the newly-ready identities are returned;
    /// the cost is proportional to out-degree, not graph size.
    pub fn mark_terminal(
        &mut self,
        id: &PackageId,
        status: BuildStatus,
        detail: Option<String>,
    ) -> Result<Vec<PackageId>, GraphError> {
        debug_assert!(status.is_terminal());
        let idx = self.index_of(id)?;
        self.transition(idx, status, detail)?;

        if status != BuildStatus::Succeeded {
            return Ok(Vec::new());
        }

        let mut unlocked = Vec::new();
        for &dep_idx in &self.dependents[idx] {
            self.unmet[dep_idx] -= 1;
            if self.unmet[dep_idx] == 0 && self.nodes[dep_idx].status == BuildStatus::Pending {
                unlocked.push(self.nodes[dep_idx].id.clone());
            }
        }
        Ok(unlocked)
    }

    /// Treat a package as already built (resume from a prior run's ledger)
    ///
    /// The node moves straight to `Succeeded` without a dispatch; its
    /// dependents see the dependency as satisfied.
    pub fn mark_presatisfied(&mut self, id: &PackageId) -> Result<(), GraphError> {
        let idx = self.index_of(id)?;
        if self.nodes[idx].status != BuildStatus::Pending {
            return Ok(());
        }
        self.nodes[idx].status = BuildStatus::Succeeded;
        self.nodes[idx].detail = Some("restored from ledger".to_string());
        for &dep_idx in &self.dependents[idx].clone() {
            self.unmet[dep_idx] -= 1;
        }
        Ok(())
    }

    /// All transitive dependents of a package, for cascading skips
    pub fn transitive_dependents(&self, id: &PackageId) -> Result<Vec<PackageId>, GraphError> {
        let idx = self.index_of(id)?;
        let mut seen = HashSet::new();
        let mut stack: Vec<usize> = self.dependents[idx].clone();
        let mut result = Vec::new();
        while let Some(i) = stack.pop() {
            if seen.insert(i) {
                result.push(self.nodes[i].id.clone());
                stack.extend(&self.dependents[i]);
            }
        }
        Ok(result)
    }

    /// Transitive dependent count, the scheduler's priority key
    pub fn dependent_weight(&self, id: &PackageId) -> usize {
        self.index.get(id).map_or(0, |&i| self.weight[i])
    }

    /// Position in recipe-tree insertion order, the deterministic tie-break
    pub fn insertion_index(&self, id: &PackageId) -> usize {
        self.index.get(id).copied().unwrap_or(usize::MAX)
    }

    /// Look up a node
    pub fn node(&self, id: &PackageId) -> Option<&PackageNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// All nodes in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &PackageNode> {
        self.nodes.iter()
    }

    /// Number of packages not yet at a terminal status
    pub fn remaining(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| !n.status.is_terminal())
            .count()
    }

    fn index_of(&self, id: &PackageId) -> Result<usize, GraphError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::UnknownPackage {
                package: id.to_string(),
            })
    }

    fn transition(
        &mut self,
        idx: usize,
        status: BuildStatus,
        detail: Option<String>,
    ) -> Result<(), GraphError> {
        let node = &mut self.nodes[idx];
        if !node.status.can_transition_to(status) {
            return Err(GraphError::InvalidTransition {
                package: node.id.to_string(),
                from: node.status.to_string(),
                to: status.to_string(),
            });
        }
        node.status = status;
        if detail.is_some() {
            node.detail = detail;
        }
        match status {
            BuildStatus::Building => node.started_at = Some(now_unix_millis()),
            s if s.is_terminal() => node.finished_at = Some(now_unix_millis()),
            _ => {}
        }
        Ok(())
    }
}

/// Three-color depth-first cycle detection
///
/// White = unvisited, gray = on the current DFS path, black = done. A
/// build-time edge into a gray node is a back-edge; the reported cycle is
/// the path segment from that node to the top of the stack.
fn detect_cycles(nodes: &[PackageNode], depends_on: &[Vec<usize>]) -> Result<(), GraphError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn visit(
        node: usize,
        nodes: &[PackageNode],
        depends_on: &[Vec<usize>],
        colors: &mut [Color],
        path: &mut Vec<usize>,
    ) -> Result<(), GraphError> {
        colors[node] = Color::Gray;
        path.push(node);

        for &dep in &depends_on[node] {
            match colors[dep] {
                Color::Gray => {
                    // Back-edge: the cycle is everything on the path from
                    // the first occurrence of `dep`, closed back on itself.
                    let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|&n| nodes[n].id.to_string()).collect();
                    cycle.push(nodes[dep].id.to_string());
                    return Err(GraphError::CircularDependency { cycle });
                }
                Color::White => visit(dep, nodes, depends_on, colors, path)?,
                Color::Black => {}
            }
        }

        path.pop();
        colors[node] = Color::Black;
        Ok(())
    }

    let mut colors = vec![Color::White; nodes.len()];
    let mut path = Vec::new();
    for node in 0..nodes.len() {
        if colors[node] == Color::White {
            visit(node, nodes, depends_on, &mut colors, &mut path)?;
        }
    }
    Ok(())
}

/// Count transitive dependents per node
///
/// Counts are sets, not sums: a diamond dependent is counted once. Runs
/// once at construction; the graph's edges never change afterwards.
fn compute_weights(dependents: &[Vec<usize>]) -> Vec<usize> {
    (0..dependents.len())
        .map(|start| {
            let mut seen = HashSet::new();
            let mut stack: Vec<usize> = dependents[start].clone();
            while let Some(i) = stack.pop() {
                if seen.insert(i) {
                    stack.extend(&dependents[i]);
                }
            }
            seen.len()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::recipe::{BrokenRecipe, RecipeRecord};
    use std::path::PathBuf;

    fn record(id: &str, build_deps: &[&str]) -> RecipeRecord {
        RecipeRecord {
            id: id.parse().unwrap(),
            build_depends: build_deps.iter().map(|d| d.parse().unwrap()).collect(),
            run_depends: Vec::new(),
            command: "true".to_string(),
            path: PathBuf::from("recipe.toml"),
        }
    }

    fn set_of(records: Vec<RecipeRecord>) -> RecipeSet {
        RecipeSet {
            records,
            broken: Vec::new(),
        }
    }

    fn id(s: &str) -> PackageId {
        s.parse().unwrap()
    }

    #[test]
    fn test_simple_dependency_order() {
        let graph = Graph::build(&set_of(vec![
            record("apps/app", &["devel/lib"]),
            record("devel/lib", &[]),
        ]))
        .unwrap();

        assert_eq!(graph.ready_frontier(), vec![id("devel/lib")]);
    }

    #[test]
    fn test_missing_dependency_is_fatal() {
        let result = Graph::build(&set_of(vec![record("apps/app", &["devel/nope"])]));
        assert!(matches!(
            result,
            Err(GraphError::MissingDependency { .. })
        ));
    }

    #[test]
    fn test_missing_run_dependency_is_fatal() {
        let mut rec = record("apps/app", &[]);
        rec.run_depends = vec![id("devel/nope")];
        let result = Graph::build(&set_of(vec![rec]));
        assert!(matches!(
            result,
            Err(GraphError::MissingDependency { .. })
        ));
    }

    #[test]
    fn test_cycle_detection_names_all_members() {
        let result = Graph::build(&set_of(vec![
            record("x/a", &["x/b"]),
            record("x/b", &["x/c"]),
            record("x/c", &["x/a"]),
        ]));

        match result {
            Err(GraphError::CircularDependency { cycle }) => {
                for member in ["x/a", "x/b", "x/c"] {
                    assert!(cycle.contains(&member.to_string()), "missing {member}");
                }
                // Closed: first and last entries match.
                assert_eq!(cycle.first(), cycle.last());
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_self_cycle_detected() {
        let result = Graph::build(&set_of(vec![record("x/a", &["x/a"])]));
        assert!(matches!(
            result,
            Err(GraphError::CircularDependency { .. })
        ));
    }

    #[test]
    fn test_mark_terminal_unlocks_dependents() {
        let mut graph = Graph::build(&set_of(vec![
            record("x/a", &[]),
            record("x/b", &["x/a"]),
        ]))
        .unwrap();

        assert_eq!(graph.ready_frontier(), vec![id("x/a")]);

        graph.mark_status(&id("x/a"), BuildStatus::Queued).unwrap();
        graph.mark_status(&id("x/a"), BuildStatus::Building).unwrap();
        let unlocked = graph
            .mark_terminal(&id("x/a"), BuildStatus::Succeeded, None)
            .unwrap();
        assert_eq!(unlocked, vec![id("x/b")]);
    }

    #[test]
    fn test_diamond_unlocks_only_when_both_sides_done() {
        let mut graph = Graph::build(&set_of(vec![
            record("x/a", &[]),
            record("x/b", &["x/a"]),
            record("x/c", &["x/a"]),
            record("x/d", &["x/b", "x/c"]),
        ]))
        .unwrap();

        let a = id("x/a");
        let b = id("x/b");
        let c = id("x/c");

        graph.mark_status(&a, BuildStatus::Queued).unwrap();
        graph.mark_status(&a, BuildStatus::Building).unwrap();
        let unlocked = graph.mark_terminal(&a, BuildStatus::Succeeded, None).unwrap();
        assert_eq!(unlocked.len(), 2);

        graph.mark_status(&b, BuildStatus::Queued).unwrap();
        graph.mark_status(&b, BuildStatus::Building).unwrap();
        let unlocked = graph.mark_terminal(&b, BuildStatus::Succeeded, None).unwrap();
        assert!(unlocked.is_empty(), "d must wait for c");

        graph.mark_status(&c, BuildStatus::Queued).unwrap();
        graph.mark_status(&c, BuildStatus::Building).unwrap();
        let unlocked = graph.mark_terminal(&c, BuildStatus::Succeeded, None).unwrap();
        assert_eq!(unlocked, vec![id("x/d")]);
    }

    #[test]
    fn test_transitive_dependents() {
        let graph = Graph::build(&set_of(vec![
            record("x/a", &[]),
            record("x/b", &["x/a"]),
            record("x/c", &["x/b"]),
            record("x/other", &[]),
        ]))
        .unwrap();

        let mut deps = graph.transitive_dependents(&id("x/a")).unwrap();
        deps.sort();
        assert_eq!(deps, vec![id("x/b"), id("x/c")]);
        assert!(graph.transitive_dependents(&id("x/other")).unwrap().is_empty());
    }

    #[test]
    fn test_dependent_weight_counts_diamond_once() {
        let graph = Graph::build(&set_of(vec![
            record("x/a", &[]),
            record("x/b", &["x/a"]),
            record("x/c", &["x/a"]),
            record("x/d", &["x/b", "x/c"]),
        ]))
        .unwrap();

        // b, c, d; d reached via both sides counts once.
        assert_eq!(graph.dependent_weight(&id("x/a")), 3);
        assert_eq!(graph.dependent_weight(&id("x/b")), 1);
        assert_eq!(graph.dependent_weight(&id("x/d")), 0);
    }

    #[test]
    fn test_broken_recipes_enter_failed() {
        let set = RecipeSet {
            records: vec![record("x/good", &[])],
            broken: vec![BrokenRecipe {
                id: id("x/bad"),
                error: "syntax".to_string(),
                path: PathBuf::from("x/bad/recipe.toml"),
            }],
        };
        let graph = Graph::build(&set).unwrap();

        assert_eq!(graph.node(&id("x/bad")).unwrap().status, BuildStatus::Failed);
        assert_eq!(graph.ready_frontier(), vec![id("x/good")]);
    }

    #[test]
    fn test_presatisfied_unlocks_dependents() {
        let mut graph = Graph::build(&set_of(vec![
            record("x/a", &[]),
            record("x/b", &["x/a"]),
        ]))
        .unwrap();

        graph.mark_presatisfied(&id("x/a")).unwrap();
        assert_eq!(graph.ready_frontier(), vec![id("x/b")]);
        assert_eq!(
            graph.node(&id("x/a")).unwrap().status,
            BuildStatus::Succeeded
        );
    }

    #[test]
    fn test_backward_transition_rejected() {
        let mut graph = Graph::build(&set_of(vec![record("x/a", &[])])).unwrap();
        let a = id("x/a");
        graph.mark_status(&a, BuildStatus::Queued).unwrap();
        graph.mark_status(&a, BuildStatus::Building).unwrap();
        graph.mark_terminal(&a, BuildStatus::Succeeded, None).unwrap();

        let result = graph.mark_status(&a, BuildStatus::Queued);
        assert!(matches!(result, Err(GraphError::InvalidTransition { .. })));
    }

    #[test]
    fn test_skipped_from_building_rejected() {
        let mut graph = Graph::build(&set_of(vec![record("x/a", &[])])).unwrap();
        let a = id("x/a");
        graph.mark_status(&a, BuildStatus::Queued).unwrap();
        graph.mark_status(&a, BuildStatus::Building).unwrap();

        let result = graph.mark_terminal(&a, BuildStatus::Skipped, None);
        assert!(matches!(result, Err(GraphError::InvalidTransition { .. })));
    }
}
