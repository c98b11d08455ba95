use std::collections::{HashMap, HashSet};

use thiserror::Error;

use super::spec::{EdgeSpec, NodeSpec};

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("edge references unknown node: {0}")]
    UnknownEndpoint(String),

    #[error("self-loop on node: {0}")]
    SelfLoop(String),

    #[error("duplicate edge: {0} -> {1}")]
    DuplicateEdge(String, String),

    #[error("cycle detected in workflow; unprocessed nodes: {unprocessed:?}")]
    CycleDetected { unprocessed: Vec<String> },
}

/// Dependency resolver over a workflow graph.
///
/// Nodes live in an arena addressed by dense index, with a sibling map from
/// spec node id to index. Parents and children are kept as sorted index
/// lists so adjacency lookups are cheap during execution.
#[derive(Debug, Clone)]
pub struct DagResolver {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    parents: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
    in_degree: Vec<usize>,
}

impl DagResolver {
    /// Build adjacency and in-degree structures from a node/edge list.
    ///
    /// Rejects duplicate node ids, unknown edge endpoints, self-loops and
    /// multi-edges. Cycle detection is deferred to [`DagResolver::levels`].
    pub fn build(nodes: &[NodeSpec], edges: &[EdgeSpec]) -> Result<Self, GraphError> {
        let mut ids = Vec::with_capacity(nodes.len());
        let mut index = HashMap::with_capacity(nodes.len());

        for node in nodes {
            if index.insert(node.id.clone(), ids.len()).is_some() {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
            ids.push(node.id.clone());
        }

        let mut parents = vec![Vec::new(); ids.len()];
        let mut children = vec![Vec::new(); ids.len()];
        let mut in_degree = vec![0usize; ids.len()];
        let mut seen_edges = HashSet::new();

        for edge in edges {
            let source = *index
                .get(&edge.source)
                .ok_or_else(|| GraphError::UnknownEndpoint(edge.source.clone()))?;
            let target = *index
                .get(&edge.target)
                .ok_or_else(|| GraphError::UnknownEndpoint(edge.target.clone()))?;

            if source == target {
                return Err(GraphError::SelfLoop(edge.source.clone()));
            }
            if !seen_edges.insert((source, target)) {
                return Err(GraphError::DuplicateEdge(
                    edge.source.clone(),
                    edge.target.clone(),
                ));
            }

            children[source].push(target);
            parents[target].push(source);
            in_degree[target] += 1;
        }

        for list in parents.iter_mut().chain(children.iter_mut()) {
            list.sort_unstable();
        }

        Ok(Self {
            ids,
            index,
            parents,
            children,
            in_degree,
        })
    }

    /// Level-grouped topological ordering via Kahn's algorithm.
    ///
    /// Rather than a flat order, each emitted frontier becomes one level:
    /// all nodes in a level have their dependencies satisfied by earlier
    /// levels and may run in parallel. An empty graph yields no levels; a
    /// cycle is reported with the residual unprocessed node set.
    pub fn levels(&self) -> Result<Vec<Vec<String>>, GraphError> {
        if self.ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut in_degree = self.in_degree.clone();
        let mut frontier: Vec<usize> = (0..self.ids.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();

        if frontier.is_empty() {
            // No starting nodes at all: every node sits on or behind a
            // cycle.
            return Err(GraphError::CycleDetected {
                unprocessed: self.ids.clone(),
            });
        }

        let mut levels = Vec::new();
        let mut processed = 0usize;

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for &node in &frontier {
                for &child in &self.children[node] {
                    in_degree[child] -= 1;
                    if in_degree[child] == 0 {
                        next.push(child);
                    }
                }
            }

            processed += frontier.len();
            levels.push(frontier.iter().map(|&i| self.ids[i].clone()).collect());
            frontier = next;
        }

        if processed != self.ids.len() {
            let unprocessed = (0..self.ids.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.ids[i].clone())
                .collect();
            return Err(GraphError::CycleDetected { unprocessed });
        }

        Ok(levels)
    }

    /// Direct dependencies of a node (parent node ids).
    pub fn parents(&self, node_id: &str) -> Vec<String> {
        self.adjacency(node_id, &self.parents)
    }

    /// Direct dependents of a node (child node ids).
    pub fn children(&self, node_id: &str) -> Vec<String> {
        self.adjacency(node_id, &self.children)
    }

    /// Whether every dependency of `node_id` is already completed.
    pub fn can_execute(&self, node_id: &str, completed: &HashSet<String>) -> bool {
        match self.index.get(node_id) {
            Some(&i) => self.parents[i]
                .iter()
                .all(|&p| completed.contains(&self.ids[p])),
            None => false,
        }
    }

    /// All nodes not yet completed whose dependencies are all completed.
    pub fn ready(&self, completed: &HashSet<String>) -> Vec<String> {
        self.ids
            .iter()
            .filter(|id| !completed.contains(*id) && self.can_execute(id, completed))
            .cloned()
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn adjacency(&self, node_id: &str, lists: &[Vec<usize>]) -> Vec<String> {
        self.index
            .get(node_id)
            .map(|&i| lists[i].iter().map(|&j| self.ids[j].clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::spec::NodeType;

    fn node(id: &str) -> NodeSpec {
        NodeSpec {
            id: id.to_string(),
            node_type: NodeType::Action,
            name: None,
            agent_id: None,
            data: serde_json::Value::Null,
        }
    }

    fn edge(source: &str, target: &str) -> EdgeSpec {
        EdgeSpec {
            source: source.to_string(),
            target: target.to_string(),
        }
    }

    fn diamond() -> DagResolver {
        //   a
        //  / \
        // b   c
        //  \ /
        //   d
        DagResolver::build(
            &[node("a"), node("b"), node("c"), node("d")],
            &[edge("a", "b"), edge("a", "c"), edge("b", "d"), edge("c", "d")],
        )
        .unwrap()
    }

    #[test]
    fn diamond_levels() {
        let levels = diamond().levels().unwrap();

        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], vec!["a"]);
        assert!(levels[1].contains(&"b".to_string()));
        assert!(levels[1].contains(&"c".to_string()));
        assert_eq!(levels[2], vec!["d"]);
    }

    #[test]
    fn empty_graph_has_no_levels() {
        let resolver = DagResolver::build(&[], &[]).unwrap();
        assert!(resolver.levels().unwrap().is_empty());
    }

    #[test]
    fn single_node_is_one_level() {
        let resolver = DagResolver::build(&[node("solo")], &[]).unwrap();
        assert_eq!(resolver.levels().unwrap(), vec![vec!["solo".to_string()]]);
    }

    #[test]
    fn disconnected_components_share_levels() {
        let resolver = DagResolver::build(
            &[node("a"), node("b"), node("x"), node("y")],
            &[edge("a", "b"), edge("x", "y")],
        )
        .unwrap();

        let levels = resolver.levels().unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].len(), 2);
        assert_eq!(levels[1].len(), 2);
    }

    #[test]
    fn cycle_reports_unprocessed_nodes() {
        let resolver = DagResolver::build(
            &[node("a"), node("b"), node("c")],
            &[edge("a", "b"), edge("b", "c"), edge("c", "b")],
        )
        .unwrap();

        match resolver.levels() {
            Err(GraphError::CycleDetected { unprocessed }) => {
                assert!(unprocessed.contains(&"b".to_string()));
                assert!(unprocessed.contains(&"c".to_string()));
                assert!(!unprocessed.contains(&"a".to_string()));
            }
            other => panic!("expected CycleDetected, got {:?}", other),
        }
    }

    #[test]
    fn fully_cyclic_graph_is_a_cycle_of_everything() {
        let resolver = DagResolver::build(
            &[node("a"), node("b")],
            &[edge("a", "b"), edge("b", "a")],
        )
        .unwrap();
        match resolver.levels() {
            Err(GraphError::CycleDetected { unprocessed }) => {
                assert_eq!(unprocessed.len(), 2);
            }
            other => panic!("expected CycleDetected, got {:?}", other),
        }
    }

    #[test]
    fn unknown_endpoint_is_rejected() {
        let result = DagResolver::build(&[node("a")], &[edge("a", "ghost")]);
        assert!(matches!(result, Err(GraphError::UnknownEndpoint(id)) if id == "ghost"));
    }

    #[test]
    fn adjacency_lookups() {
        let resolver = diamond();
        assert_eq!(resolver.parents("d"), vec!["b", "c"]);
        assert_eq!(resolver.children("a"), vec!["b", "c"]);
        assert!(resolver.parents("a").is_empty());
    }

    #[test]
    fn readiness_tracks_completed_set() {
        let resolver = diamond();
        let mut completed = HashSet::new();

        assert_eq!(resolver.ready(&completed), vec!["a"]);
        assert!(!resolver.can_execute("d", &completed));

        completed.insert("a".to_string());
        let ready = resolver.ready(&completed);
        assert_eq!(ready.len(), 2);
        assert!(ready.contains(&"b".to_string()));

        completed.insert("b".to_string());
        completed.insert("c".to_string());
        assert_eq!(resolver.ready(&completed), vec!["d"]);
        assert!(resolver.can_execute("d", &completed));
    }
}
