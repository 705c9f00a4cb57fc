use std::collections::{HashMap, HashSet};

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{Bfs, EdgeRef};
use serde_json::Value;

use crate::error::{WorkflowError, WorkflowResult};

use super::schema::GraphSchema;
use super::types::{Edge, IterationErrorPolicy, NodeSpec, NodeType};

/// Immutable workflow graph. Built once from a configuration document and
/// only read during execution, so parallel branches can share it freely.
#[derive(Debug)]
pub struct Graph {
    graph: StableDiGraph<NodeSpec, Edge>,
    node_index_map: HashMap<String, NodeIndex>,
    root_node_id: String,
    /// Parsed source document, kept so container subgraphs can be built
    /// without re-parsing.
    schema: GraphSchema,
}

impl Graph {
    /// Builds a graph, resolving the root as the unique `start` node among
    /// top-level nodes.
    pub fn build(config: &Value) -> WorkflowResult<Graph> {
        let schema = parse_schema(config)?;
        let root = find_start_node(&schema)?;
        Self::from_schema(schema, root, true)
    }

    /// Builds a graph rooted at an explicitly declared node id.
    pub fn build_with_root(config: &Value, root_node_id: &str) -> WorkflowResult<Graph> {
        let schema = parse_schema(config)?;
        if !schema.nodes.iter().any(|n| n.id == root_node_id) {
            return Err(WorkflowError::RootNodeNotFound(root_node_id.to_string()));
        }
        Self::from_schema(schema, root_node_id.to_string(), true)
    }

    /// Builds the restricted graph for one container node: the container
    /// itself plus every node declaring membership in it, with the edges
    /// whose endpoints both survive. Rooted at the member `iteration-start`
    /// node, used to run (or re-run) a single iteration in isolation.
    pub fn build_subgraph(config: &Value, container_id: &str) -> WorkflowResult<Graph> {
        let schema = parse_schema(config)?;
        Self::subgraph_from_schema(&schema, container_id)
    }

    /// Same filtering as [`Graph::build_subgraph`], from the retained schema.
    pub fn subgraph_for(&self, container_id: &str) -> WorkflowResult<Graph> {
        Self::subgraph_from_schema(&self.schema, container_id)
    }

    fn subgraph_from_schema(schema: &GraphSchema, container_id: &str) -> WorkflowResult<Graph> {
        // Transitive membership so nested containers bring their own
        // members along.
        let mut member_ids: HashSet<&str> = HashSet::from([container_id]);
        loop {
            let before = member_ids.len();
            for node in &schema.nodes {
                if let Some(owner) = node.data.iteration_id.as_deref() {
                    if member_ids.contains(owner) {
                        member_ids.insert(node.id.as_str());
                    }
                }
            }
            if member_ids.len() == before {
                break;
            }
        }
        let member_ids: HashSet<&str> = schema
            .nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| member_ids.contains(id))
            .collect();
        if member_ids.len() <= 1 {
            return Err(WorkflowError::GraphConfigError(format!(
                "container `{container_id}` has no member nodes"
            )));
        }

        let filtered = GraphSchema {
            nodes: schema
                .nodes
                .iter()
                .filter(|n| member_ids.contains(n.id.as_str()))
                .cloned()
                .collect(),
            edges: schema
                .edges
                .iter()
                .filter(|e| {
                    member_ids.contains(e.source.as_str())
                        && member_ids.contains(e.target.as_str())
                })
                .cloned()
                .collect(),
        };

        let root = filtered
            .nodes
            .iter()
            .find(|n| n.data.node_type == NodeType::IterationStart)
            .map(|n| n.id.clone())
            .or_else(|| {
                // Fall back to the sole member without an inbound edge.
                filtered
                    .nodes
                    .iter()
                    .filter(|n| n.id != container_id)
                    .find(|n| !filtered.edges.iter().any(|e| e.target == n.id))
                    .map(|n| n.id.clone())
            })
            .ok_or_else(|| {
                WorkflowError::GraphConfigError(format!(
                    "container `{container_id}` has no entry node"
                ))
            })?;

        Self::from_schema(filtered, root, false)
    }

    fn from_schema(
        schema: GraphSchema,
        root_node_id: String,
        check_reachability: bool,
    ) -> WorkflowResult<Graph> {
        let mut graph = StableDiGraph::<NodeSpec, Edge>::new();
        let mut node_index_map: HashMap<String, NodeIndex> = HashMap::new();

        for node in &schema.nodes {
            if node_index_map.contains_key(&node.id) {
                return Err(WorkflowError::DuplicateNodeId(node.id.clone()));
            }
            let spec = NodeSpec {
                id: node.id.clone(),
                node_type: node.data.node_type,
                title: if node.data.title.is_empty() {
                    node.id.clone()
                } else {
                    node.data.title.clone()
                },
                data: node.data.extra.clone(),
                iteration_id: node.data.iteration_id.clone(),
            };
            let idx = graph.add_node(spec);
            node_index_map.insert(node.id.clone(), idx);
        }

        for (i, edge) in schema.edges.iter().enumerate() {
            let edge_id = if edge.id.is_empty() {
                format!("edge-{i}")
            } else {
                edge.id.clone()
            };
            let source_idx = *node_index_map.get(&edge.source).ok_or_else(|| {
                WorkflowError::DanglingEdge {
                    edge_id: edge_id.clone(),
                    node_id: edge.source.clone(),
                }
            })?;
            let target_idx = *node_index_map.get(&edge.target).ok_or_else(|| {
                WorkflowError::DanglingEdge {
                    edge_id: edge_id.clone(),
                    node_id: edge.target.clone(),
                }
            })?;
            graph.add_edge(
                source_idx,
                target_idx,
                Edge {
                    id: edge_id,
                    source: edge.source.clone(),
                    target: edge.target.clone(),
                    source_handle: edge.source_handle.clone(),
                },
            );
        }

        let built = Graph {
            graph,
            node_index_map,
            root_node_id,
            schema,
        };

        if check_reachability {
            built.check_reachability()?;
        }
        Ok(built)
    }

    /// Every top-level node must be reachable from the root. Container
    /// members are exempt, they only exist inside their subgraph.
    fn check_reachability(&self) -> WorkflowResult<()> {
        let reachable = self.reachable_from(&self.root_node_id)?;
        for spec in self.graph.node_weights() {
            if spec.iteration_id.is_some() || spec.id == self.root_node_id {
                continue;
            }
            if !reachable.contains(&spec.id) {
                return Err(WorkflowError::GraphConfigError(format!(
                    "node `{}` is not reachable from root `{}`",
                    spec.id, self.root_node_id
                )));
            }
        }
        Ok(())
    }

    pub fn root_node_id(&self) -> &str {
        &self.root_node_id
    }

    pub fn node(&self, node_id: &str) -> WorkflowResult<&NodeSpec> {
        let idx = self.index_of(node_id)?;
        self.graph
            .node_weight(idx)
            .ok_or_else(|| WorkflowError::NodeNotFound(node_id.to_string()))
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.node_index_map.contains_key(node_id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.graph.node_weights().map(|n| n.id.as_str())
    }

    /// Out-edges in schema declaration order. The adjacency list walks
    /// most-recent-first, so sort back by edge index.
    pub fn out_edges(&self, node_id: &str) -> WorkflowResult<Vec<&Edge>> {
        let idx = self.index_of(node_id)?;
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(idx, petgraph::Direction::Outgoing)
            .collect();
        edges.sort_by_key(|e| e.id().index());
        Ok(edges.into_iter().map(|e| e.weight()).collect())
    }

    /// Targets of unconditional out-edges, in edge insertion order.
    pub fn unconditional_successors(&self, node_id: &str) -> WorkflowResult<Vec<String>> {
        let mut edges = self.out_edges(node_id)?;
        edges.retain(|e| e.is_unconditional());
        Ok(edges.into_iter().map(|e| e.target.clone()).collect())
    }

    /// Targets of out-edges carrying the given conditional handle.
    pub fn successors_for_handle(
        &self,
        node_id: &str,
        handle: &str,
    ) -> WorkflowResult<Vec<String>> {
        let mut edges = self.out_edges(node_id)?;
        edges.retain(|e| e.matches_handle(handle));
        Ok(edges.into_iter().map(|e| e.target.clone()).collect())
    }

    pub fn predecessors(&self, node_id: &str) -> WorkflowResult<Vec<String>> {
        let idx = self.index_of(node_id)?;
        Ok(self
            .graph
            .neighbors_directed(idx, petgraph::Direction::Incoming)
            .filter_map(|n| self.graph.node_weight(n).map(|spec| spec.id.clone()))
            .collect())
    }

    /// Node ids reachable from `node_id`, including itself.
    pub fn reachable_from(&self, node_id: &str) -> WorkflowResult<HashSet<String>> {
        let idx = self.index_of(node_id)?;
        let mut reachable = HashSet::new();
        let mut bfs = Bfs::new(&self.graph, idx);
        while let Some(visited) = bfs.next(&self.graph) {
            if let Some(spec) = self.graph.node_weight(visited) {
                reachable.insert(spec.id.clone());
            }
        }
        Ok(reachable)
    }

    /// Nearest node reachable from every branch head: the barrier join of a
    /// parallel fan-out. `None` when the branches never reconverge.
    pub fn join_node_for(&self, branch_heads: &[String]) -> WorkflowResult<Option<String>> {
        let Some((first, rest)) = branch_heads.split_first() else {
            return Ok(None);
        };
        let mut other_reach = Vec::with_capacity(rest.len());
        for head in rest {
            other_reach.push(self.reachable_from(head)?);
        }

        // BFS order from the first head yields the nearest candidate first.
        let start = self.index_of(first)?;
        let mut bfs = Bfs::new(&self.graph, start);
        while let Some(visited) = bfs.next(&self.graph) {
            let Some(spec) = self.graph.node_weight(visited) else {
                continue;
            };
            if other_reach.iter().all(|r| r.contains(&spec.id)) {
                return Ok(Some(spec.id.clone()));
            }
        }
        Ok(None)
    }

    fn index_of(&self, node_id: &str) -> WorkflowResult<NodeIndex> {
        self.node_index_map
            .get(node_id)
            .copied()
            .ok_or_else(|| WorkflowError::NodeNotFound(node_id.to_string()))
    }
}

fn parse_schema(config: &Value) -> WorkflowResult<GraphSchema> {
    for section in ["nodes", "edges"] {
        match config.get(section) {
            Some(value) if value.is_array() => {}
            _ => return Err(WorkflowError::MissingSection(section)),
        }
    }
    let schema: GraphSchema = serde_json::from_value(config.clone())
        .map_err(|e| WorkflowError::GraphConfigError(e.to_string()))?;

    // Container failure handling is an explicit choice, never a default.
    for node in &schema.nodes {
        if node.data.node_type.is_container() {
            let policy = node.data.extra.get("error_policy").cloned();
            let parsed = policy
                .map(serde_json::from_value::<IterationErrorPolicy>)
                .transpose()
                .ok()
                .flatten();
            if parsed.is_none() {
                return Err(WorkflowError::GraphConfigError(format!(
                    "container `{}` requires `error_policy` (abort | skip-and-continue)",
                    node.id
                )));
            }
        }
    }
    Ok(schema)
}

fn find_start_node(schema: &GraphSchema) -> WorkflowResult<String> {
    let mut starts = schema
        .nodes
        .iter()
        .filter(|n| n.data.node_type == NodeType::Start && n.data.iteration_id.is_none());
    match (starts.next(), starts.next()) {
        (Some(node), None) => Ok(node.id.clone()),
        (Some(_), Some(_)) => Err(WorkflowError::MultipleStartNodes),
        (None, _) => Err(WorkflowError::NoStartNode),
    }
}
