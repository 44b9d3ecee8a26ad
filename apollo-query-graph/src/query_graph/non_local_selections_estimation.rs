use std::sync::Arc;

use apollo_compiler::Name;
use apollo_compiler::collections::IndexMap;
use apollo_compiler::collections::IndexSet;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use tracing::debug;

use crate::error::FederationError;
use crate::operation::Selection;
use crate::operation::SelectionSet;
use crate::query_graph::QueryGraph;
use crate::query_graph::QueryGraphEdgeTransition;
use crate::query_graph::QueryGraphNodeType;
use crate::schema::position::CompositeTypeDefinitionPosition;
use crate::schema::position::OutputTypeDefinitionPosition;
use crate::schema::position::SchemaRootDefinitionKind;
use crate::schema::position::TypeDefinitionPosition;

/// The number of non-local selections above which query planning is aborted.
pub(crate) const MAX_NON_LOCAL_SELECTIONS: u64 = 100_000;

/// Data precomputed from a federated query graph to quickly over-estimate the number of
/// "non-local" selections of an operation, that is selections whose planning may require looking
/// at other subgraphs.
///
/// Every count is taken over the set of nodes a selection may be planned from, including the nodes
/// reachable through keys, so it is an upper bound of the work the traversal actually does.
#[derive(Debug, Default)]
pub(crate) struct NonLocalSelectionsMetadata {
    /// For each node, the field names collectable from it and the node each leads to.
    fields_to_endpoints: IndexMap<NodeIndex, IndexMap<Name, NodeIndex>>,
    /// For each node, the type conditions it can be cast to (downcasts and @interfaceObject fake
    /// downcasts) and the node each leads to.
    inline_fragments_to_endpoints: IndexMap<NodeIndex, IndexMap<Name, NodeIndex>>,
    /// For each abstract type node, the object type nodes it can be downcast to.
    nodes_to_object_downcasts: IndexMap<NodeIndex, IndexMap<Name, NodeIndex>>,
    /// For each composite type node, the nodes of the same type it can reach through keys (the
    /// node itself included). Nodes of a type whose nodes form a complete digraph share the same
    /// set.
    nodes_to_indirect_options: IndexMap<NodeIndex, Arc<IndexSet<NodeIndex>>>,
    /// The types whose nodes can all reach each other with a single key edge.
    complete_digraph_types: IndexSet<Name>,
    /// For each object type node, the @interfaceObject nodes reachable through its keys.
    nodes_to_interface_object_options: IndexMap<NodeIndex, IndexSet<NodeIndex>>,
    /// The subgraph root nodes, by root kind.
    root_kinds_to_nodes: IndexMap<SchemaRootDefinitionKind, IndexSet<NodeIndex>>,
    /// The abstract types whose possible runtime types differ between subgraphs.
    inconsistent_abstract_types: IndexSet<Name>,
}

impl NonLocalSelectionsMetadata {
    pub(crate) fn new(graph: &QueryGraph) -> Result<Self, FederationError> {
        let mut metadata = Self::default();
        metadata.precompute_endpoints(graph)?;
        metadata.precompute_indirect_options(graph)?;
        for (source, _) in graph.subgraphs() {
            for (root_kind, node) in graph.root_kinds_to_nodes_by_source(source)? {
                metadata
                    .root_kinds_to_nodes
                    .entry(*root_kind)
                    .or_default()
                    .insert(*node);
            }
        }
        metadata.inconsistent_abstract_types = inconsistent_abstract_types(graph)?;
        debug!(
            complete_digraph_types = metadata.complete_digraph_types.len(),
            inconsistent_abstract_types = metadata.inconsistent_abstract_types.len(),
            "precomputed non-local selections metadata"
        );
        Ok(metadata)
    }

    fn precompute_endpoints(&mut self, graph: &QueryGraph) -> Result<(), FederationError> {
        for edge_ref in graph.graph().edge_references() {
            let head = edge_ref.source();
            let tail = edge_ref.target();
            match &edge_ref.weight().transition {
                QueryGraphEdgeTransition::FieldCollection {
                    field_definition_position,
                    ..
                } => {
                    self.fields_to_endpoints
                        .entry(head)
                        .or_default()
                        .insert(field_definition_position.field_name().clone(), tail);
                }
                QueryGraphEdgeTransition::Downcast {
                    to_type_position, ..
                } => {
                    self.inline_fragments_to_endpoints
                        .entry(head)
                        .or_default()
                        .insert(to_type_position.type_name().clone(), tail);
                    if to_type_position.is_object_type() {
                        self.nodes_to_object_downcasts
                            .entry(head)
                            .or_default()
                            .insert(to_type_position.type_name().clone(), tail);
                    }
                }
                QueryGraphEdgeTransition::InterfaceObjectFakeDownCast { to_type_name, .. } => {
                    self.inline_fragments_to_endpoints
                        .entry(head)
                        .or_default()
                        .insert(to_type_name.clone(), tail);
                }
                QueryGraphEdgeTransition::KeyResolution
                | QueryGraphEdgeTransition::RootTypeResolution { .. }
                | QueryGraphEdgeTransition::SubgraphEnteringTransition => {}
            }
        }
        Ok(())
    }

    fn precompute_indirect_options(&mut self, graph: &QueryGraph) -> Result<(), FederationError> {
        for (type_name, nodes) in graph.types_to_nodes()? {
            let mut closures = IndexMap::default();
            // @provides copies have no incoming key edge, so only the other nodes decide whether
            // the type forms a complete digraph.
            let mut originals = IndexSet::default();
            for node in nodes {
                closures.insert(*node, same_type_key_closure(graph, *node, type_name)?);
                if graph.node_weight(*node)?.provide_id.is_none() {
                    originals.insert(*node);
                }
            }
            let is_complete_digraph = originals.len() > 1
                && originals.iter().all(|node| {
                    closures
                        .get(node)
                        .is_some_and(|closure| closure.len() == originals.len())
                });
            if is_complete_digraph {
                self.complete_digraph_types.insert(type_name.clone());
                let shared = Arc::new(originals);
                for (node, closure) in closures {
                    let options = if shared.contains(&node) {
                        shared.clone()
                    } else {
                        Arc::new(closure)
                    };
                    self.nodes_to_indirect_options.insert(node, options);
                }
            } else {
                for (node, closure) in closures {
                    self.nodes_to_indirect_options.insert(node, Arc::new(closure));
                }
            }
        }

        for (node, options) in &self.nodes_to_indirect_options {
            let mut interface_objects = IndexSet::default();
            for option in options.iter() {
                for edge_ref in graph.out_edges(*option) {
                    if matches!(
                        edge_ref.weight().transition,
                        QueryGraphEdgeTransition::KeyResolution
                    ) && graph.is_interface_object_node(edge_ref.target())?
                        && !options.contains(&edge_ref.target())
                    {
                        interface_objects.insert(edge_ref.target());
                    }
                }
            }
            if !interface_objects.is_empty() {
                self.nodes_to_interface_object_options
                    .insert(*node, interface_objects);
            }
        }
        Ok(())
    }

    /// The nodes a selection on one of `nodes` may be planned from.
    fn expand_with_indirect_options(&self, nodes: &IndexSet<NodeIndex>) -> IndexSet<NodeIndex> {
        let mut expanded = IndexSet::default();
        for node in nodes {
            expanded.insert(*node);
            if let Some(options) = self.nodes_to_indirect_options.get(node) {
                expanded.extend(options.iter().copied());
            }
            if let Some(options) = self.nodes_to_interface_object_options.get(node) {
                expanded.extend(options.iter().copied());
            }
        }
        expanded
    }

    /// The root nodes of every subgraph for the given root kind.
    pub(crate) fn root_nodes(&self, root_kind: SchemaRootDefinitionKind) -> IndexSet<NodeIndex> {
        self.root_kinds_to_nodes
            .get(&root_kind)
            .cloned()
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn is_complete_digraph_type(&self, type_name: &Name) -> bool {
        self.complete_digraph_types.contains(type_name)
    }

    pub(crate) fn is_inconsistent_abstract_type(&self, type_name: &Name) -> bool {
        self.inconsistent_abstract_types.contains(type_name)
    }

    /// Adds the estimated number of non-local selections of `selection_set`, when planned from
    /// `parent_nodes`, to the state. Returns `true` as soon as the count exceeds `limit`, in which
    /// case the count is only a lower bound of the full estimate.
    pub(crate) fn check_non_local_selections_limit_exceeded(
        &self,
        graph: &QueryGraph,
        selection_set: &SelectionSet,
        parent_nodes: &IndexSet<NodeIndex>,
        state: &mut NonLocalSelectionsState,
        limit: u64,
    ) -> Result<bool, FederationError> {
        let mut any_non_local = false;
        for node in parent_nodes {
            if graph.node_weight(*node)?.has_reachable_cross_subgraph_edges {
                any_non_local = true;
                break;
            }
        }
        if !any_non_local {
            // Everything below can be planned without leaving the subgraph.
            return Ok(false);
        }
        let expanded = self.expand_with_indirect_options(parent_nodes);
        for selection in selection_set.iter() {
            state.count = state.count.saturating_add(expanded.len() as u64);
            if state.count > limit {
                return Ok(true);
            }
            let Some(sub_selection_set) = selection.selection_set() else {
                continue;
            };
            if sub_selection_set.is_empty() {
                continue;
            }
            let next_nodes = match selection {
                Selection::Field(field_selection) => self.next_nodes_for_field(
                    graph,
                    &expanded,
                    field_selection.field.name(),
                )?,
                Selection::InlineFragment(fragment_selection) => self
                    .next_nodes_for_inline_fragment(
                        graph,
                        &expanded,
                        fragment_selection.inline_fragment.type_condition_position.as_ref(),
                    )?,
            };
            if next_nodes.is_empty() {
                continue;
            }
            if self.check_non_local_selections_limit_exceeded(
                graph,
                sub_selection_set,
                &next_nodes,
                state,
                limit,
            )? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn next_nodes_for_field(
        &self,
        graph: &QueryGraph,
        nodes: &IndexSet<NodeIndex>,
        field_name: &Name,
    ) -> Result<IndexSet<NodeIndex>, FederationError> {
        let mut next_nodes = IndexSet::default();
        for node in nodes {
            let direct = self
                .fields_to_endpoints
                .get(node)
                .and_then(|fields| fields.get(field_name));
            if let Some(tail) = direct {
                next_nodes.insert(*tail);
            }
            // Without a direct edge, or when the runtime types of the abstract type may differ in
            // other subgraphs, the traversal type-explodes.
            let explodes = direct.is_none()
                || node_type_name(graph, *node)?
                    .is_some_and(|type_name| self.is_inconsistent_abstract_type(&type_name));
            if !explodes {
                continue;
            }
            let Some(downcasts) = self.nodes_to_object_downcasts.get(node) else {
                continue;
            };
            for downcast in downcasts.values() {
                if let Some(tail) = self
                    .fields_to_endpoints
                    .get(downcast)
                    .and_then(|fields| fields.get(field_name))
                {
                    next_nodes.insert(*tail);
                }
            }
        }
        Ok(next_nodes)
    }

    fn next_nodes_for_inline_fragment(
        &self,
        graph: &QueryGraph,
        nodes: &IndexSet<NodeIndex>,
        type_condition: Option<&CompositeTypeDefinitionPosition>,
    ) -> Result<IndexSet<NodeIndex>, FederationError> {
        let Some(type_condition) = type_condition else {
            return Ok(nodes.clone());
        };
        let supergraph_schema = graph.supergraph_schema()?;
        let mut next_nodes = IndexSet::default();
        for node in nodes {
            if node_type_name(graph, *node)?.as_ref() == Some(type_condition.type_name()) {
                next_nodes.insert(*node);
                continue;
            }
            if let Some(tail) = self
                .inline_fragments_to_endpoints
                .get(node)
                .and_then(|fragments| fragments.get(type_condition.type_name()))
            {
                next_nodes.insert(*tail);
                continue;
            }
            if !type_condition.is_abstract_type() {
                continue;
            }
            let runtime_types = supergraph_schema.possible_runtime_types(type_condition.clone())?;
            if let QueryGraphNodeType::SchemaType(OutputTypeDefinitionPosition::Object(object)) =
                &graph.node_weight(*node)?.type_
            {
                if runtime_types.contains(object) {
                    next_nodes.insert(*node);
                }
                continue;
            }
            if let Some(downcasts) = self.nodes_to_object_downcasts.get(node) {
                for (type_name, tail) in downcasts {
                    if runtime_types
                        .iter()
                        .any(|runtime_type| &runtime_type.type_name == type_name)
                    {
                        next_nodes.insert(*tail);
                    }
                }
            }
        }
        Ok(next_nodes)
    }
}

/// The running count of a non-local selections estimation.
#[derive(Debug, Default)]
pub(crate) struct NonLocalSelectionsState {
    pub(crate) count: u64,
}

fn node_type_name(graph: &QueryGraph, node: NodeIndex) -> Result<Option<Name>, FederationError> {
    Ok(match &graph.node_weight(node)?.type_ {
        QueryGraphNodeType::SchemaType(type_pos) => Some(type_pos.type_name().clone()),
        QueryGraphNodeType::FederatedRootType(_) => None,
    })
}

/// The nodes of type `type_name` reachable from `node` through key edges only (`node` included).
fn same_type_key_closure(
    graph: &QueryGraph,
    node: NodeIndex,
    type_name: &Name,
) -> Result<IndexSet<NodeIndex>, FederationError> {
    let mut closure = IndexSet::default();
    closure.insert(node);
    let mut to_visit = vec![node];
    while let Some(current) = to_visit.pop() {
        for edge_ref in graph.out_edges(current) {
            if !matches!(
                edge_ref.weight().transition,
                QueryGraphEdgeTransition::KeyResolution
            ) {
                continue;
            }
            let tail = edge_ref.target();
            if node_type_name(graph, tail)?.as_ref() == Some(type_name) && closure.insert(tail) {
                to_visit.push(tail);
            }
        }
    }
    Ok(closure)
}

/// The abstract types of the supergraph whose possible runtime types are not the same in every
/// subgraph defining them as abstract (@interfaceObject definitions don't count).
fn inconsistent_abstract_types(graph: &QueryGraph) -> Result<IndexSet<Name>, FederationError> {
    let supergraph_schema = graph.supergraph_schema()?;
    let mut inconsistent = IndexSet::default();
    for type_pos in supergraph_schema.get_types() {
        if !matches!(
            type_pos,
            TypeDefinitionPosition::Interface(_) | TypeDefinitionPosition::Union(_)
        ) {
            continue;
        }
        let mut expected_runtime_types: Option<IndexSet<Name>> = None;
        for (_, subgraph_schema) in graph.subgraphs() {
            let Some(subgraph_type) = subgraph_schema.try_get_type(type_pos.type_name().clone())
            else {
                continue;
            };
            let Ok(subgraph_type) = CompositeTypeDefinitionPosition::try_from(subgraph_type) else {
                continue;
            };
            if subgraph_type.is_object_type() {
                continue;
            }
            let runtime_types: IndexSet<Name> = subgraph_schema
                .possible_runtime_types(subgraph_type)?
                .into_iter()
                .map(|runtime_type| runtime_type.type_name)
                .collect();
            match &expected_runtime_types {
                None => expected_runtime_types = Some(runtime_types),
                Some(expected) if *expected != runtime_types => {
                    inconsistent.insert(type_pos.type_name().clone());
                    break;
                }
                Some(_) => {}
            }
        }
    }
    Ok(inconsistent)
}

#[cfg(test)]
mod tests {
    use apollo_compiler::name;

    use super::*;
    use crate::operation::Operation;
    use crate::query_graph::test_support::federated_graph;

    const API_SCHEMA: &str = r#"
        type Query { t: T i: I }
        interface I { id: ID! }
        type A implements I { id: ID! }
        type B implements I { id: ID! }
        type T { id: ID! u: U x: Int }
        type U { id: ID! y: Int }
    "#;

    const S1: &str = r#"
        type Query { t: T i: I }
        interface I { id: ID! }
        type A implements I { id: ID! }
        type B implements I { id: ID! }
        type T @key(fields: "id") { id: ID! u: U }
        type U @key(fields: "id") { id: ID! }
    "#;

    const S2: &str = r#"
        type Query { s2: Int }
        interface I { id: ID! }
        type A implements I { id: ID! }
        type T @key(fields: "id") { id: ID! x: Int }
        type U @key(fields: "id") { id: ID! y: Int }
    "#;

    fn estimate(graph: &QueryGraph, query: &str) -> u64 {
        let operation =
            Operation::parse(graph.supergraph_schema().unwrap(), query, "query.graphql", None)
                .unwrap();
        let metadata = graph.non_local_selection_metadata();
        let mut state = NonLocalSelectionsState::default();
        let exceeded = metadata
            .check_non_local_selections_limit_exceeded(
                graph,
                &operation.selection_set,
                &metadata.root_nodes(operation.root_kind),
                &mut state,
                MAX_NON_LOCAL_SELECTIONS,
            )
            .unwrap();
        assert!(!exceeded);
        state.count
    }

    #[test]
    fn key_reachable_types_form_complete_digraphs() {
        let graph = federated_graph(API_SCHEMA, &[("S1", S1), ("S2", S2)]);
        let metadata = graph.non_local_selection_metadata();
        assert!(metadata.is_complete_digraph_type(&name!("T")));
        assert!(metadata.is_complete_digraph_type(&name!("U")));
        assert!(!metadata.is_complete_digraph_type(&name!("A")));
        assert!(metadata.is_inconsistent_abstract_type(&name!("I")));
        assert_eq!(metadata.root_nodes(SchemaRootDefinitionKind::Query).len(), 2);
    }

    #[test]
    fn counts_selections_over_every_candidate_node() {
        let graph = federated_graph(API_SCHEMA, &[("S1", S1), ("S2", S2)]);
        // `t` is counted on both query roots, `id` and `x` on both `T` nodes.
        assert_eq!(estimate(&graph, "{ t { id x } }"), 2 + 2 + 2);
        // `u` is only collectable in S1, but `U` can be reached in S2 through its key.
        assert_eq!(estimate(&graph, "{ t { u { y } } }"), 2 + 2 + 2);
    }

    #[test]
    fn single_subgraph_selections_are_local() {
        let graph = federated_graph(API_SCHEMA, &[("S1", S1)]);
        assert_eq!(estimate(&graph, "{ t { id u { id } } }"), 0);
    }

    #[test]
    fn stops_as_soon_as_the_limit_is_exceeded() {
        let graph = federated_graph(API_SCHEMA, &[("S1", S1), ("S2", S2)]);
        let operation = Operation::parse(
            graph.supergraph_schema().unwrap(),
            "{ t { id x } }",
            "query.graphql",
            None,
        )
        .unwrap();
        let metadata = graph.non_local_selection_metadata();
        let mut state = NonLocalSelectionsState::default();
        let exceeded = metadata
            .check_non_local_selections_limit_exceeded(
                &graph,
                &operation.selection_set,
                &metadata.root_nodes(SchemaRootDefinitionKind::Query),
                &mut state,
                3,
            )
            .unwrap();
        assert!(exceeded);
        assert_eq!(state.count, 4);
    }
}
