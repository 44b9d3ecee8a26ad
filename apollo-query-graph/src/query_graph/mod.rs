use std::fmt::Display;
use std::fmt::Formatter;
use std::hash::Hash;
use std::sync::Arc;

use apollo_compiler::Name;
use apollo_compiler::collections::IndexMap;
use apollo_compiler::collections::IndexSet;
use petgraph::Direction;
use petgraph::graph::DiGraph;
use petgraph::graph::EdgeIndex;
use petgraph::graph::EdgeReference;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::bail;
use crate::error::FederationError;
use crate::error::SingleFederationError;
use crate::link::federation_spec_definition::EXTERNAL_DIRECTIVE_NAME;
use crate::link::federation_spec_definition::KEY_DIRECTIVE_NAME;
use crate::link::federation_spec_definition::key_directive_arguments;
use crate::operation::Selection;
use crate::operation::SelectionSet;
use crate::query_graph::non_local_selections_estimation::NonLocalSelectionsMetadata;
use crate::query_plan::query_planner::EnabledOverrideConditions;
use crate::schema::ValidFederationSchema;
use crate::schema::field_set::parse_field_set;
use crate::schema::position::CompositeTypeDefinitionPosition;
use crate::schema::position::FieldDefinitionPosition;
use crate::schema::position::OutputTypeDefinitionPosition;
use crate::schema::position::SchemaRootDefinitionKind;

mod base_query_graph;
pub mod build_query_graph;
pub(crate) mod condition_resolver;
pub(crate) mod graph_path;
pub(crate) mod non_local_selections_estimation;
pub mod output;
pub(crate) mod path_tree;

pub use build_query_graph::build_federated_query_graph;
pub use build_query_graph::build_query_graph;

/// The source name used by the synthetic root nodes of federated query graphs.
pub(crate) const FEDERATED_GRAPH_ROOT_SOURCE: &str = "_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueryGraphNode {
    /// Type of the node.
    pub(crate) type_: QueryGraphNodeType,
    /// Schema the type belongs to. In federated graphs this is a subgraph name.
    pub(crate) source: Arc<str>,
    /// Whether some cross-subgraph edge is reachable from here.
    pub(crate) has_reachable_cross_subgraph_edges: bool,
    /// Set on the copies made for a @provides application, all sharing the same id. Such copies
    /// carry the provided edges, so a type can have several nodes in one subgraph.
    pub(crate) provide_id: Option<u32>,
    /// Root kind, when this is a root node.
    pub(crate) root_kind: Option<SchemaRootDefinitionKind>,
}

impl Display for QueryGraphNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.type_, self.source)?;
        if let Some(provide_id) = self.provide_id {
            write!(f, "-{provide_id}")?;
        }
        if self.root_kind.is_some() {
            write!(f, "*")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::From)]
pub(crate) enum QueryGraphNodeType {
    SchemaType(OutputTypeDefinitionPosition),
    FederatedRootType(SchemaRootDefinitionKind),
}

impl Display for QueryGraphNodeType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryGraphNodeType::SchemaType(pos) => pos.fmt(f),
            QueryGraphNodeType::FederatedRootType(root_kind) => write!(f, "[{root_kind}]"),
        }
    }
}

impl TryFrom<QueryGraphNodeType> for CompositeTypeDefinitionPosition {
    type Error = FederationError;

    fn try_from(value: QueryGraphNodeType) -> Result<Self, Self::Error> {
        match value {
            QueryGraphNodeType::SchemaType(ty) => Ok(ty.try_into()?),
            QueryGraphNodeType::FederatedRootType(_) => Err(FederationError::internal(format!(
                r#"Type "{value}" was unexpectedly not a composite type"#
            ))),
        }
    }
}

/// The label and boolean value of a progressive `@override`: the edge can only be taken when the
/// label's enablement matches `condition`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub(crate) struct OverrideCondition {
    pub(crate) label: String,
    pub(crate) condition: bool,
}

impl OverrideCondition {
    pub(crate) fn check(&self, override_conditions: &EnabledOverrideConditions) -> bool {
        self.condition == override_conditions.contains(&self.label)
    }
}

impl Display for OverrideCondition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} = {}", self.label, self.condition)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct QueryGraphEdge {
    /// What taking the edge does in the underlying schema.
    pub(crate) transition: QueryGraphEdgeTransition,
    /// Selections that must be collectable from the head before the edge can be taken: key
    /// fields, @requires field sets, or `__typename` for @interfaceObject fake downcasts.
    pub(crate) conditions: Option<Arc<SelectionSet>>,
    /// Set on the edges of a field under a labelled @override.
    pub(crate) override_condition: Option<OverrideCondition>,
}

impl QueryGraphEdge {
    pub(crate) fn satisfies_override_conditions(
        &self,
        override_conditions: &EnabledOverrideConditions,
    ) -> bool {
        self.override_condition
            .as_ref()
            .is_none_or(|condition| condition.check(override_conditions))
    }
}

impl Display for QueryGraphEdge {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if matches!(
            self.transition,
            QueryGraphEdgeTransition::SubgraphEnteringTransition
        ) && self.conditions.is_none()
        {
            return Ok(());
        }
        match (&self.override_condition, &self.conditions) {
            (Some(override_condition), Some(conditions)) => write!(
                f,
                "{}, {override_condition} ⊢ {}",
                conditions, self.transition
            ),
            (Some(override_condition), None) => {
                write!(f, "{override_condition} ⊢ {}", self.transition)
            }
            (None, Some(conditions)) => write!(f, "{conditions} ⊢ {}", self.transition),
            (None, None) => self.transition.fmt(f),
        }
    }
}

/// What an edge stands for in the underlying schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum QueryGraphEdgeTransition {
    /// Collects a field, from its parent type to its base type.
    FieldCollection {
        /// Schema defining the field.
        source: Arc<str>,
        /// The field.
        field_definition_position: FieldDefinitionPosition,
        /// Set on edges added for a @provides.
        is_part_of_provides: bool,
    },
    /// Type condition from a composite type to an intersecting one.
    Downcast {
        /// Schema defining both types.
        source: Arc<str>,
        /// Type of the enclosing selection set.
        from_type_position: CompositeTypeDefinitionPosition,
        /// Type after `... on`.
        to_type_position: CompositeTypeDefinitionPosition,
    },
    /// Entity jump between subgraphs. Always conditioned on the key fields.
    KeyResolution,
    /// Jump between same-kind roots of two subgraphs.
    RootTypeResolution {
        /// Root kind.
        root_kind: SchemaRootDefinitionKind,
    },
    /// From a federated root into a subgraph root. Matches no schema element.
    SubgraphEnteringTransition,
    /// Type condition taken on an @interfaceObject type. The edge loops on the interface object,
    /// since the implementation named by `to_type_name` isn't in that subgraph.
    InterfaceObjectFakeDownCast {
        /// Subgraph of the @interfaceObject.
        source: Arc<str>,
        /// Type of the enclosing selection set.
        from_type_position: CompositeTypeDefinitionPosition,
        /// Implementation after `... on`.
        to_type_name: Name,
    },
}

impl QueryGraphEdgeTransition {
    pub(crate) fn collect_operation_elements(&self) -> bool {
        match self {
            QueryGraphEdgeTransition::FieldCollection { .. } => true,
            QueryGraphEdgeTransition::Downcast { .. } => true,
            QueryGraphEdgeTransition::KeyResolution => false,
            QueryGraphEdgeTransition::RootTypeResolution { .. } => false,
            QueryGraphEdgeTransition::SubgraphEnteringTransition => false,
            QueryGraphEdgeTransition::InterfaceObjectFakeDownCast { .. } => true,
        }
    }
}

impl Display for QueryGraphEdgeTransition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryGraphEdgeTransition::FieldCollection {
                field_definition_position,
                ..
            } => write!(f, "{}", field_definition_position.field_name()),
            QueryGraphEdgeTransition::Downcast {
                to_type_position, ..
            } => write!(f, "... on {}", to_type_position.type_name()),
            QueryGraphEdgeTransition::KeyResolution => write!(f, "key()"),
            QueryGraphEdgeTransition::RootTypeResolution { root_kind } => {
                write!(f, "{root_kind}()")
            }
            QueryGraphEdgeTransition::SubgraphEnteringTransition => write!(f, "∅"),
            QueryGraphEdgeTransition::InterfaceObjectFakeDownCast { to_type_name, .. } => {
                write!(f, "... on {to_type_name}")
            }
        }
    }
}

#[derive(Debug)]
pub struct QueryGraph {
    /// Source that new nodes are attached to. It changes per subgraph while a federated graph is
    /// built, and ends up as FEDERATED_GRAPH_ROOT_SOURCE.
    current_source: Arc<str>,
    /// Nodes are never removed. Edges are only replaced while @provides copies are built, so
    /// indices are stable once the graph is built.
    graph: DiGraph<QueryGraphNode, QueryGraphEdge>,
    /// Schemas keyed by source name. Every node and edge source is a key here.
    sources: IndexMap<Arc<str>, ValidFederationSchema>,
    /// `sources` minus FEDERATED_GRAPH_ROOT_SOURCE.
    subgraphs_by_name: IndexMap<Arc<str>, ValidFederationSchema>,
    /// The supergraph API schema, for federated graphs only.
    supergraph_schema: Option<ValidFederationSchema>,
    /// Per source, type name to nodes. The federated root source maps to the nodes of all
    /// subgraphs.
    types_to_nodes_by_source: IndexMap<Arc<str>, IndexMap<Name, IndexSet<NodeIndex>>>,
    /// Per source, root kind to root node.
    root_kinds_to_nodes_by_source:
        IndexMap<Arc<str>, IndexMap<SchemaRootDefinitionKind, NodeIndex>>,
    /// Per edge, the out-edges of its tail worth taking right after it. Chained jumps a single
    /// hop would do better, such as A -> B -> C over the same key, are left out. See
    /// `is_trivial_followup`.
    non_trivial_followup_edges: IndexMap<EdgeIndex, Vec<EdgeIndex>>,
    /// Precomputed data used to estimate the number of non-local selections of an operation before
    /// planning it.
    non_local_selection_metadata: NonLocalSelectionsMetadata,
}

impl QueryGraph {
    pub(crate) fn new(current_source: Arc<str>) -> Self {
        Self {
            current_source,
            graph: Default::default(),
            sources: Default::default(),
            subgraphs_by_name: Default::default(),
            supergraph_schema: None,
            types_to_nodes_by_source: Default::default(),
            root_kinds_to_nodes_by_source: Default::default(),
            non_trivial_followup_edges: Default::default(),
            non_local_selection_metadata: Default::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.current_source
    }

    pub(crate) fn graph(&self) -> &DiGraph<QueryGraphNode, QueryGraphEdge> {
        &self.graph
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub(crate) fn node_weight(&self, node: NodeIndex) -> Result<&QueryGraphNode, FederationError> {
        self.graph.node_weight(node).ok_or_else(|| {
            SingleFederationError::Internal {
                message: "Node unexpectedly missing".to_owned(),
            }
            .into()
        })
    }

    fn node_weight_mut(&mut self, node: NodeIndex) -> Result<&mut QueryGraphNode, FederationError> {
        self.graph.node_weight_mut(node).ok_or_else(|| {
            SingleFederationError::Internal {
                message: "Node unexpectedly missing".to_owned(),
            }
            .into()
        })
    }

    pub(crate) fn edge_weight(&self, edge: EdgeIndex) -> Result<&QueryGraphEdge, FederationError> {
        self.graph.edge_weight(edge).ok_or_else(|| {
            SingleFederationError::Internal {
                message: "Edge unexpectedly missing".to_owned(),
            }
            .into()
        })
    }

    fn edge_weight_mut(&mut self, edge: EdgeIndex) -> Result<&mut QueryGraphEdge, FederationError> {
        self.graph.edge_weight_mut(edge).ok_or_else(|| {
            SingleFederationError::Internal {
                message: "Edge unexpectedly missing".to_owned(),
            }
            .into()
        })
    }

    pub(crate) fn edge_endpoints(
        &self,
        edge: EdgeIndex,
    ) -> Result<(NodeIndex, NodeIndex), FederationError> {
        self.graph.edge_endpoints(edge).ok_or_else(|| {
            SingleFederationError::Internal {
                message: "Edge unexpectedly missing".to_owned(),
            }
            .into()
        })
    }

    pub(crate) fn schema(&self) -> Result<&ValidFederationSchema, FederationError> {
        self.schema_by_source(&self.current_source)
    }

    pub(crate) fn schema_by_source(
        &self,
        source: &str,
    ) -> Result<&ValidFederationSchema, FederationError> {
        self.sources.get(source).ok_or_else(|| {
            SingleFederationError::Internal {
                message: "Schema unexpectedly missing".to_owned(),
            }
            .into()
        })
    }

    pub(crate) fn subgraphs(&self) -> impl Iterator<Item = (&Arc<str>, &ValidFederationSchema)> {
        self.subgraphs_by_name.iter()
    }

    pub(crate) fn supergraph_schema(&self) -> Result<ValidFederationSchema, FederationError> {
        self.supergraph_schema
            .clone()
            .ok_or_else(|| FederationError::internal("Supergraph schema unexpectedly missing"))
    }

    pub(crate) fn types_to_nodes(
        &self,
    ) -> Result<&IndexMap<Name, IndexSet<NodeIndex>>, FederationError> {
        self.types_to_nodes_by_source(&self.current_source)
    }

    pub(crate) fn types_to_nodes_by_source(
        &self,
        source: &str,
    ) -> Result<&IndexMap<Name, IndexSet<NodeIndex>>, FederationError> {
        self.types_to_nodes_by_source.get(source).ok_or_else(|| {
            SingleFederationError::Internal {
                message: "Types-to-nodes map unexpectedly missing".to_owned(),
            }
            .into()
        })
    }

    fn types_to_nodes_mut(
        &mut self,
    ) -> Result<&mut IndexMap<Name, IndexSet<NodeIndex>>, FederationError> {
        self.types_to_nodes_by_source
            .get_mut(&self.current_source)
            .ok_or_else(|| {
                SingleFederationError::Internal {
                    message: "Types-to-nodes map unexpectedly missing".to_owned(),
                }
                .into()
            })
    }

    pub(crate) fn root_kinds_to_nodes(
        &self,
    ) -> Result<&IndexMap<SchemaRootDefinitionKind, NodeIndex>, FederationError> {
        self.root_kinds_to_nodes_by_source(&self.current_source)
    }

    pub(crate) fn root_kinds_to_nodes_by_source(
        &self,
        source: &str,
    ) -> Result<&IndexMap<SchemaRootDefinitionKind, NodeIndex>, FederationError> {
        self.root_kinds_to_nodes_by_source
            .get(source)
            .ok_or_else(|| {
                SingleFederationError::Internal {
                    message: "Root-kinds-to-nodes map unexpectedly missing".to_owned(),
                }
                .into()
            })
    }

    fn root_kinds_to_nodes_mut(
        &mut self,
    ) -> Result<&mut IndexMap<SchemaRootDefinitionKind, NodeIndex>, FederationError> {
        self.root_kinds_to_nodes_by_source
            .get_mut(&self.current_source)
            .ok_or_else(|| {
                SingleFederationError::Internal {
                    message: "Root-kinds-to-nodes map unexpectedly missing".to_owned(),
                }
                .into()
            })
    }

    pub(crate) fn non_trivial_followup_edges(&self) -> &IndexMap<EdgeIndex, Vec<EdgeIndex>> {
        &self.non_trivial_followup_edges
    }

    pub(crate) fn non_local_selection_metadata(&self) -> &NonLocalSelectionsMetadata {
        &self.non_local_selection_metadata
    }

    /// All outward edges from the given node, in creation order. The position of an edge in this
    /// list is its index relative to the head node (see `out_edge()`).
    pub(crate) fn out_edges(
        &self,
        node: NodeIndex,
    ) -> Vec<EdgeReference<'_, QueryGraphEdge>> {
        // petgraph iterates outgoing edges most-recent first.
        let mut edges: Vec<_> = self.graph.edges_directed(node, Direction::Outgoing).collect();
        edges.sort_by_key(|edge| edge.id());
        edges
    }

    /// The edge at the given position in `out_edges(node)`.
    pub fn out_edge(&self, node: NodeIndex, index: usize) -> Option<EdgeIndex> {
        self.out_edges(node).get(index).map(|edge| edge.id())
    }

    /// Returns the (unique) field-collecting edge for the given field name out of `node`, ignoring
    /// edges whose override condition doesn't match.
    pub(crate) fn edge_for_field(
        &self,
        node: NodeIndex,
        field_name: &Name,
        override_conditions: &EnabledOverrideConditions,
    ) -> Result<Option<EdgeIndex>, FederationError> {
        let mut candidates = self.out_edges(node).into_iter().filter_map(|edge_ref| {
            let edge_weight = edge_ref.weight();
            let QueryGraphEdgeTransition::FieldCollection {
                field_definition_position,
                ..
            } = &edge_weight.transition
            else {
                return None;
            };
            if field_definition_position.field_name() == field_name
                && edge_weight.satisfies_override_conditions(override_conditions)
            {
                Some(edge_ref.id())
            } else {
                None
            }
        });
        let Some(candidate) = candidates.next() else {
            return Ok(None);
        };
        if candidates.next().is_some() {
            bail!(
                "Unexpectedly found multiple candidate edges for field \"{}\" on node {}",
                field_name,
                self.node_weight(node)?,
            );
        }
        Ok(Some(candidate))
    }

    /// Returns the downcast (or @interfaceObject fake downcast) edge to the given type out of
    /// `node`, if any.
    pub(crate) fn edge_for_type_name(
        &self,
        node: NodeIndex,
        type_name: &Name,
    ) -> Result<Option<EdgeIndex>, FederationError> {
        let mut candidates = self.out_edges(node).into_iter().filter_map(|edge_ref| {
            let matches = match &edge_ref.weight().transition {
                QueryGraphEdgeTransition::Downcast {
                    to_type_position, ..
                } => to_type_position.type_name() == type_name,
                QueryGraphEdgeTransition::InterfaceObjectFakeDownCast { to_type_name, .. } => {
                    to_type_name == type_name
                }
                _ => false,
            };
            matches.then(|| edge_ref.id())
        });
        let Some(candidate) = candidates.next() else {
            return Ok(None);
        };
        if candidates.next().is_some() {
            bail!(
                "Unexpectedly found multiple candidate edges for type \"{}\" on node {}",
                type_name,
                self.node_weight(node)?,
            );
        }
        Ok(Some(candidate))
    }

    /// The node of `type_name` in `source` that no @provides copied.
    pub(crate) fn non_provides_node(
        &self,
        source: &str,
        type_name: &Name,
    ) -> Result<NodeIndex, FederationError> {
        let nodes = self
            .types_to_nodes_by_source(source)?
            .get(type_name)
            .into_iter()
            .flatten();
        for node in nodes {
            if self.node_weight(*node)?.provide_id.is_none() {
                return Ok(*node);
            }
        }
        bail!("Missing non-provides node for type \"{type_name}\" in subgraph \"{source}\"")
    }

    /// Whether the node's type is marked @interfaceObject in its subgraph.
    pub(crate) fn is_interface_object_node(&self, node: NodeIndex) -> Result<bool, FederationError> {
        let node_weight = self.node_weight(node)?;
        let QueryGraphNodeType::SchemaType(OutputTypeDefinitionPosition::Object(type_pos)) =
            &node_weight.type_
        else {
            return Ok(false);
        };
        Ok(self
            .schema_by_source(&node_weight.source)?
            .is_interface_object_type(&type_pos.type_name))
    }

    /// Returns the first resolvable key of the node's type that selects no @external field, parsed
    /// in the node's subgraph. Note that this is not perfect, as we may be unable to satisfy that
    /// key while another one would have worked.
    pub(crate) fn locally_satisfiable_key(
        &self,
        node: NodeIndex,
    ) -> Result<Option<SelectionSet>, FederationError> {
        let node_weight = self.node_weight(node)?;
        let QueryGraphNodeType::SchemaType(type_pos) = &node_weight.type_ else {
            bail!("Unexpectedly looked for a key on a federated root node");
        };
        let schema = self.schema_by_source(&node_weight.source)?;
        let Some(type_) = schema.schema().types.get(type_pos.type_name()) else {
            bail!(
                "Type \"{}\" unexpectedly missing from subgraph \"{}\"",
                type_pos,
                node_weight.source,
            );
        };
        for application in type_.directives().get_all(&KEY_DIRECTIVE_NAME) {
            let arguments = key_directive_arguments(application)?;
            if !arguments.resolvable {
                continue;
            }
            let key = parse_field_set(schema, type_pos.type_name().clone(), arguments.fields)?;
            if !selects_external_field(schema, &key)? {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    /// Renders the graph nodes and edges as JSON, for debugging.
    pub fn to_json(&self) -> serde_json::Value {
        let nodes: Vec<_> = self
            .graph
            .node_indices()
            .map(|i| {
                let node = &self.graph[i];
                serde_json::json!({
                    "id": i.index(),
                    "label": node.type_.to_string(),
                    "source": &*node.source,
                    "provide_id": node.provide_id,
                    "root_kind": node.root_kind,
                })
            })
            .collect();
        let edges: Vec<_> = self
            .graph
            .edge_references()
            .map(|edge| {
                serde_json::json!({
                    "id": edge.id().index(),
                    "head": edge.source().index(),
                    "tail": edge.target().index(),
                    "label": edge.weight().to_string(),
                    "override_condition": edge.weight().override_condition,
                })
            })
            .collect();
        serde_json::json!({
            "name": self.name(),
            "nodes": nodes,
            "edges": edges,
        })
    }
}

fn selects_external_field(
    schema: &ValidFederationSchema,
    selection_set: &SelectionSet,
) -> Result<bool, FederationError> {
    for selection in selection_set.iter() {
        match selection {
            Selection::Field(field_selection) => {
                let position = &field_selection.field.field_position;
                if !position.is_introspection_typename_field()
                    && position
                        .get(schema.schema())?
                        .directives
                        .has(&EXTERNAL_DIRECTIVE_NAME)
                {
                    return Ok(true);
                }
                if let Some(selection_set) = &field_selection.selection_set
                    && selects_external_field(schema, selection_set)?
                {
                    return Ok(true);
                }
            }
            Selection::InlineFragment(fragment_selection) => {
                if selects_external_field(schema, &fragment_selection.selection_set)? {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use super::QueryGraph;
    use super::build_federated_query_graph;
    use crate::subgraph::Subgraph;
    use crate::supergraph::Supergraph;

    /// Builds the federated query graph of the given API schema and `(name, sdl)` subgraphs.
    pub(crate) fn federated_graph(api_schema: &str, subgraphs: &[(&str, &str)]) -> Arc<QueryGraph> {
        let supergraph = Supergraph::new(
            api_schema,
            subgraphs
                .iter()
                .map(|(name, sdl)| Subgraph::new(name, &format!("http://{name}"), sdl)),
        )
        .unwrap();
        Arc::new(build_federated_query_graph(&supergraph).unwrap())
    }
}
