use std::sync::Arc;

use apollo_compiler::collections::IndexSet;
use apollo_compiler::schema::ExtendedType;
use petgraph::graph::EdgeIndex;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use strum::IntoEnumIterator;

use crate::bail;
use crate::error::FederationError;
use crate::link::federation_spec_definition::ENTITIES_QUERY_FIELD_NAME;
use crate::link::federation_spec_definition::EXTERNAL_DIRECTIVE_NAME;
use crate::link::federation_spec_definition::REQUIRES_DIRECTIVE_NAME;
use crate::link::federation_spec_definition::SERVICE_QUERY_FIELD_NAME;
use crate::operation::SelectionSet;
use crate::query_graph::QueryGraph;
use crate::query_graph::QueryGraphEdge;
use crate::query_graph::QueryGraphEdgeTransition;
use crate::query_graph::QueryGraphNode;
use crate::query_graph::QueryGraphNodeType;
use crate::schema::ValidFederationSchema;
use crate::schema::position::CompositeTypeDefinitionPosition;
use crate::schema::position::FieldDefinitionPosition;
use crate::schema::position::InterfaceTypeDefinitionPosition;
use crate::schema::position::ObjectTypeDefinitionPosition;
use crate::schema::position::OutputTypeDefinitionPosition;
use crate::schema::position::SchemaRootDefinitionKind;
use crate::schema::position::TypeDefinitionPosition;
use crate::schema::position::UnionTypeDefinitionPosition;

/// Low-level builder shared by the schema and federated builders: it owns the query graph being
/// built and knows how to add nodes/edges for the current source.
pub(crate) struct BaseQueryGraphBuilder {
    pub(crate) source: Arc<str>,
    pub(crate) query_graph: QueryGraph,
}

impl BaseQueryGraphBuilder {
    pub(crate) fn new(
        mut query_graph: QueryGraph,
        source: Arc<str>,
        schema: ValidFederationSchema,
    ) -> Self {
        query_graph.current_source = source.clone();
        query_graph.sources.insert(source.clone(), schema);
        query_graph
            .types_to_nodes_by_source
            .insert(source.clone(), Default::default());
        query_graph
            .root_kinds_to_nodes_by_source
            .insert(source.clone(), Default::default());
        Self {
            source,
            query_graph,
        }
    }

    pub(crate) fn add_edge(
        &mut self,
        head: NodeIndex,
        tail: NodeIndex,
        transition: QueryGraphEdgeTransition,
        conditions: Option<Arc<SelectionSet>>,
    ) -> Result<EdgeIndex, FederationError> {
        let edge = self.query_graph.graph.add_edge(
            head,
            tail,
            QueryGraphEdge {
                transition,
                conditions,
                override_condition: None,
            },
        );
        let head_weight = self.query_graph.node_weight(head)?;
        let tail_weight = self.query_graph.node_weight(tail)?;
        if head_weight.source != tail_weight.source {
            self.mark_has_reachable_cross_subgraph_edges(head)?;
        }
        Ok(edge)
    }

    fn mark_has_reachable_cross_subgraph_edges(
        &mut self,
        node: NodeIndex,
    ) -> Result<(), FederationError> {
        self.query_graph
            .node_weight_mut(node)?
            .has_reachable_cross_subgraph_edges = true;
        Ok(())
    }

    pub(crate) fn create_new_node(
        &mut self,
        type_: QueryGraphNodeType,
    ) -> Result<NodeIndex, FederationError> {
        let node = self.query_graph.graph.add_node(QueryGraphNode {
            type_: type_.clone(),
            source: self.query_graph.current_source.clone(),
            has_reachable_cross_subgraph_edges: false,
            provide_id: None,
            root_kind: None,
        });
        if let QueryGraphNodeType::SchemaType(pos) = type_ {
            self.query_graph
                .types_to_nodes_mut()?
                .entry(pos.type_name().clone())
                .or_default()
                .insert(node);
        }
        Ok(node)
    }

    pub(crate) fn create_root_node(
        &mut self,
        type_: QueryGraphNodeType,
        root_kind: SchemaRootDefinitionKind,
    ) -> Result<NodeIndex, FederationError> {
        let node = self.create_new_node(type_)?;
        self.set_as_root(node, root_kind)?;
        Ok(node)
    }

    pub(crate) fn set_as_root(
        &mut self,
        node: NodeIndex,
        root_kind: SchemaRootDefinitionKind,
    ) -> Result<(), FederationError> {
        self.query_graph.node_weight_mut(node)?.root_kind = Some(root_kind);
        self.query_graph
            .root_kinds_to_nodes_mut()?
            .insert(root_kind, node);
        Ok(())
    }

    /// The unique (non-@provides) node of the given type for the current source, if any.
    fn node_for_type(
        &self,
        type_pos: &OutputTypeDefinitionPosition,
    ) -> Result<Option<NodeIndex>, FederationError> {
        let Some(nodes) = self.query_graph.types_to_nodes()?.get(type_pos.type_name()) else {
            return Ok(None);
        };
        for node in nodes {
            if self.query_graph.node_weight(*node)?.provide_id.is_none() {
                return Ok(Some(*node));
            }
        }
        Ok(None)
    }

    /// Propagates `has_reachable_cross_subgraph_edges` backwards along same-subgraph edges, so
    /// that a node is flagged whenever some cross-subgraph (or conditioned) edge can be reached
    /// from it without leaving its subgraph.
    pub(crate) fn propagate_reachable_cross_subgraph_edges(
        &mut self,
    ) -> Result<(), FederationError> {
        let graph = &self.query_graph.graph;
        let mut stack = vec![];
        for node in graph.node_indices() {
            let has_cross_or_conditioned_edge = graph.edges(node).any(|edge| {
                edge.weight().conditions.is_some()
                    || graph[edge.source()].source != graph[edge.target()].source
            });
            if has_cross_or_conditioned_edge {
                stack.push(node);
            }
        }
        let mut marked: IndexSet<NodeIndex> = stack.iter().copied().collect();
        while let Some(node) = stack.pop() {
            for edge in self
                .query_graph
                .graph
                .edges_directed(node, petgraph::Direction::Incoming)
            {
                let head = edge.source();
                if self.query_graph.graph[head].source == self.query_graph.graph[node].source
                    && marked.insert(head)
                {
                    stack.push(head);
                }
            }
        }
        for node in marked {
            self.mark_has_reachable_cross_subgraph_edges(node)?;
        }
        Ok(())
    }

    pub(crate) fn build(self) -> QueryGraph {
        self.query_graph
    }
}

/// What the schema builder needs to know when the schema is a federation subgraph.
#[derive(Debug, Default)]
pub(crate) struct SubgraphBuildOptions {
    /// Fields of this subgraph that another subgraph fully took over with a (non-progressive)
    /// @override.
    pub(crate) overridden_fields: IndexSet<FieldDefinitionPosition>,
}

/// Builds the query graph of a single schema, starting from its root types (and, for subgraphs,
/// its entity types).
pub(crate) struct SchemaQueryGraphBuilder {
    base: BaseQueryGraphBuilder,
    subgraph: Option<SubgraphBuildOptions>,
    pending: Vec<(NodeIndex, CompositeTypeDefinitionPosition)>,
}

impl SchemaQueryGraphBuilder {
    pub(crate) fn new(
        query_graph: QueryGraph,
        source: Arc<str>,
        schema: ValidFederationSchema,
        subgraph: Option<SubgraphBuildOptions>,
    ) -> Self {
        Self {
            base: BaseQueryGraphBuilder::new(query_graph, source, schema),
            subgraph,
            pending: vec![],
        }
    }

    fn schema(&self) -> Result<&ValidFederationSchema, FederationError> {
        self.base.query_graph.schema()
    }

    fn is_federated_subgraph(&self) -> bool {
        self.subgraph.is_some()
    }

    pub(crate) fn build(mut self) -> Result<QueryGraph, FederationError> {
        for root_kind in SchemaRootDefinitionKind::iter() {
            let Some(root_type) = self.schema()?.root_type(root_kind) else {
                continue;
            };
            let node = self.add_type(root_type.into())?;
            self.base.set_as_root(node, root_kind)?;
        }
        if self.is_federated_subgraph() {
            // Entities can be reached through their keys even when no field of the subgraph
            // leads to them.
            let schema = self.schema()?.clone();
            let entity_types: Vec<OutputTypeDefinitionPosition> = schema
                .get_types()
                .filter(|type_pos| {
                    matches!(
                        type_pos,
                        TypeDefinitionPosition::Object(_) | TypeDefinitionPosition::Interface(_)
                    ) && schema.is_entity_type(type_pos.type_name())
                })
                .map(OutputTypeDefinitionPosition::try_from)
                .collect::<Result<_, _>>()?;
            for type_pos in entity_types {
                self.add_type(type_pos)?;
            }
        }
        while let Some((node, type_pos)) = self.pending.pop() {
            match type_pos {
                CompositeTypeDefinitionPosition::Object(pos) => {
                    self.add_object_type_edges(node, pos)?
                }
                CompositeTypeDefinitionPosition::Interface(pos) => {
                    self.add_interface_type_edges(node, pos)?
                }
                CompositeTypeDefinitionPosition::Union(pos) => {
                    self.add_union_type_edges(node, pos)?
                }
            }
        }
        Ok(self.base.build())
    }

    /// Returns the node for the given type, creating it (and scheduling its out edges) when the
    /// type has not been visited yet.
    fn add_type(
        &mut self,
        type_pos: OutputTypeDefinitionPosition,
    ) -> Result<NodeIndex, FederationError> {
        if let Some(node) = self.base.node_for_type(&type_pos)? {
            return Ok(node);
        }
        let node = self
            .base
            .create_new_node(QueryGraphNodeType::SchemaType(type_pos.clone()))?;
        if let Ok(composite) = CompositeTypeDefinitionPosition::try_from(type_pos) {
            self.pending.push((node, composite));
        }
        Ok(node)
    }

    fn add_type_by_name(
        &mut self,
        type_name: &apollo_compiler::Name,
    ) -> Result<NodeIndex, FederationError> {
        let type_pos: OutputTypeDefinitionPosition =
            self.schema()?.get_type(type_name.clone())?.try_into()?;
        self.add_type(type_pos)
    }

    fn add_typename_edge(
        &mut self,
        node: NodeIndex,
        parent: CompositeTypeDefinitionPosition,
    ) -> Result<(), FederationError> {
        let field_definition_position = parent.introspection_typename_field();
        let field_type = field_definition_position
            .get(self.schema()?.schema())?
            .ty
            .inner_named_type()
            .clone();
        let tail = self.add_type_by_name(&field_type)?;
        self.base.add_edge(
            node,
            tail,
            QueryGraphEdgeTransition::FieldCollection {
                source: self.base.source.clone(),
                field_definition_position,
                is_part_of_provides: false,
            },
            None,
        )?;
        Ok(())
    }

    fn add_field_edge(
        &mut self,
        node: NodeIndex,
        field_definition_position: FieldDefinitionPosition,
        field_type: &apollo_compiler::Name,
    ) -> Result<(), FederationError> {
        let tail = self.add_type_by_name(field_type)?;
        self.base.add_edge(
            node,
            tail,
            QueryGraphEdgeTransition::FieldCollection {
                source: self.base.source.clone(),
                field_definition_position,
                is_part_of_provides: false,
            },
            None,
        )?;
        Ok(())
    }

    fn add_downcast_edge(
        &mut self,
        node: NodeIndex,
        from_type_position: CompositeTypeDefinitionPosition,
        to_type_position: CompositeTypeDefinitionPosition,
    ) -> Result<(), FederationError> {
        let tail = self.add_type(to_type_position.clone().into())?;
        self.base.add_edge(
            node,
            tail,
            QueryGraphEdgeTransition::Downcast {
                source: self.base.source.clone(),
                from_type_position,
                to_type_position,
            },
            None,
        )?;
        Ok(())
    }

    fn is_external(&self, field_definition_position: &FieldDefinitionPosition) -> Result<bool, FederationError> {
        if !self.is_federated_subgraph() {
            return Ok(false);
        }
        let schema = self.schema()?;
        let field = field_definition_position.get(schema.schema())?;
        if field.directives.has(&EXTERNAL_DIRECTIVE_NAME) {
            return Ok(true);
        }
        Ok(matches!(
            schema.schema().types.get(field_definition_position.type_name()),
            Some(ExtendedType::Object(parent)) if parent.directives.has(&EXTERNAL_DIRECTIVE_NAME)
        ))
    }

    fn is_overridden(&self, field_definition_position: &FieldDefinitionPosition) -> bool {
        self.subgraph
            .as_ref()
            .is_some_and(|subgraph| subgraph.overridden_fields.contains(field_definition_position))
    }

    fn add_object_type_edges(
        &mut self,
        node: NodeIndex,
        type_pos: ObjectTypeDefinitionPosition,
    ) -> Result<(), FederationError> {
        let parent = CompositeTypeDefinitionPosition::Object(type_pos.clone());
        let schema = self.schema()?.clone();
        // An @interfaceObject stands in for the interface, so its own name is never a valid
        // runtime __typename.
        if !schema.is_interface_object_type(&type_pos.type_name) {
            self.add_typename_edge(node, parent.clone())?;
        }
        let is_query_root = schema.root_kind_of(&type_pos.type_name)
            == Some(SchemaRootDefinitionKind::Query);
        let object = type_pos.get(schema.schema())?;
        for (field_name, field) in &object.fields {
            if is_query_root
                && self.is_federated_subgraph()
                && (*field_name == ENTITIES_QUERY_FIELD_NAME
                    || *field_name == SERVICE_QUERY_FIELD_NAME)
            {
                continue;
            }
            let field_definition_position = parent.field(field_name.clone());
            let field_type = field.ty.inner_named_type();
            if self.is_external(&field_definition_position)?
                || self.is_overridden(&field_definition_position)
            {
                // No edge, but the field type may still be reachable another way (through a
                // @provides for instance), so it still gets a node.
                self.add_type_by_name(field_type)?;
                continue;
            }
            self.add_field_edge(node, field_definition_position, field_type)?;
        }
        Ok(())
    }

    fn add_interface_type_edges(
        &mut self,
        node: NodeIndex,
        type_pos: InterfaceTypeDefinitionPosition,
    ) -> Result<(), FederationError> {
        let parent = CompositeTypeDefinitionPosition::Interface(type_pos.clone());
        let schema = self.schema()?.clone();
        self.add_typename_edge(node, parent.clone())?;
        let implementations = schema.possible_runtime_types(parent.clone())?;
        let interface = type_pos.get(schema.schema())?;
        for (field_name, field) in &interface.fields {
            let field_type = field.ty.inner_named_type();
            // A field can only be collected on the interface directly when every local
            // implementation resolves it itself.
            let mut collectable_on_interface = true;
            for implementation in &implementations {
                let implementation_field = CompositeTypeDefinitionPosition::Object(
                    implementation.clone(),
                )
                .field(field_name.clone());
                let Some(definition) = implementation_field.try_get(schema.schema()) else {
                    collectable_on_interface = false;
                    break;
                };
                if self.is_external(&implementation_field)?
                    || definition.directives.has(&REQUIRES_DIRECTIVE_NAME)
                    || self.is_overridden(&implementation_field)
                {
                    collectable_on_interface = false;
                    break;
                }
            }
            if collectable_on_interface {
                self.add_field_edge(node, parent.field(field_name.clone()), field_type)?;
            } else {
                self.add_type_by_name(field_type)?;
            }
        }
        for implementation in implementations {
            self.add_downcast_edge(node, parent.clone(), implementation.into())?;
        }
        Ok(())
    }

    fn add_union_type_edges(
        &mut self,
        node: NodeIndex,
        type_pos: UnionTypeDefinitionPosition,
    ) -> Result<(), FederationError> {
        let parent = CompositeTypeDefinitionPosition::Union(type_pos.clone());
        self.add_typename_edge(node, parent.clone())?;
        let members = self.schema()?.possible_runtime_types(parent.clone())?;
        if members.is_empty() {
            bail!("Union \"{}\" unexpectedly has no member", type_pos);
        }
        for member in members {
            self.add_downcast_edge(node, parent.clone(), member.into())?;
        }
        Ok(())
    }
}
