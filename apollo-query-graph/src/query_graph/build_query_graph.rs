use std::sync::Arc;

use apollo_compiler::Name;
use apollo_compiler::Schema;
use apollo_compiler::collections::IndexMap;
use apollo_compiler::collections::IndexSet;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::validation::Valid;
use petgraph::graph::EdgeIndex;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use tracing::debug;
use tracing::instrument;

use super::base_query_graph::BaseQueryGraphBuilder;
use super::base_query_graph::SchemaQueryGraphBuilder;
use super::base_query_graph::SubgraphBuildOptions;
use crate::bail;
use crate::error::FederationError;
use crate::error::SingleFederationError;
use crate::link::federation_spec_definition::KEY_DIRECTIVE_NAME;
use crate::link::federation_spec_definition::OVERRIDE_DIRECTIVE_NAME;
use crate::link::federation_spec_definition::PROVIDES_DIRECTIVE_NAME;
use crate::link::federation_spec_definition::REQUIRES_DIRECTIVE_NAME;
use crate::link::federation_spec_definition::key_directive_arguments;
use crate::link::federation_spec_definition::override_directive_arguments;
use crate::link::federation_spec_definition::provides_directive_arguments;
use crate::link::federation_spec_definition::requires_directive_arguments;
use crate::operation::FieldSelection;
use crate::operation::Selection;
use crate::operation::SelectionSet;
use crate::query_graph::FEDERATED_GRAPH_ROOT_SOURCE;
use crate::query_graph::OverrideCondition;
use crate::query_graph::QueryGraph;
use crate::query_graph::QueryGraphEdge;
use crate::query_graph::QueryGraphEdgeTransition;
use crate::query_graph::QueryGraphNodeType;
use crate::query_graph::non_local_selections_estimation::NonLocalSelectionsMetadata;
use crate::schema::ValidFederationSchema;
use crate::schema::field_set::parse_field_set;
use crate::schema::position::CompositeTypeDefinitionPosition;
use crate::schema::position::FieldDefinitionPosition;
use crate::schema::position::ObjectTypeDefinitionPosition;
use crate::schema::position::OutputTypeDefinitionPosition;
use crate::schema::position::SchemaRootDefinitionKind;
use crate::schema::position::TypeDefinitionPosition;
use crate::supergraph::Supergraph;

/// Builds the graph that the planner walks: one node per (type, subgraph) pair, joined by
/// edges that jump between subgraphs.
///
/// The supergraph and its subgraphs must already be valid.
#[instrument(skip_all)]
pub fn build_federated_query_graph(supergraph: &Supergraph) -> Result<QueryGraph, FederationError> {
    // Placeholder, replaced once the first source is added.
    let mut query_graph = QueryGraph::new("".into());
    let mut overridden_fields = overridden_fields_by_subgraph(supergraph)?;
    for subgraph in supergraph.subgraphs() {
        let options = SubgraphBuildOptions {
            overridden_fields: overridden_fields.swap_remove(&subgraph.name).unwrap_or_default(),
        };
        query_graph = SchemaQueryGraphBuilder::new(
            query_graph,
            subgraph.name.clone(),
            subgraph.schema.clone(),
            Some(options),
        )
        .build()?;
    }
    FederatedQueryGraphBuilder::new(query_graph, supergraph.api_schema().clone())?.build()
}

/// Builds the graph of a single schema, typically an API schema. The schema must be valid.
pub fn build_query_graph(
    name: Arc<str>,
    schema: ValidFederationSchema,
) -> Result<QueryGraph, FederationError> {
    // Placeholder, replaced once the source is added.
    let query_graph = QueryGraph::new("".into());
    SchemaQueryGraphBuilder::new(query_graph, name, schema, None).build()
}

/// Collects, for each subgraph, the fields that some other subgraph took over with an unlabelled
/// @override. Those fields get no edge in the overridden subgraph. Labelled (progressive)
/// overrides keep both edges, guarded by override conditions instead.
fn overridden_fields_by_subgraph(
    supergraph: &Supergraph,
) -> Result<IndexMap<Arc<str>, IndexSet<FieldDefinitionPosition>>, FederationError> {
    let mut result: IndexMap<Arc<str>, IndexSet<FieldDefinitionPosition>> = IndexMap::default();
    for subgraph in supergraph.subgraphs() {
        for_each_override(&subgraph.schema, |field_definition_position, from, label| {
            if label.is_none()
                && let Some(from_subgraph) = supergraph.subgraph(from)
            {
                result
                    .entry(from_subgraph.name.clone())
                    .or_default()
                    .insert(field_definition_position);
            }
            Ok(())
        })?;
    }
    Ok(result)
}

/// Calls `f` with every @override application of a subgraph schema, as (field, from, label).
fn for_each_override(
    schema: &ValidFederationSchema,
    mut f: impl FnMut(FieldDefinitionPosition, &str, Option<&str>) -> Result<(), FederationError>,
) -> Result<(), FederationError> {
    for (type_name, type_) in &schema.schema().types {
        let ExtendedType::Object(object) = type_ else {
            continue;
        };
        let parent: CompositeTypeDefinitionPosition =
            ObjectTypeDefinitionPosition::new(type_name.clone()).into();
        for (field_name, field) in &object.fields {
            for application in field.directives.get_all(&OVERRIDE_DIRECTIVE_NAME) {
                let arguments = override_directive_arguments(application)?;
                f(
                    parent.field(field_name.clone()),
                    arguments.from,
                    arguments.label,
                )?;
            }
        }
    }
    Ok(())
}

struct FederatedQueryGraphBuilder {
    base: BaseQueryGraphBuilder,
    supergraph_schema: ValidFederationSchema,
}

impl FederatedQueryGraphBuilder {
    fn new(
        mut query_graph: QueryGraph,
        supergraph_schema: ValidFederationSchema,
    ) -> Result<Self, FederationError> {
        query_graph.supergraph_schema = Some(supergraph_schema.clone());
        let base = BaseQueryGraphBuilder::new(
            query_graph,
            FEDERATED_GRAPH_ROOT_SOURCE.into(),
            // Never read. Validity is assumed since an empty schema lacks a Query type.
            ValidFederationSchema::new(Valid::assume_valid(Schema::new()))?,
        );
        Ok(FederatedQueryGraphBuilder {
            base,
            supergraph_schema,
        })
    }

    fn build(mut self) -> Result<QueryGraph, FederationError> {
        self.merge_subgraphs()?;
        self.add_root_edges()?;
        self.handle_key()?;
        self.handle_requires()?;
        self.handle_progressive_overrides()?;
        // Copies made for @provides take the out-edges their original has at this point, so the
        // fake downcasts added next stay on the original @interfaceObject nodes.
        self.handle_provides()?;
        self.handle_interface_object()?;
        self.base.propagate_reachable_cross_subgraph_edges()?;
        // These add no nodes/edges, but precompute data used when walking the graph.
        self.precompute_non_trivial_followup_edges()?;
        self.base.query_graph.non_local_selection_metadata =
            NonLocalSelectionsMetadata::new(&self.base.query_graph)?;
        debug!(
            nodes = self.base.query_graph.node_count(),
            edges = self.base.query_graph.edge_count(),
            "built federated query graph"
        );
        Ok(self.base.build())
    }

    /// Registers the subgraphs copied so far under the federated source: their schemas, one
    /// federated root per root kind any of them has, and the union of their type-to-nodes maps.
    fn merge_subgraphs(&mut self) -> Result<(), FederationError> {
        let query_graph = &mut self.base.query_graph;
        let mut root_kinds = IndexSet::default();
        let mut types_to_nodes: IndexMap<Name, IndexSet<NodeIndex>> = IndexMap::default();
        for (source, schema) in &query_graph.sources {
            if *source == query_graph.current_source {
                continue;
            }
            query_graph
                .subgraphs_by_name
                .insert(source.clone(), schema.clone());
            if let Some(roots) = query_graph.root_kinds_to_nodes_by_source.get(source) {
                root_kinds.extend(roots.keys().copied());
            }
            let subgraph_types = query_graph.types_to_nodes_by_source.get(source);
            for (type_name, nodes) in subgraph_types.into_iter().flatten() {
                types_to_nodes
                    .entry(type_name.clone())
                    .or_default()
                    .extend(nodes.iter().copied());
            }
        }
        *query_graph.types_to_nodes_mut()? = types_to_nodes;
        for root_kind in root_kinds {
            self.base.create_root_node(root_kind.into(), root_kind)?;
        }
        Ok(())
    }

    /// Enters each subgraph root from the federated root of its kind, and links same-kind roots
    /// of different subgraphs: a field returning a root type can resume in any subgraph.
    fn add_root_edges(&mut self) -> Result<(), FederationError> {
        let query_graph = &self.base.query_graph;
        let federated_roots = query_graph.root_kinds_to_nodes()?;
        let subgraph_roots: Vec<(&Arc<str>, SchemaRootDefinitionKind, NodeIndex)> = query_graph
            .root_kinds_to_nodes_by_source
            .iter()
            .filter(|(source, _)| **source != query_graph.current_source)
            .flat_map(|(source, roots)| roots.iter().map(move |(kind, node)| (source, *kind, *node)))
            .collect();
        let mut new_edges = Vec::new();
        for (source, root_kind, root) in &subgraph_roots {
            let Some(federated_root) = federated_roots.get(root_kind) else {
                bail!("Federated {root_kind} root node unexpectedly missing");
            };
            new_edges.push(QueryGraphEdgeData {
                head: *federated_root,
                tail: *root,
                transition: QueryGraphEdgeTransition::SubgraphEnteringTransition,
                conditions: None,
                override_condition: None,
            });
            for (other_source, other_kind, other_root) in &subgraph_roots {
                if other_kind != root_kind || other_source == source {
                    continue;
                }
                new_edges.push(QueryGraphEdgeData {
                    head: *root,
                    tail: *other_root,
                    transition: QueryGraphEdgeTransition::RootTypeResolution {
                        root_kind: *root_kind,
                    },
                    conditions: None,
                    override_condition: None,
                });
            }
        }
        for new_edge in new_edges {
            new_edge.add_to(&mut self.base)?;
        }
        Ok(())
    }

    /// Adds the key edges leading into each entity node.
    fn handle_key(&mut self) -> Result<(), FederationError> {
        // Every edge built here ends on the entity node of the current subgraph.
        let mut new_edges = Vec::new();
        for tail in self.base.query_graph.graph.node_indices() {
            let tail_weight = self.base.query_graph.node_weight(tail)?;
            let source = &tail_weight.source;
            if *source == self.base.query_graph.current_source {
                continue;
            }
            // Skip federated roots.
            let QueryGraphNodeType::SchemaType(type_pos) = &tail_weight.type_ else {
                continue;
            };
            let schema = self.base.query_graph.schema_by_source(source)?;
            let directives = schema
                .schema()
                .types
                .get(type_pos.type_name())
                .ok_or_else(|| SingleFederationError::Internal {
                    message: format!(
                        "Type \"{}\" unexpectedly missing from subgraph \"{}\"",
                        type_pos, source,
                    ),
                })?
                .directives();
            let is_interface_object = matches!(type_pos, OutputTypeDefinitionPosition::Object(_))
                && schema.is_interface_object_type(type_pos.type_name());

            for application in directives.get_all(&KEY_DIRECTIVE_NAME) {
                let application = key_directive_arguments(application)?;
                if !application.resolvable {
                    continue;
                }
                // A @key lets any other subgraph holding the type jump here through `_entities`, provided it
                // can produce the key fields. The other side needn't declare the same key.
                let conditions = Arc::new(parse_field_set(
                    schema,
                    type_pos.type_name().clone(),
                    application.fields,
                )?);

                for (other_source, other_types_to_nodes) in
                    &self.base.query_graph.types_to_nodes_by_source
                {
                    if *other_source == self.base.query_graph.current_source
                        || other_source == source
                    {
                        continue;
                    }

                    if let Some(other_nodes) = other_types_to_nodes.get(type_pos.type_name()) {
                        // Holds until @provides starts copying nodes.
                        let Some(head) = single_node(other_nodes) else {
                            bail!(
                                "Types-to-nodes set unexpectedly did not have exactly one element for type \"{}\" in subgraph \"{}\"",
                                type_pos,
                                other_source,
                            );
                        };
                        // other subgraph -> this one
                        new_edges.push(QueryGraphEdgeData {
                            head,
                            tail,
                            transition: QueryGraphEdgeTransition::KeyResolution,
                            conditions: Some(conditions.clone()),
                            override_condition: None,
                        })
                    }

                    // Keys on an @interfaceObject are also reachable from the implementations the other
                    // subgraph has, for fields only the interface object resolves.
                    if is_interface_object {
                        let TypeDefinitionPosition::Interface(type_in_supergraph_pos) = self
                            .supergraph_schema
                            .get_type(type_pos.type_name().clone())?
                        else {
                            bail!(
                                "Type \"{}\" was marked with \"@interfaceObject\" in subgraph \"{}\", but was non-interface in supergraph",
                                type_pos,
                                source,
                            );
                        };
                        let other_schema = self.base.query_graph.schema_by_source(other_source)?;
                        for implementation_type_in_supergraph_pos in self
                            .supergraph_schema
                            .possible_runtime_types(type_in_supergraph_pos.into())?
                        {
                            // Implementations missing from the other subgraph are skipped.
                            let Some(implementation_nodes) = other_types_to_nodes
                                .get(&implementation_type_in_supergraph_pos.type_name)
                            else {
                                continue;
                            };
                            let Some(head) = single_node(implementation_nodes) else {
                                bail!(
                                    "Types-to-nodes set unexpectedly did not have exactly one element for type \"{}\" in subgraph \"{}\"",
                                    implementation_type_in_supergraph_pos,
                                    other_source,
                                );
                            };
                            // Re-parse the key on the implementation type. Failure means the key can't be used from there.
                            let Ok(implementation_conditions) = parse_field_set(
                                other_schema,
                                implementation_type_in_supergraph_pos.type_name.clone(),
                                application.fields,
                            ) else {
                                continue;
                            };
                            new_edges.push(QueryGraphEdgeData {
                                head,
                                tail,
                                transition: QueryGraphEdgeTransition::KeyResolution,
                                conditions: Some(Arc::new(implementation_conditions)),
                                override_condition: None,
                            })
                        }
                    }
                }
            }
        }
        for new_edge in new_edges {
            new_edge.add_to(&mut self.base)?;
        }
        Ok(())
    }

    /// Attaches @requires field sets as conditions of field-collecting edges.
    fn handle_requires(&mut self) -> Result<(), FederationError> {
        let mut new_conditions_by_edge = Vec::new();
        for edge in self.base.query_graph.graph.edge_indices() {
            let edge_weight = self.base.query_graph.edge_weight(edge)?;
            let QueryGraphEdgeTransition::FieldCollection {
                source,
                field_definition_position,
                ..
            } = &edge_weight.transition
            else {
                continue;
            };
            if *source == self.base.query_graph.current_source
                || field_definition_position.is_introspection_typename_field()
            {
                continue;
            }
            // Edges have no conditions yet at this point.
            if edge_weight.conditions.is_some() {
                bail!(
                    "Field-collection edge for field \"{}\" unexpectedly had conditions",
                    field_definition_position,
                );
            }
            let schema = self.base.query_graph.schema_by_source(source)?;
            let field = field_definition_position.get(schema.schema())?;
            let mut new_conditions: Option<SelectionSet> = None;
            for directive in field.directives.get_all(&REQUIRES_DIRECTIVE_NAME) {
                let application = requires_directive_arguments(directive)?;
                let conditions = parse_field_set(
                    schema,
                    field_definition_position.type_name().clone(),
                    application.fields,
                )?;
                new_conditions = Some(match new_conditions {
                    Some(existing) => existing.merge(&conditions)?,
                    None => conditions,
                });
            }
            if let Some(new_conditions) = new_conditions {
                new_conditions_by_edge.push((edge, new_conditions));
            }
        }
        for (edge, new_conditions) in new_conditions_by_edge {
            self.base.query_graph.edge_weight_mut(edge)?.conditions = Some(Arc::new(new_conditions));
        }
        Ok(())
    }

    /// Guards the edges of a field under a labelled @override: the overriding subgraph's edge
    /// requires the label to be enabled, the overridden one requires it to be disabled.
    fn handle_progressive_overrides(&mut self) -> Result<(), FederationError> {
        let mut edge_to_conditions: IndexMap<EdgeIndex, OverrideCondition> = Default::default();

        fn collect_edge_condition(
            query_graph: &QueryGraph,
            target_graph: &str,
            target_field: &FieldDefinitionPosition,
            label: &str,
            condition: bool,
            edge_to_conditions: &mut IndexMap<EdgeIndex, OverrideCondition>,
        ) -> Result<(), FederationError> {
            // The "from" subgraph may not exist (anymore) or may not define the type, in which
            // case there is no edge to guard.
            let Some(parent_node) = query_graph
                .types_to_nodes_by_source
                .get(target_graph)
                .and_then(|subgraph_nodes| subgraph_nodes.get(target_field.type_name()))
                .and_then(|nodes| nodes.first())
            else {
                return Ok(());
            };
            for edge in query_graph.out_edges(*parent_node) {
                let QueryGraphEdgeTransition::FieldCollection {
                    field_definition_position,
                    ..
                } = &edge.weight().transition
                else {
                    continue;
                };
                if target_field == field_definition_position {
                    edge_to_conditions.insert(
                        edge.id(),
                        OverrideCondition {
                            label: label.to_owned(),
                            condition,
                        },
                    );
                }
            }
            Ok(())
        }

        let query_graph = &self.base.query_graph;
        for (to_subgraph_name, subgraph_schema) in &query_graph.subgraphs_by_name {
            for_each_override(subgraph_schema, |field_definition_position, from, label| {
                let Some(label) = label else {
                    return Ok(());
                };
                collect_edge_condition(
                    query_graph,
                    to_subgraph_name,
                    &field_definition_position,
                    label,
                    true,
                    &mut edge_to_conditions,
                )?;
                collect_edge_condition(
                    query_graph,
                    from,
                    &field_definition_position,
                    label,
                    false,
                    &mut edge_to_conditions,
                )
            })?;
        }

        for (edge, condition) in edge_to_conditions {
            let mutable_edge = self.base.query_graph.edge_weight_mut(edge)?;
            mutable_edge.override_condition = Some(condition);
        }
        Ok(())
    }

    /// Moves each field edge carrying a @provides onto a private copy of its tail, then adds the
    /// provided fields to that copy.
    fn handle_provides(&mut self) -> Result<(), FederationError> {
        let mut provide_id = 0;
        // Copies get appended edges, so only the subgraphs' own edges are visited.
        let edges: Vec<EdgeIndex> = self.base.query_graph.graph.edge_indices().collect();
        for edge in edges {
            let Some((source, provided)) = self.provided_selections(edge)? else {
                continue;
            };
            provide_id += 1;
            let mut copier = ProvidesCopier {
                base: &mut self.base,
                source,
                provide_id,
            };
            let copy = copier.retarget_to_copy(edge)?;
            copier.provide(copy, &provided)?;
        }
        Ok(())
    }

    /// The @provides applications of a subgraph field edge merged into one selection set, along
    /// with the edge's subgraph.
    fn provided_selections(
        &self,
        edge: EdgeIndex,
    ) -> Result<Option<(Arc<str>, SelectionSet)>, FederationError> {
        let graph = &self.base.query_graph;
        let QueryGraphEdgeTransition::FieldCollection {
            source,
            field_definition_position,
            is_part_of_provides: false,
        } = &graph.edge_weight(edge)?.transition
        else {
            return Ok(None);
        };
        if *source == graph.current_source
            || field_definition_position.is_introspection_typename_field()
        {
            return Ok(None);
        }
        let schema = graph.schema_by_source(source)?;
        let field = field_definition_position.get(schema.schema())?;
        let mut provided: Option<SelectionSet> = None;
        for directive in field.directives.get_all(&PROVIDES_DIRECTIVE_NAME) {
            let fields = provides_directive_arguments(directive)?.fields;
            let selections = parse_field_set(schema, field.ty.inner_named_type().clone(), fields)?;
            provided = Some(match provided {
                Some(provided) => provided.merge(&selections)?,
                None => selections,
            });
        }
        Ok(provided.map(|provided| (source.clone(), provided)))
    }

    /// Adds the fake downcasts of @interfaceObject types.
    ///
    /// When only some implementations of an interface are queried on an @interfaceObject, the
    /// real `__typename` has to be known first. So @interfaceObject types get an edge to
    /// themselves for every implementation of the interface: those edges are taken on a
    /// `... on Implementation` condition, and have `__typename` as condition, forcing the
    /// traversal to find `__typename` in another subgraph first.
    fn handle_interface_object(&mut self) -> Result<(), FederationError> {
        let mut new_edges = Vec::new();
        for (source, schema) in &self.base.query_graph.sources {
            if *source == self.base.query_graph.current_source {
                continue;
            }
            for (type_name, type_) in &schema.schema().types {
                if !matches!(type_, ExtendedType::Object(_))
                    || !schema.is_interface_object_type(type_name)
                {
                    continue;
                }
                let type_pos = ObjectTypeDefinitionPosition::new(type_name.clone());
                let node = self
                    .base
                    .query_graph
                    .non_provides_node(source, type_name)?;
                let TypeDefinitionPosition::Interface(type_in_supergraph_pos) =
                    self.supergraph_schema.get_type(type_name.clone())?
                else {
                    bail!(
                        "Type \"{}\" was marked with \"@interfaceObject\" in subgraph \"{}\", but was non-interface in supergraph",
                        type_pos,
                        source,
                    );
                };
                let conditions = Arc::new(parse_field_set(schema, type_name.clone(), "__typename")?);
                for implementation_type_in_supergraph_pos in self
                    .supergraph_schema
                    .possible_runtime_types(type_in_supergraph_pos.into())?
                {
                    new_edges.push(QueryGraphEdgeData {
                        head: node,
                        tail: node,
                        transition: QueryGraphEdgeTransition::InterfaceObjectFakeDownCast {
                            source: source.clone(),
                            from_type_position: type_pos.clone().into(),
                            to_type_name: implementation_type_in_supergraph_pos.type_name,
                        },
                        conditions: Some(conditions.clone()),
                        override_condition: None,
                    });
                }
            }
        }
        for new_edge in new_edges {
            new_edge.add_to(&mut self.base)?;
        }
        Ok(())
    }

    /// Records, for every edge, the outgoing edges of its tail that are worth following it with.
    fn precompute_non_trivial_followup_edges(&mut self) -> Result<(), FederationError> {
        let graph = &self.base.query_graph;
        let mut followups_by_edge = IndexMap::default();
        for edge in graph.graph.edge_indices() {
            let edge_weight = graph.edge_weight(edge)?;
            let (_, tail) = graph.edge_endpoints(edge)?;
            let mut followups = Vec::new();
            for followup in graph.out_edges(tail) {
                if !is_trivial_followup(edge_weight, followup.weight())? {
                    followups.push(followup.id());
                }
            }
            followups_by_edge.insert(edge, followups);
        }
        self.base.query_graph.non_trivial_followup_edges = followups_by_edge;
        Ok(())
    }
}

/// Whether taking `followup` right after `edge` can never beat a single hop.
///
/// Key edges are added from every other subgraph, so a key from B to C with conditions X implies a
/// key from A to C with the same conditions. Root type jumps are complete between subgraphs, and so
/// are the entering edges of the federated root.
fn is_trivial_followup(
    edge: &QueryGraphEdge,
    followup: &QueryGraphEdge,
) -> Result<bool, FederationError> {
    Ok(match (&edge.transition, &followup.transition) {
        (QueryGraphEdgeTransition::KeyResolution, QueryGraphEdgeTransition::KeyResolution) => {
            let (Some(conditions), Some(followup_conditions)) =
                (&edge.conditions, &followup.conditions)
            else {
                bail!("Key resolution edge unexpectedly missing conditions");
            };
            conditions == followup_conditions
        }
        (
            QueryGraphEdgeTransition::RootTypeResolution { .. }
            | QueryGraphEdgeTransition::SubgraphEnteringTransition,
            QueryGraphEdgeTransition::RootTypeResolution { .. },
        ) => true,
        _ => false,
    })
}

fn single_node(nodes: &IndexSet<NodeIndex>) -> Option<NodeIndex> {
    if nodes.len() == 1 {
        nodes.first().copied()
    } else {
        None
    }
}

/// Builds the private nodes and edges of one @provides application.
struct ProvidesCopier<'b> {
    base: &'b mut BaseQueryGraphBuilder,
    source: Arc<str>,
    provide_id: u32,
}

impl ProvidesCopier<'_> {
    fn provide(&mut self, node: NodeIndex, provided: &SelectionSet) -> Result<(), FederationError> {
        for selection in provided.selections.values() {
            match selection {
                Selection::Field(field_selection) => self.provide_field(node, field_selection)?,
                Selection::InlineFragment(fragment_selection) => {
                    let sub_selections = &fragment_selection.selection_set;
                    let Some(type_condition) =
                        &fragment_selection.inline_fragment.type_condition_position
                    else {
                        self.provide(node, sub_selections)?;
                        continue;
                    };
                    let Some(edge) = self
                        .base
                        .query_graph
                        .edge_for_type_name(node, type_condition.type_name())?
                    else {
                        bail!(
                            "@provides type condition \"{}\" has no downcast edge from {}",
                            type_condition,
                            self.base.query_graph.node_weight(node)?,
                        );
                    };
                    let copy = self.retarget_to_copy(edge)?;
                    self.provide(copy, sub_selections)?;
                }
            }
        }
        Ok(())
    }

    fn provide_field(
        &mut self,
        node: NodeIndex,
        field_selection: &FieldSelection,
    ) -> Result<(), FederationError> {
        let field = &field_selection.field;
        let existing_edge = self
            .base
            .query_graph
            .out_edges(node)
            .into_iter()
            .find(|edge_ref| {
                matches!(
                    &edge_ref.weight().transition,
                    QueryGraphEdgeTransition::FieldCollection { field_definition_position, .. }
                        if field_definition_position.field_name() == field.name()
                )
            })
            .map(|edge_ref| edge_ref.id());
        match (existing_edge, &field_selection.selection_set) {
            (Some(_), None) => Ok(()),
            (Some(edge), Some(sub_selections)) => {
                let copy = self.retarget_to_copy(edge)?;
                self.provide(copy, sub_selections)
            }
            (None, sub_selections) => {
                // An @external field: this @provides is the only way to collect it here.
                let tail_type = field
                    .field_position
                    .get(field.schema.schema())?
                    .ty
                    .inner_named_type()
                    .clone();
                let mut tail = self
                    .base
                    .query_graph
                    .non_provides_node(&self.source, &tail_type)?;
                if sub_selections.is_some() {
                    tail = self.copy_node(tail)?;
                }
                let transition = QueryGraphEdgeTransition::FieldCollection {
                    source: self.source.clone(),
                    field_definition_position: field.field_position.clone(),
                    is_part_of_provides: true,
                };
                self.base.add_edge(node, tail, transition, None)?;
                match sub_selections {
                    Some(sub_selections) => self.provide(tail, sub_selections),
                    None => Ok(()),
                }
            }
        }
    }

    /// Points `edge` at a fresh copy of its tail and returns the copy.
    fn retarget_to_copy(&mut self, edge: EdgeIndex) -> Result<NodeIndex, FederationError> {
        let (head, tail) = self.base.query_graph.edge_endpoints(edge)?;
        let copy = self.copy_node(tail)?;
        let weight = self.base.query_graph.edge_weight(edge)?.clone();
        let graph = &mut self.base.query_graph.graph;
        // petgraph moves the last edge into a removed slot, so the appended edge takes over
        // `edge`'s index.
        graph.add_edge(head, copy, weight);
        graph.remove_edge(edge);
        Ok(copy)
    }

    /// Duplicates `node` with its out-edges, tagged with this application's id.
    fn copy_node(&mut self, node: NodeIndex) -> Result<NodeIndex, FederationError> {
        let query_graph = &mut self.base.query_graph;
        let mut copy_weight = query_graph.node_weight(node)?.clone();
        let QueryGraphNodeType::SchemaType(type_pos) = &copy_weight.type_ else {
            bail!("Unexpectedly found @provides for federated root node");
        };
        let type_name = type_pos.type_name().clone();
        copy_weight.provide_id = Some(self.provide_id);
        copy_weight.root_kind = None;
        let out_edges: Vec<_> = query_graph
            .out_edges(node)
            .into_iter()
            .map(|edge_ref| (edge_ref.target(), edge_ref.weight().clone()))
            .collect();
        let copy = query_graph.graph.add_node(copy_weight);
        for (tail, weight) in out_edges {
            query_graph.graph.add_edge(copy, tail, weight);
        }
        for source in [self.source.clone(), query_graph.current_source.clone()] {
            query_graph
                .types_to_nodes_by_source
                .get_mut(&source)
                .and_then(|types_to_nodes| types_to_nodes.get_mut(&type_name))
                .ok_or_else(|| {
                    crate::internal_error!("Type \"{type_name}\" missing from \"{source}\" nodes")
                })?
                .insert(copy);
        }
        Ok(copy)
    }
}

#[derive(Debug)]
struct QueryGraphEdgeData {
    head: NodeIndex,
    tail: NodeIndex,
    transition: QueryGraphEdgeTransition,
    conditions: Option<Arc<SelectionSet>>,
    override_condition: Option<OverrideCondition>,
}

impl QueryGraphEdgeData {
    fn add_to(self, builder: &mut BaseQueryGraphBuilder) -> Result<(), FederationError> {
        let edge = builder.add_edge(self.head, self.tail, self.transition, self.conditions)?;
        if self.override_condition.is_some() {
            builder.query_graph.edge_weight_mut(edge)?.override_condition =
                self.override_condition;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use apollo_compiler::Name;
    use apollo_compiler::Schema;
    use apollo_compiler::name;
    use petgraph::graph::NodeIndex;
    use petgraph::visit::EdgeRef;
    use pretty_assertions::assert_eq;

    use crate::error::FederationError;
    use crate::query_graph::QueryGraph;
    use crate::query_graph::QueryGraphEdgeTransition;
    use crate::query_graph::build_query_graph::build_query_graph;
    use crate::query_graph::test_support::federated_graph;
    use crate::query_plan::query_planner::EnabledOverrideConditions;
    use crate::schema::ValidFederationSchema;
    use crate::schema::position::SchemaRootDefinitionKind;

    fn schema_graph(sdl: &str) -> QueryGraph {
        let schema =
            ValidFederationSchema::new(Schema::parse_and_validate(sdl, "schema.graphql").unwrap())
                .unwrap();
        build_query_graph("test".into(), schema).unwrap()
    }

    fn query_root(graph: &QueryGraph, source: &str) -> NodeIndex {
        graph.root_kinds_to_nodes_by_source(source).unwrap()[&SchemaRootDefinitionKind::Query]
    }

    /// Follows the only `field` edge out of `node`.
    fn follow(graph: &QueryGraph, node: NodeIndex, field: Name) -> NodeIndex {
        let edge = graph
            .edge_for_field(node, &field, &EnabledOverrideConditions::default())
            .unwrap()
            .unwrap_or_else(|| panic!("no {field} edge out of {}", graph.node_weight(node).unwrap()));
        graph.edge_endpoints(edge).unwrap().1
    }

    fn edge_labels(graph: &QueryGraph, node: NodeIndex) -> Vec<String> {
        graph
            .out_edges(node)
            .iter()
            .map(|edge| edge.weight().to_string())
            .collect()
    }

    fn node_label(graph: &QueryGraph, node: NodeIndex) -> String {
        graph.node_weight(node).unwrap().to_string()
    }

    #[test]
    fn object_types_get_one_node_each() {
        let graph = schema_graph(
            r#"
            type Query { t1: T1 }
            type T1 { f1: Int f2: String f3: T2 }
            type T2 { t: T1 }
            "#,
        );
        // Query, T1, T2, Int and String
        assert_eq!(graph.graph.node_count(), 5);
        assert_eq!(graph.root_kinds_to_nodes().unwrap().len(), 1);

        let root = query_root(&graph, "test");
        assert_eq!(node_label(&graph, root), "Query(test)*");
        assert_eq!(edge_labels(&graph, root), ["__typename", "t1"]);

        let t1 = follow(&graph, root, name!("t1"));
        assert_eq!(node_label(&graph, t1), "T1(test)");
        assert_eq!(edge_labels(&graph, t1), ["__typename", "f1", "f2", "f3"]);

        let int = follow(&graph, t1, name!("f1"));
        assert_eq!(node_label(&graph, int), "Int(test)");
        assert!(graph.out_edges(int).is_empty());
        // Every String field ends on the same node.
        assert_eq!(
            follow(&graph, t1, name!("f2")),
            follow(&graph, root, name!("__typename"))
        );

        for (index, edge) in graph.out_edges(t1).iter().enumerate() {
            assert_eq!(graph.out_edge(t1, index), Some(edge.id()));
        }
        assert_eq!(graph.out_edge(t1, 4), None);

        let t2 = follow(&graph, t1, name!("f3"));
        assert_eq!(edge_labels(&graph, t2), ["__typename", "t"]);
        assert_eq!(follow(&graph, t2, name!("t")), t1);
        assert!(
            graph
                .out_edges(t1)
                .iter()
                .all(|edge| edge.weight().conditions.is_none())
        );
    }

    #[test]
    fn abstract_types_downcast_to_their_runtime_types() -> Result<(), FederationError> {
        let graph = schema_graph(
            r#"
            type Query { i: I u: U }
            interface I { id: ID! }
            type A implements I { id: ID! a: Int }
            type B implements I { id: ID! }
            union U = A | B
            "#,
        );
        let root = query_root(&graph, "test");
        let i = follow(&graph, root, name!("i"));
        assert_eq!(node_label(&graph, i), "I(test)");
        assert_eq!(edge_labels(&graph, i), ["__typename", "id", "... on A", "... on B"]);

        let u = follow(&graph, root, name!("u"));
        assert_eq!(edge_labels(&graph, u), ["__typename", "... on A", "... on B"]);

        let a_from_i = graph.edge_for_type_name(i, &name!("A"))?;
        let a_from_u = graph.edge_for_type_name(u, &name!("A"))?;
        let (Some(a_from_i), Some(a_from_u)) = (a_from_i, a_from_u) else {
            panic!("missing downcast to A");
        };
        assert_eq!(
            graph.edge_endpoints(a_from_i)?.1,
            graph.edge_endpoints(a_from_u)?.1
        );
        Ok(())
    }

    const PROVIDES_API: &str = "type Query { t: T } type T { id: ID! name: String }";

    const REVIEWS: &str = r#"
        type Query { t: T @provides(fields: "name") }
        type T @key(fields: "id") { id: ID! name: String @external }
    "#;

    const PRODUCTS: &str = r#"
        type Query { products: Int }
        type T @key(fields: "id") { id: ID! name: String }
    "#;

    #[test]
    fn provides_routes_the_field_to_a_private_copy() -> Result<(), FederationError> {
        let graph = federated_graph(PROVIDES_API, &[("reviews", REVIEWS), ("products", PRODUCTS)]);
        let original = graph.non_provides_node("reviews", &name!("T"))?;
        let copy = follow(&graph, query_root(&graph, "reviews"), name!("t"));
        assert_ne!(copy, original);
        assert_eq!(node_label(&graph, copy), "T(reviews)-1");
        assert_eq!(graph.types_to_nodes_by_source("reviews")?[&name!("T")].len(), 2);

        // The copy keeps what the original has and adds the provided field.
        let original_edges = edge_labels(&graph, original);
        let copy_edges = edge_labels(&graph, copy);
        assert_eq!(&copy_edges[..original_edges.len()], &original_edges[..]);
        assert_eq!(copy_edges.len(), original_edges.len() + 1);
        assert!(!original_edges.contains(&"name".to_owned()));
        for (index, edge) in graph.out_edges(copy).iter().enumerate() {
            assert_eq!(graph.out_edge(copy, index), Some(edge.id()));
        }

        let provided = graph
            .edge_for_field(copy, &name!("name"), &EnabledOverrideConditions::default())?
            .unwrap_or_else(|| panic!("no provided edge"));
        assert!(matches!(
            graph.edge_weight(provided)?.transition,
            QueryGraphEdgeTransition::FieldCollection {
                is_part_of_provides: true,
                ..
            }
        ));
        assert_eq!(
            node_label(&graph, graph.edge_endpoints(provided)?.1),
            "String(reviews)"
        );
        Ok(())
    }

    #[test]
    fn keys_of_an_interface_object_are_reachable_from_implementations() -> Result<(), FederationError>
    {
        let graph = federated_graph(
            r#"
            type Query { i: I }
            interface I { id: ID! extra: Int }
            type A implements I { id: ID! a: Int extra: Int }
            "#,
            &[
                (
                    "s1",
                    r#"
                    type Query { i: I }
                    interface I @key(fields: "id") { id: ID! }
                    type A implements I @key(fields: "id") { id: ID! a: Int }
                    "#,
                ),
                (
                    "s2",
                    r#"
                    type Query { s2: Int }
                    type I @key(fields: "id") @interfaceObject { id: ID! extra: Int }
                    "#,
                ),
            ],
        );
        let a = graph.non_provides_node("s1", &name!("A"))?;
        let interface_object = graph.non_provides_node("s2", &name!("I"))?;
        let key_edges: Vec<_> = graph
            .out_edges(a)
            .into_iter()
            .filter(|edge| {
                matches!(
                    edge.weight().transition,
                    QueryGraphEdgeTransition::KeyResolution
                )
            })
            .map(|edge| edge.target())
            .collect();
        assert_eq!(key_edges, [interface_object]);
        Ok(())
    }
}
