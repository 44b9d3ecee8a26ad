use std::fmt::Display;
use std::fmt::Formatter;
use std::sync::Arc;

use apollo_compiler::collections::IndexSet;
use either::Either;
use petgraph::graph::EdgeIndex;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::bail;
use crate::error::FederationError;
use crate::operation::DirectiveList;
use crate::operation::Field;
use crate::operation::InlineFragment;
use crate::operation::SelectionSet;
use crate::query_graph::QueryGraph;
use crate::query_graph::QueryGraphEdgeTransition;
use crate::query_graph::QueryGraphNodeType;
use crate::query_graph::condition_resolver::ConditionResolution;
use crate::query_graph::condition_resolver::ConditionResolver;
use crate::query_graph::condition_resolver::UnsatisfiedConditionReason;
use crate::query_graph::path_tree::OpPathTree;
use crate::query_plan::conditions::Conditions;
use crate::schema::position::CompositeTypeDefinitionPosition;
use crate::schema::position::ObjectTypeDefinitionPosition;
use crate::schema::position::SchemaRootDefinitionKind;

pub(crate) mod operation;

pub(crate) use operation::IndirectPaths;
pub(crate) use operation::IndirectPathsCache;
pub(crate) use operation::SimultaneousPaths;
pub(crate) use operation::SimultaneousPathsWithLazyIndirectPaths;
pub(crate) use operation::advance_simultaneous_paths_with_operation;

/// A path through a query graph, guided by the elements of a GraphQL operation.
///
/// Paths are immutable: `add()` and `concat()` return new paths, and the per-edge data is behind
/// `Arc`s so that copying a path is cheap.
#[derive(Debug, Clone)]
pub(crate) struct OpGraphPath {
    /// The query graph of which this is a path.
    graph: Arc<QueryGraph>,
    /// The node at which the path starts.
    head: NodeIndex,
    /// The node at which the path stops. This is the tail of the last non-`None` edge, or the head
    /// if there is no such edge.
    tail: NodeIndex,
    /// The edges of the path. A `None` edge records an operation element (a fragment with
    /// directives on the current type) for which no edge was taken.
    edges: Vec<Option<EdgeIndex>>,
    /// The element that triggered each edge.
    edge_triggers: Vec<Arc<OpGraphPathTrigger>>,
    /// For each edge, the tree of paths used to satisfy the edge's conditions, if it has any.
    edge_conditions: Vec<Option<Arc<OpPathTree>>>,
    /// The object types the tail can be at runtime. This starts as the possible runtime types of
    /// the head type, and gets narrowed by downcasts.
    runtime_types_of_tail: Arc<IndexSet<ObjectTypeDefinitionPosition>>,
}

/// An element of an operation that paths advance with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::From)]
pub(crate) enum OpPathElement {
    Field(Field),
    InlineFragment(InlineFragment),
}

impl OpPathElement {
    pub(crate) fn directives(&self) -> &DirectiveList {
        match self {
            OpPathElement::Field(field) => &field.directives,
            OpPathElement::InlineFragment(inline_fragment) => &inline_fragment.directives,
        }
    }

    /// Whether this is a field of leaf type, which has nothing left to advance after it.
    pub(crate) fn is_terminal(&self) -> Result<bool, FederationError> {
        match self {
            OpPathElement::Field(field) => field.is_leaf(),
            OpPathElement::InlineFragment(_) => Ok(false),
        }
    }
}

impl Display for OpPathElement {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OpPathElement::Field(field) => field.fmt(f),
            OpPathElement::InlineFragment(inline_fragment) => inline_fragment.fmt(f),
        }
    }
}

/// Records, as we walk a path within a GraphQL operation, important directives encountered
/// (currently `@include` and `@skip` with their conditions).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct OpGraphPathContext {
    conditionals: Conditions,
}

impl OpGraphPathContext {
    pub(crate) fn is_empty(&self) -> bool {
        self.conditionals.is_true()
    }

    /// The context extended with the `@skip`/`@include` conditions of the given element.
    pub(crate) fn with_context_of(
        &self,
        operation_element: &OpPathElement,
    ) -> Result<OpGraphPathContext, FederationError> {
        let element_conditions = Conditions::from_directives(operation_element.directives())?;
        if element_conditions.is_true() {
            return Ok(self.clone());
        }
        Ok(OpGraphPathContext {
            conditionals: self.conditionals.clone().merge(element_conditions),
        })
    }
}

impl Display for OpGraphPathContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return f.write_str("{}");
        }
        write!(f, "{{ {} }}", self.conditionals)
    }
}

/// What made a path take an edge: an operation element for collecting edges, or the context in
/// effect for edges that don't collect anything (keys, root type resolutions, subgraph entering).
#[derive(Debug, Clone, PartialEq, Eq, derive_more::From)]
pub(crate) enum OpGraphPathTrigger {
    OpPathElement(OpPathElement),
    Context(OpGraphPathContext),
}

impl Display for OpGraphPathTrigger {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OpGraphPathTrigger::OpPathElement(element) => element.fmt(f),
            OpGraphPathTrigger::Context(context) => context.fmt(f),
        }
    }
}

/// The subgraphs that a path must not jump into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ExcludedDestinations(Arc<Vec<Arc<str>>>);

impl ExcludedDestinations {
    pub(crate) fn is_excluded(&self, destination: &str) -> bool {
        self.0.iter().any(|excluded| **excluded == *destination)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn add_excluded(&self, destination: Arc<str>) -> Self {
        if self.is_excluded(&destination) {
            return self.clone();
        }
        let mut excluded = self.0.as_ref().clone();
        excluded.push(destination);
        Self(Arc::new(excluded))
    }
}

/// The conditions currently being resolved. Edges with one of those conditions are not taken, as
/// that would loop.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExcludedConditions(Arc<Vec<Arc<SelectionSet>>>);

impl ExcludedConditions {
    pub(crate) fn is_excluded(&self, conditions: Option<&Arc<SelectionSet>>) -> bool {
        let Some(conditions) = conditions else {
            return false;
        };
        self.0
            .iter()
            .any(|excluded| Arc::ptr_eq(excluded, conditions) || **excluded == **conditions)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn add_item(&self, conditions: Arc<SelectionSet>) -> Self {
        let mut excluded = self.0.as_ref().clone();
        excluded.push(conditions);
        Self(Arc::new(excluded))
    }
}

impl OpGraphPath {
    /// An empty path starting (and stopping) at `head`.
    pub(crate) fn new(graph: Arc<QueryGraph>, head: NodeIndex) -> Result<Self, FederationError> {
        let runtime_types_of_tail = Arc::new(runtime_types_of_node(&graph, head)?);
        Ok(Self {
            graph,
            head,
            tail: head,
            edges: Vec::new(),
            edge_triggers: Vec::new(),
            edge_conditions: Vec::new(),
            runtime_types_of_tail,
        })
    }

    pub(crate) fn graph(&self) -> &Arc<QueryGraph> {
        &self.graph
    }

    pub(crate) fn head(&self) -> NodeIndex {
        self.head
    }

    pub(crate) fn tail(&self) -> NodeIndex {
        self.tail
    }

    pub(crate) fn size(&self) -> usize {
        self.edges.len()
    }

    pub(crate) fn runtime_types_of_tail(&self) -> &Arc<IndexSet<ObjectTypeDefinitionPosition>> {
        &self.runtime_types_of_tail
    }

    /// The edges of the path in order, along with their trigger and condition tree.
    pub(crate) fn iter(
        &self,
    ) -> impl Iterator<
        Item = (
            Option<EdgeIndex>,
            &Arc<OpGraphPathTrigger>,
            Option<&Arc<OpPathTree>>,
        ),
    > {
        self.edges
            .iter()
            .zip(&self.edge_triggers)
            .zip(&self.edge_conditions)
            .map(|((edge, trigger), conditions)| (*edge, trigger, conditions.as_ref()))
    }

    /// The last edge of the path, if any and if it isn't a `None` edge.
    pub(crate) fn last_edge(&self) -> Option<EdgeIndex> {
        self.edges.last().copied().flatten()
    }

    fn last_non_null_edge(&self) -> Option<EdgeIndex> {
        self.edges.iter().rev().find_map(|edge| *edge)
    }

    /// Returns a new path with the given edge added. `edge` must start at the tail of this path
    /// (or be `None`), and the resolution must be satisfied.
    pub(crate) fn add(
        &self,
        trigger: OpGraphPathTrigger,
        edge: Option<EdgeIndex>,
        condition_resolution: ConditionResolution,
    ) -> Result<Self, FederationError> {
        let ConditionResolution::Satisfied {
            path_tree: condition_path_tree,
            ..
        } = condition_resolution
        else {
            bail!("Cannot add an edge whose conditions are not satisfied to {}", self);
        };
        let mut edges = self.edges.clone();
        let mut edge_triggers = self.edge_triggers.clone();
        let mut edge_conditions = self.edge_conditions.clone();
        edges.push(edge);
        edge_triggers.push(Arc::new(trigger));
        edge_conditions.push(condition_path_tree);

        let Some(new_edge) = edge else {
            return Ok(Self {
                graph: self.graph.clone(),
                head: self.head,
                tail: self.tail,
                edges,
                edge_triggers,
                edge_conditions,
                runtime_types_of_tail: self.runtime_types_of_tail.clone(),
            });
        };
        let (edge_head, edge_tail) = self.graph.edge_endpoints(new_edge)?;
        if edge_head != self.tail {
            bail!(
                "Cannot add edge starting at {} to path ending at {}",
                self.graph.node_weight(edge_head)?,
                self.graph.node_weight(self.tail)?,
            );
        }
        let runtime_types_of_tail = match &self.graph.edge_weight(new_edge)?.transition {
            QueryGraphEdgeTransition::Downcast {
                source,
                to_type_position,
                ..
            } => {
                let casted_runtime_types = self
                    .graph
                    .schema_by_source(source)?
                    .possible_runtime_types(to_type_position.clone())?;
                self.runtime_types_of_tail
                    .iter()
                    .filter(|type_pos| casted_runtime_types.contains(*type_pos))
                    .cloned()
                    .collect()
            }
            QueryGraphEdgeTransition::InterfaceObjectFakeDownCast { to_type_name, .. } => {
                IndexSet::from_iter([ObjectTypeDefinitionPosition::new(to_type_name.clone())])
            }
            _ => runtime_types_of_node(&self.graph, edge_tail)?,
        };
        Ok(Self {
            graph: self.graph.clone(),
            head: self.head,
            tail: edge_tail,
            edges,
            edge_triggers,
            edge_conditions,
            runtime_types_of_tail: Arc::new(runtime_types_of_tail),
        })
    }

    /// The path made of the edges of `self` followed by those of `other`, which must start where
    /// `self` stops.
    pub(crate) fn concat(&self, other: &OpGraphPath) -> Result<Self, FederationError> {
        if !Arc::ptr_eq(&self.graph, &other.graph) {
            bail!("Cannot concatenate paths of different graphs");
        }
        if other.head != self.tail {
            bail!(
                "Cannot concatenate path starting at {} to path ending at {}",
                self.graph.node_weight(other.head)?,
                self.graph.node_weight(self.tail)?,
            );
        }
        if other.edges.is_empty() {
            return Ok(self.clone());
        }
        let mut edges = self.edges.clone();
        let mut edge_triggers = self.edge_triggers.clone();
        let mut edge_conditions = self.edge_conditions.clone();
        edges.extend(other.edges.iter().copied());
        edge_triggers.extend(other.edge_triggers.iter().cloned());
        edge_conditions.extend(other.edge_conditions.iter().cloned());
        Ok(Self {
            graph: self.graph.clone(),
            head: self.head,
            tail: other.tail,
            edges,
            edge_triggers,
            edge_conditions,
            runtime_types_of_tail: other.runtime_types_of_tail.clone(),
        })
    }

    /// The number of times this path jumps to another subgraph through a key or root type edge.
    pub(crate) fn subgraph_jumps(&self) -> Result<u32, FederationError> {
        let mut jumps = 0;
        for edge in self.edges.iter().flatten() {
            if matches!(
                self.graph.edge_weight(*edge)?.transition,
                QueryGraphEdgeTransition::KeyResolution
                    | QueryGraphEdgeTransition::RootTypeResolution { .. }
            ) {
                jumps += 1;
            }
        }
        Ok(jumps)
    }

    /// Whether the path stops on a subgraph query root without having collected anything yet.
    pub(crate) fn is_on_top_level_query_root(&self) -> Result<bool, FederationError> {
        if self.graph.node_weight(self.tail)?.root_kind != Some(SchemaRootDefinitionKind::Query) {
            return Ok(false);
        }
        for edge in self.edges.iter().flatten() {
            if self
                .graph
                .edge_weight(*edge)?
                .transition
                .collect_operation_elements()
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub(crate) fn tail_is_interface_object(&self) -> Result<bool, FederationError> {
        self.graph.is_interface_object_node(self.tail)
    }

    /// The edges worth taking after this path: the precomputed non-trivial followups of the last
    /// edge, or all the edges out of the tail if the path has no edge yet.
    pub(crate) fn next_edges(&self) -> impl Iterator<Item = EdgeIndex> + '_ {
        let followups = self
            .last_non_null_edge()
            .and_then(|last_edge| self.graph.non_trivial_followup_edges().get(&last_edge));
        match followups {
            Some(followups) => Either::Left(followups.iter().copied()),
            None => Either::Right(
                self.graph
                    .out_edges(self.tail)
                    .into_iter()
                    .map(|edge_ref| edge_ref.id()),
            ),
        }
    }

    /// Checks whether the conditions of `edge` (which must start at the tail) can be satisfied.
    ///
    /// When the edge is a field with conditions (so a `@requires`) and we didn't get here through a
    /// key, the resolution also includes a key of the current type, so that we can come back to
    /// this subgraph after fetching the requirements elsewhere. Only the first locally satisfiable
    /// key is tried.
    pub(crate) fn can_satisfy_conditions(
        &self,
        edge: EdgeIndex,
        condition_resolver: &mut impl ConditionResolver,
        context: &OpGraphPathContext,
        excluded_destinations: &ExcludedDestinations,
        excluded_conditions: &ExcludedConditions,
    ) -> Result<ConditionResolution, FederationError> {
        let edge_weight = self.graph.edge_weight(edge)?;
        if edge_weight.conditions.is_none() {
            return Ok(ConditionResolution::no_conditions());
        }
        let resolution = condition_resolver.resolve(
            edge,
            context,
            excluded_destinations,
            excluded_conditions,
            None,
        )?;
        let ConditionResolution::Satisfied { cost, path_tree } = resolution else {
            return Ok(resolution);
        };
        let came_from_non_key = match self.edges.last() {
            None => true,
            Some(None) => false,
            Some(Some(last_edge)) => !matches!(
                self.graph.edge_weight(*last_edge)?.transition,
                QueryGraphEdgeTransition::KeyResolution
            ),
        };
        let is_local = match &path_tree {
            Some(path_tree) => path_tree.is_all_in_same_subgraph()?,
            None => false,
        };
        if !matches!(
            edge_weight.transition,
            QueryGraphEdgeTransition::FieldCollection { .. }
        ) || !came_from_non_key
            || is_local
        {
            return Ok(ConditionResolution::Satisfied { cost, path_tree });
        }

        let (edge_head, _) = self.graph.edge_endpoints(edge)?;
        let Some(key) = self.graph.locally_satisfiable_key(edge_head)? else {
            return Ok(ConditionResolution::Unsatisfied {
                reason: Some(UnsatisfiedConditionReason::NoPostRequireKey),
            });
        };
        let key_resolution = condition_resolver.resolve(
            edge,
            context,
            excluded_destinations,
            excluded_conditions,
            Some(&key),
        )?;
        let ConditionResolution::Satisfied {
            cost: key_cost,
            path_tree: key_path_tree,
        } = key_resolution
        else {
            return Ok(ConditionResolution::Unsatisfied {
                reason: Some(UnsatisfiedConditionReason::NoPostRequireKey),
            });
        };
        let path_tree = match (path_tree, key_path_tree) {
            (Some(path_tree), Some(key_path_tree)) => Some(path_tree.merge(&key_path_tree)?),
            (Some(path_tree), None) | (None, Some(path_tree)) => Some(path_tree),
            (None, None) => None,
        };
        Ok(ConditionResolution::Satisfied {
            cost: cost + key_cost,
            path_tree,
        })
    }
}

fn runtime_types_of_node(
    graph: &QueryGraph,
    node: NodeIndex,
) -> Result<IndexSet<ObjectTypeDefinitionPosition>, FederationError> {
    let node_weight = graph.node_weight(node)?;
    let QueryGraphNodeType::SchemaType(type_pos) = &node_weight.type_ else {
        return Ok(Default::default());
    };
    let Ok(type_pos) = CompositeTypeDefinitionPosition::try_from(type_pos.clone()) else {
        return Ok(Default::default());
    };
    graph
        .schema_by_source(&node_weight.source)?
        .possible_runtime_types(type_pos)
}

impl Display for OpGraphPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let head = self.graph.node_weight(self.head).map_err(|_| std::fmt::Error)?;
        head.fmt(f)?;
        for (edge, trigger, _) in self.iter() {
            let Some(edge) = edge else {
                write!(f, " ({trigger})")?;
                continue;
            };
            let (_, tail) = self.graph.edge_endpoints(edge).map_err(|_| std::fmt::Error)?;
            let tail = self.graph.node_weight(tail).map_err(|_| std::fmt::Error)?;
            match trigger.as_ref() {
                OpGraphPathTrigger::OpPathElement(element) => {
                    write!(f, " --[{element}]--> {tail}")?
                }
                OpGraphPathTrigger::Context(_) => {
                    let edge_weight = self.graph.edge_weight(edge).map_err(|_| std::fmt::Error)?;
                    write!(f, " --[{}]--> {tail}", edge_weight.transition)?
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use apollo_compiler::name;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::query_graph::condition_resolver::CachingConditionResolver;
    use crate::query_graph::condition_resolver::ConditionResolverCache;
    use crate::query_graph::test_support::federated_graph;
    use crate::query_plan::query_planner::EnabledOverrideConditions;

    const API_SCHEMA: &str = r#"
        type Query { t: T i: I }
        interface I { id: ID! }
        type T implements I { id: ID! a: Int }
        type U implements I { id: ID! }
    "#;

    const SUBGRAPH: &str = r#"
        type Query { t: T i: I }
        interface I { id: ID! }
        type T implements I { id: ID! a: Int }
        type U implements I { id: ID! }
    "#;

    fn query_root(graph: &QueryGraph) -> NodeIndex {
        graph.root_kinds_to_nodes().unwrap()[&SchemaRootDefinitionKind::Query]
    }

    fn field_element(graph: &QueryGraph, type_name: &str, field_name: &str) -> OpPathElement {
        let schema = graph.supergraph_schema().unwrap();
        let parent: CompositeTypeDefinitionPosition = schema
            .get_type(apollo_compiler::Name::new(type_name).unwrap())
            .unwrap()
            .try_into()
            .unwrap();
        Field::from_position(
            &schema,
            parent.field(apollo_compiler::Name::new(field_name).unwrap()),
        )
        .into()
    }

    fn enter_subgraph(graph: &Arc<QueryGraph>) -> OpGraphPath {
        let root = query_root(graph);
        let entering = graph.out_edges(root)[0].id();
        OpGraphPath::new(graph.clone(), root)
            .unwrap()
            .add(
                OpGraphPathContext::default().into(),
                Some(entering),
                ConditionResolution::no_conditions(),
            )
            .unwrap()
    }

    #[test]
    fn adding_edges_records_them_in_order() {
        let graph = federated_graph(API_SCHEMA, &[("S", SUBGRAPH)]);
        let path = enter_subgraph(&graph);
        assert!(path.is_on_top_level_query_root().unwrap());
        let t_edge = graph
            .edge_for_field(path.tail(), &name!("t"), &Default::default())
            .unwrap()
            .unwrap();
        let t = field_element(&graph, "Query", "t");
        let path = path
            .add(t.clone().into(), Some(t_edge), ConditionResolution::no_conditions())
            .unwrap();
        assert!(!path.is_on_top_level_query_root().unwrap());
        assert_eq!(path.size(), 2);
        let elements: Vec<_> = path.iter().map(|(edge, trigger, _)| (edge, trigger.clone())).collect();
        assert_eq!(elements[1], (Some(t_edge), Arc::new(OpGraphPathTrigger::from(t))));
        assert_eq!(path.last_edge(), Some(t_edge));
        assert_eq!(path.to_string(), "[query](_)* --[∅]--> Query(S)* --[t]--> T(S)");
        assert_eq!(
            path.runtime_types_of_tail()
                .iter()
                .map(|type_pos| type_pos.type_name.as_str())
                .collect::<Vec<_>>(),
            vec!["T"]
        );
        assert_eq!(path.subgraph_jumps().unwrap(), 0);
    }

    #[test]
    fn downcasts_narrow_runtime_types() {
        let graph = federated_graph(API_SCHEMA, &[("S", SUBGRAPH)]);
        let path = enter_subgraph(&graph);
        let i_edge = graph
            .edge_for_field(path.tail(), &name!("i"), &Default::default())
            .unwrap()
            .unwrap();
        let path = path
            .add(
                field_element(&graph, "Query", "i").into(),
                Some(i_edge),
                ConditionResolution::no_conditions(),
            )
            .unwrap();
        assert_eq!(path.runtime_types_of_tail().len(), 2);
        let cast = graph
            .edge_for_type_name(path.tail(), &name!("U"))
            .unwrap()
            .unwrap();
        let path = path
            .add(
                OpGraphPathContext::default().into(),
                Some(cast),
                ConditionResolution::no_conditions(),
            )
            .unwrap();
        assert_eq!(
            path.runtime_types_of_tail().first().map(|type_pos| type_pos.type_name.as_str()),
            Some("U")
        );
    }

    #[test]
    fn concatenation_appends_elements() {
        let graph = federated_graph(API_SCHEMA, &[("S", SUBGRAPH)]);
        let prefix = enter_subgraph(&graph);
        let t_edge = graph
            .edge_for_field(prefix.tail(), &name!("t"), &Default::default())
            .unwrap()
            .unwrap();
        let suffix = OpGraphPath::new(graph.clone(), prefix.tail())
            .unwrap()
            .add(
                field_element(&graph, "Query", "t").into(),
                Some(t_edge),
                ConditionResolution::no_conditions(),
            )
            .unwrap();
        let path = prefix.concat(&suffix).unwrap();
        assert_eq!(path.size(), prefix.size() + suffix.size());
        assert_eq!(path.head(), prefix.head());
        assert_eq!(path.tail(), suffix.tail());
        let edges: Vec<_> = path.iter().map(|(edge, _, _)| edge).collect();
        let expected: Vec<_> = prefix
            .iter()
            .chain(suffix.iter())
            .map(|(edge, _, _)| edge)
            .collect();
        assert_eq!(edges, expected);

        // The suffix must start where the prefix stops.
        assert!(suffix.concat(&prefix).is_err());
    }

    #[test]
    fn null_edges_keep_the_tail() {
        let graph = federated_graph(API_SCHEMA, &[("S", SUBGRAPH)]);
        let path = enter_subgraph(&graph);
        let tail = path.tail();
        let path = path
            .add(
                OpGraphPathContext::default().into(),
                None,
                ConditionResolution::no_conditions(),
            )
            .unwrap();
        assert_eq!(path.tail(), tail);
        assert_eq!(path.size(), 2);
        assert_eq!(path.last_edge(), None);
        assert!(
            path.add(
                OpGraphPathContext::default().into(),
                None,
                ConditionResolution::Unsatisfied { reason: None },
            )
            .is_err()
        );
    }

    #[test]
    fn excluded_destinations_do_not_duplicate() {
        let excluded = ExcludedDestinations::default()
            .add_excluded("A".into())
            .add_excluded("A".into());
        assert!(excluded.is_excluded("A"));
        assert!(!excluded.is_excluded("B"));
        assert_eq!(excluded, ExcludedDestinations::default().add_excluded("A".into()));
    }

    const REQUIRES_API_SCHEMA: &str = r#"
        type Query { t: T }
        type T { id: ID! weight: Int estimate: Int }
    "#;

    const PRODUCTS: &str = r#"
        type Query { products: Int }
        type T @key(fields: "id") { id: ID! weight: Int }
    "#;

    fn shipping(key_arguments: &str) -> String {
        format!(
            r#"
            type Query {{ t: T }}
            type T @key({key_arguments}) {{
                id: ID!
                weight: Int @external
                estimate: Int @requires(fields: "weight")
            }}
            "#
        )
    }

    /// Resolves the conditions of `T.estimate` on `Query.t` of the shipping subgraph.
    fn resolve_estimate(shipping_sdl: &str) -> ConditionResolution {
        let graph = federated_graph(
            REQUIRES_API_SCHEMA,
            &[("shipping", shipping_sdl), ("products", PRODUCTS)],
        );
        let root = query_root(&graph);
        let entering = graph
            .out_edges(root)
            .into_iter()
            .find(|edge_ref| &*graph.node_weight(edge_ref.target()).unwrap().source == "shipping")
            .unwrap()
            .id();
        let path = OpGraphPath::new(graph.clone(), root)
            .unwrap()
            .add(
                OpGraphPathContext::default().into(),
                Some(entering),
                ConditionResolution::no_conditions(),
            )
            .unwrap();
        let t_edge = graph
            .edge_for_field(path.tail(), &name!("t"), &Default::default())
            .unwrap()
            .unwrap();
        let path = path
            .add(
                field_element(&graph, "Query", "t").into(),
                Some(t_edge),
                ConditionResolution::no_conditions(),
            )
            .unwrap();
        let estimate_edge = graph
            .edge_for_field(path.tail(), &name!("estimate"), &Default::default())
            .unwrap()
            .unwrap();

        let overrides = EnabledOverrideConditions::default();
        let cache = ConditionResolverCache::default();
        let indirect_paths_cache = IndirectPathsCache::default();
        let mut resolver = CachingConditionResolver::new(
            graph.clone(),
            graph.supergraph_schema().unwrap(),
            &overrides,
            &cache,
            &indirect_paths_cache,
        );
        path.can_satisfy_conditions(
            estimate_edge,
            &mut resolver,
            &Default::default(),
            &Default::default(),
            &Default::default(),
        )
        .unwrap()
    }

    #[test]
    fn requires_reached_without_a_key_add_a_key_to_come_back() {
        let resolution = resolve_estimate(&shipping(r#"fields: "id""#));
        let ConditionResolution::Satisfied {
            path_tree: Some(path_tree),
            ..
        } = &resolution
        else {
            panic!("expected `weight` to be fetched from products, got {resolution:?}");
        };
        assert!(!path_tree.is_all_in_same_subgraph().unwrap());
    }

    #[test]
    fn requires_without_a_usable_key_are_unsatisfied() {
        let resolution = resolve_estimate(&shipping(r#"fields: "id", resolvable: false"#));
        assert!(
            matches!(
                resolution,
                ConditionResolution::Unsatisfied {
                    reason: Some(UnsatisfiedConditionReason::NoPostRequireKey)
                }
            ),
            "{resolution:?}"
        );
    }
}
