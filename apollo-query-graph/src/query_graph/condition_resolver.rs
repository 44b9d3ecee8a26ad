use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use apollo_compiler::collections::IndexMap;
use petgraph::graph::EdgeIndex;
use tracing::trace;

use crate::error::FederationError;
use crate::operation::Selection;
use crate::operation::SelectionSet;
use crate::query_graph::QueryGraph;
use crate::query_graph::graph_path::ExcludedConditions;
use crate::query_graph::graph_path::ExcludedDestinations;
use crate::query_graph::graph_path::IndirectPathsCache;
use crate::query_graph::graph_path::OpGraphPath;
use crate::query_graph::graph_path::OpGraphPathContext;
use crate::query_graph::graph_path::SimultaneousPathsWithLazyIndirectPaths;
use crate::query_graph::graph_path::advance_simultaneous_paths_with_operation;
use crate::query_graph::path_tree::OpPathTree;
use crate::query_plan::QueryPlanCost;
use crate::query_plan::query_planner::EnabledOverrideConditions;
use crate::schema::ValidFederationSchema;

/// Note that `ConditionResolver`s are guaranteed to be only called for edge with conditions.
pub(crate) trait ConditionResolver {
    fn resolve(
        &mut self,
        edge: EdgeIndex,
        context: &OpGraphPathContext,
        excluded_destinations: &ExcludedDestinations,
        excluded_conditions: &ExcludedConditions,
        extra_conditions: Option<&SelectionSet>,
    ) -> Result<ConditionResolution, FederationError>;

    /// The cache of indirect path suffixes shared by the searches this resolver takes part in.
    fn indirect_paths_cache(&self) -> Option<&IndirectPathsCache> {
        None
    }
}

#[derive(Debug, Clone)]
pub(crate) enum ConditionResolution {
    Satisfied {
        cost: QueryPlanCost,
        path_tree: Option<Arc<OpPathTree>>,
    },
    Unsatisfied {
        reason: Option<UnsatisfiedConditionReason>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnsatisfiedConditionReason {
    NoPostRequireKey,
}

impl ConditionResolution {
    pub(crate) fn no_conditions() -> Self {
        Self::Satisfied {
            cost: 0.0,
            path_tree: None,
        }
    }

    pub(crate) fn unsatisfied_conditions() -> Self {
        Self::Unsatisfied { reason: None }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum ConditionResolutionCacheResult {
    /// Cache hit.
    Hit(ConditionResolution),
    /// Cache miss; can be inserted into cache.
    Miss,
    /// The cache can't be used for this query (context or excluded conditions are set, or the
    /// stored entry was computed for other excluded destinations).
    NotApplicable,
}

/// Resolutions of edge conditions, shared by every traversal planned against one query graph.
#[derive(Debug, Default)]
pub(crate) struct ConditionResolverCache {
    // For every edge, the resolution and the excluded destinations it was computed with.
    edge_states: Mutex<
        IndexMap<(EdgeIndex, EnabledOverrideConditions), (ConditionResolution, ExcludedDestinations)>,
    >,
}

impl ConditionResolverCache {
    pub(crate) fn contains(
        &self,
        edge: EdgeIndex,
        context: &OpGraphPathContext,
        excluded_destinations: &ExcludedDestinations,
        excluded_conditions: &ExcludedConditions,
        override_conditions: &EnabledOverrideConditions,
    ) -> ConditionResolutionCacheResult {
        if !context.is_empty() || !excluded_conditions.is_empty() {
            return ConditionResolutionCacheResult::NotApplicable;
        }
        let edge_states = self
            .edge_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match edge_states.get(&(edge, override_conditions.clone())) {
            None => ConditionResolutionCacheResult::Miss,
            Some((resolution, cached_destinations))
                if cached_destinations == excluded_destinations =>
            {
                ConditionResolutionCacheResult::Hit(resolution.clone())
            }
            Some(_) => ConditionResolutionCacheResult::NotApplicable,
        }
    }

    pub(crate) fn insert(
        &self,
        edge: EdgeIndex,
        override_conditions: &EnabledOverrideConditions,
        resolution: ConditionResolution,
        excluded_destinations: ExcludedDestinations,
    ) {
        self.edge_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((edge, override_conditions.clone()))
            .or_insert((resolution, excluded_destinations));
    }

    pub(crate) fn len(&self) -> usize {
        self.edge_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Resolves edge conditions by searching the query graph for a way to collect them, memoizing
/// results in a [`ConditionResolverCache`] when possible.
pub(crate) struct CachingConditionResolver<'a> {
    graph: Arc<QueryGraph>,
    supergraph_schema: ValidFederationSchema,
    override_conditions: &'a EnabledOverrideConditions,
    cache: &'a ConditionResolverCache,
    indirect_paths_cache: &'a IndirectPathsCache,
}

impl<'a> CachingConditionResolver<'a> {
    pub(crate) fn new(
        graph: Arc<QueryGraph>,
        supergraph_schema: ValidFederationSchema,
        override_conditions: &'a EnabledOverrideConditions,
        cache: &'a ConditionResolverCache,
        indirect_paths_cache: &'a IndirectPathsCache,
    ) -> Self {
        Self {
            graph,
            supergraph_schema,
            override_conditions,
            cache,
            indirect_paths_cache,
        }
    }

    fn resolve_without_cache(
        &mut self,
        edge: EdgeIndex,
        context: &OpGraphPathContext,
        excluded_destinations: &ExcludedDestinations,
        excluded_conditions: &ExcludedConditions,
        extra_conditions: Option<&SelectionSet>,
    ) -> Result<ConditionResolution, FederationError> {
        let edge_weight = self.graph.edge_weight(edge)?;
        let conditions = match (extra_conditions, &edge_weight.conditions) {
            (Some(extra_conditions), _) => Arc::new(extra_conditions.clone()),
            (None, Some(conditions)) => conditions.clone(),
            (None, None) => return Ok(ConditionResolution::no_conditions()),
        };
        let (edge_head, edge_tail) = self.graph.edge_endpoints(edge)?;
        let edge_tail_source = self.graph.node_weight(edge_tail)?.source.clone();
        trace!("Resolving conditions {conditions} of edge {edge_weight}");

        let initial_option = SimultaneousPathsWithLazyIndirectPaths::new(
            Arc::new(OpGraphPath::new(self.graph.clone(), edge_head)?).into(),
            context.clone(),
            excluded_destinations.add_excluded(edge_tail_source),
            excluded_conditions.add_item(conditions.clone()),
        );
        let supergraph_schema = self.supergraph_schema.clone();
        let override_conditions = self.override_conditions;

        let mut path_tree: Option<Arc<OpPathTree>> = None;
        let mut stack: Vec<(Selection, Vec<SimultaneousPathsWithLazyIndirectPaths>)> = conditions
            .iter()
            .rev()
            .map(|selection| (selection.clone(), vec![initial_option.clone()]))
            .collect();
        while let Some((selection, mut options)) = stack.pop() {
            let element = selection.element();
            let mut new_options = Vec::new();
            for option in &mut options {
                if let Some(advanced) = advance_simultaneous_paths_with_operation(
                    &supergraph_schema,
                    option,
                    &element,
                    self,
                    override_conditions,
                )? {
                    new_options.extend(advanced);
                }
            }
            // An element selecting nothing can't provide the required data either.
            let Some(first_option) = new_options.first() else {
                trace!("Cannot collect {element}: conditions are unsatisfied");
                return Ok(ConditionResolution::unsatisfied_conditions());
            };
            match selection.selection_set() {
                Some(selection_set) if !selection_set.is_empty() => {
                    for sub_selection in selection_set.iter().rev() {
                        stack.push((sub_selection.clone(), new_options.clone()));
                    }
                }
                _ => {
                    for path in &first_option.paths.0 {
                        path_tree = Some(match path_tree {
                            Some(path_tree) => path_tree.merge_path(path)?,
                            None => Arc::new(OpPathTree::from_op_paths(
                                self.graph.clone(),
                                edge_head,
                                [&**path],
                            )?),
                        });
                    }
                }
            }
        }
        if let Some(path_tree) = &path_tree {
            trace!(
                "Conditions resolved into {}",
                path_tree.to_string_with_conditions()
            );
        }
        Ok(ConditionResolution::Satisfied {
            cost: 1.0,
            path_tree,
        })
    }
}

impl ConditionResolver for CachingConditionResolver<'_> {
    fn resolve(
        &mut self,
        edge: EdgeIndex,
        context: &OpGraphPathContext,
        excluded_destinations: &ExcludedDestinations,
        excluded_conditions: &ExcludedConditions,
        extra_conditions: Option<&SelectionSet>,
    ) -> Result<ConditionResolution, FederationError> {
        if extra_conditions.is_some() {
            return self.resolve_without_cache(
                edge,
                context,
                excluded_destinations,
                excluded_conditions,
                extra_conditions,
            );
        }
        match self.cache.contains(
            edge,
            context,
            excluded_destinations,
            excluded_conditions,
            self.override_conditions,
        ) {
            ConditionResolutionCacheResult::Hit(resolution) => {
                trace!("Condition resolution cache hit for edge {}", edge.index());
                Ok(resolution)
            }
            ConditionResolutionCacheResult::Miss => {
                let resolution = self.resolve_without_cache(
                    edge,
                    context,
                    excluded_destinations,
                    excluded_conditions,
                    None,
                )?;
                self.cache.insert(
                    edge,
                    self.override_conditions,
                    resolution.clone(),
                    excluded_destinations.clone(),
                );
                Ok(resolution)
            }
            ConditionResolutionCacheResult::NotApplicable => self.resolve_without_cache(
                edge,
                context,
                excluded_destinations,
                excluded_conditions,
                None,
            ),
        }
    }

    fn indirect_paths_cache(&self) -> Option<&IndirectPathsCache> {
        Some(self.indirect_paths_cache)
    }
}

#[cfg(test)]
mod tests {
    use apollo_compiler::name;
    use petgraph::visit::EdgeRef;

    use super::*;
    use crate::query_graph::QueryGraphEdgeTransition;
    use crate::query_graph::test_support::federated_graph;
    use crate::schema::position::ObjectTypeDefinitionPosition;

    const API_SCHEMA: &str = r#"
        type Query { t: T }
        type T { id: ID! name: String }
    "#;

    const S1: &str = r#"
        type Query { t: T }
        type T @key(fields: "id") { id: ID! }
    "#;

    const S2: &str = r#"
        type Query { dummy: Int }
        type T @key(fields: "id") { id: ID! name: String }
    "#;

    fn key_edge_into(graph: &QueryGraph, source: &str) -> EdgeIndex {
        graph
            .graph()
            .edge_references()
            .find(|edge_ref| {
                matches!(
                    edge_ref.weight().transition,
                    QueryGraphEdgeTransition::KeyResolution
                ) && &*graph.node_weight(edge_ref.target()).unwrap().source == source
            })
            .unwrap()
            .id()
    }

    #[test]
    fn resolves_key_conditions_locally_and_caches_them() {
        let graph = federated_graph(API_SCHEMA, &[("S1", S1), ("S2", S2)]);
        let supergraph_schema = graph.supergraph_schema().unwrap();
        let overrides = EnabledOverrideConditions::default();
        let cache = ConditionResolverCache::default();
        let indirect_paths_cache = IndirectPathsCache::default();
        let mut resolver = CachingConditionResolver::new(
            graph.clone(),
            supergraph_schema,
            &overrides,
            &cache,
            &indirect_paths_cache,
        );

        let edge = key_edge_into(&graph, "S2");
        let resolution = resolver
            .resolve(
                edge,
                &Default::default(),
                &Default::default(),
                &Default::default(),
                None,
            )
            .unwrap();
        let ConditionResolution::Satisfied { cost, path_tree } = &resolution else {
            panic!("expected the key of S2 to be satisfiable, got {resolution:?}");
        };
        assert_eq!(*cost, 1.0);
        let path_tree = path_tree.as_ref().unwrap();
        assert!(path_tree.is_all_in_same_subgraph().unwrap());
        let rendered = path_tree.to_string();
        assert!(rendered.starts_with("T(S1):"), "{rendered}");
        assert!(rendered.ends_with("id = ID(S1)"), "{rendered}");
        assert_eq!(cache.len(), 1);

        // Same question again: answered from the cache.
        assert!(matches!(
            cache.contains(
                edge,
                &Default::default(),
                &Default::default(),
                &Default::default(),
                &overrides,
            ),
            ConditionResolutionCacheResult::Hit(_)
        ));
        // Other excluded destinations can't reuse the entry.
        assert!(matches!(
            cache.contains(
                edge,
                &Default::default(),
                &ExcludedDestinations::default().add_excluded("S3".into()),
                &Default::default(),
                &overrides,
            ),
            ConditionResolutionCacheResult::NotApplicable
        ));
    }

    #[test]
    fn conditions_missing_everywhere_are_unsatisfied() {
        let api_schema = r#"
            type Query { t: T }
            type T { id: ID! other: ID! }
        "#;
        let s1 = r#"
            type Query { t: T }
            type T @key(fields: "id") { id: ID! }
        "#;
        // The key of S2 uses a field that no subgraph can provide from S1.
        let s2 = r#"
            type Query { dummy: Int }
            type T @key(fields: "other") { other: ID! }
        "#;
        let graph = federated_graph(api_schema, &[("S1", s1), ("S2", s2)]);
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
        let resolution = resolver
            .resolve(
                key_edge_into(&graph, "S2"),
                &Default::default(),
                &Default::default(),
                &Default::default(),
                None,
            )
            .unwrap();
        assert!(
            matches!(resolution, ConditionResolution::Unsatisfied { reason: None }),
            "{resolution:?}"
        );
    }

    #[test]
    fn cache_ignores_non_empty_contexts_and_exclusions() {
        let cache = ConditionResolverCache::default();
        let overrides = EnabledOverrideConditions::default();
        let edge = EdgeIndex::new(0);
        cache.insert(
            edge,
            &overrides,
            ConditionResolution::no_conditions(),
            Default::default(),
        );
        let conditions = Arc::new(SelectionSet::empty(
            ValidFederationSchema::parse("type Query { a: Int }", "s.graphql").unwrap(),
            ObjectTypeDefinitionPosition::new(name!("Query")).into(),
        ));
        assert!(matches!(
            cache.contains(
                edge,
                &Default::default(),
                &Default::default(),
                &ExcludedConditions::default().add_item(conditions),
                &overrides,
            ),
            ConditionResolutionCacheResult::NotApplicable
        ));
        let other_overrides: EnabledOverrideConditions = ["label".to_owned()].into_iter().collect();
        assert!(matches!(
            cache.contains(
                edge,
                &Default::default(),
                &Default::default(),
                &Default::default(),
                &other_overrides,
            ),
            ConditionResolutionCacheResult::Miss
        ));
    }

    const FRAGMENT_API_SCHEMA: &str = r#"
        type Query { t: T }
        type T { id: ID! u: U onA: Int onB: Int }
        union U = A | B
        type A { x: Int }
        type B { x: Int }
    "#;

    // `U` has no `B` here, so `... on B` can't select anything from it.
    const FRAGMENT_S1: &str = r#"
        type Query { t: T }
        type T @key(fields: "id") { id: ID! u: U }
        union U = A
        type A { x: Int }
    "#;

    const FRAGMENT_S2: &str = r#"
        type Query { s2: Int }
        type T @key(fields: "id") {
            id: ID!
            u: U @external
            onA: Int @requires(fields: "u { ... on A { x } }")
            onB: Int @requires(fields: "u { ... on B { x } }")
        }
        union U = A | B
        type A { x: Int }
        type B { x: Int }
    "#;

    fn field_edge(graph: &QueryGraph, field_name: &str) -> EdgeIndex {
        graph
            .graph()
            .edge_references()
            .find(|edge_ref| {
                matches!(
                    &edge_ref.weight().transition,
                    QueryGraphEdgeTransition::FieldCollection { field_definition_position, .. }
                        if field_definition_position.field_name().as_str() == field_name
                )
            })
            .unwrap()
            .id()
    }

    #[test]
    fn required_fragments_selecting_nothing_are_unsatisfied() {
        let graph = federated_graph(
            FRAGMENT_API_SCHEMA,
            &[("S1", FRAGMENT_S1), ("S2", FRAGMENT_S2)],
        );
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
        let mut resolve = |field_name: &str| {
            resolver
                .resolve(
                    field_edge(&graph, field_name),
                    &Default::default(),
                    &Default::default(),
                    &Default::default(),
                    None,
                )
                .unwrap()
        };

        let on_a = resolve("onA");
        let ConditionResolution::Satisfied { path_tree, .. } = &on_a else {
            panic!("expected `... on A` to be found in S1, got {on_a:?}");
        };
        assert!(path_tree.is_some());

        let on_b = resolve("onB");
        assert!(
            matches!(on_b, ConditionResolution::Unsatisfied { .. }),
            "{on_b:?}"
        );
    }
}
