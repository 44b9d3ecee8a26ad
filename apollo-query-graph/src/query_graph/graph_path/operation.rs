use std::fmt::Display;
use std::fmt::Formatter;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use apollo_compiler::collections::IndexMap;
use petgraph::graph::EdgeIndex;
use petgraph::graph::NodeIndex;
use tracing::debug;
use tracing::trace;

use super::ExcludedConditions;
use super::ExcludedDestinations;
use super::OpGraphPath;
use super::OpGraphPathContext;
use super::OpPathElement;
use crate::error::FederationError;
use crate::operation::Field;
use crate::operation::InlineFragment;
use crate::query_graph::QueryGraphEdgeTransition;
use crate::query_graph::QueryGraphNodeType;
use crate::query_graph::condition_resolver::ConditionResolution;
use crate::query_graph::condition_resolver::ConditionResolver;
use crate::query_plan::QueryPlanCost;
use crate::query_plan::query_planner::EnabledOverrideConditions;
use crate::schema::ValidFederationSchema;
use crate::schema::position::CompositeTypeDefinitionPosition;
use crate::schema::position::OutputTypeDefinitionPosition;
use crate::utils::flat_cartesian_product;
use crate::utils::logging::snapshot;

/// A set of paths that must all be followed together. This happens when an operation element on
/// an abstract type has to be "type-exploded": each runtime type may need its own path, but they
/// all contribute to the same selection.
#[derive(Debug, Clone)]
pub(crate) struct SimultaneousPaths(pub(crate) Vec<Arc<OpGraphPath>>);

impl From<Arc<OpGraphPath>> for SimultaneousPaths {
    fn from(value: Arc<OpGraphPath>) -> Self {
        Self(vec![value])
    }
}

impl From<OpGraphPath> for SimultaneousPaths {
    fn from(value: OpGraphPath) -> Self {
        Arc::new(value).into()
    }
}

impl Display for SimultaneousPaths {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.0.as_slice() {
            [] => f.write_str("<no path>"),
            [path] => path.fmt(f),
            paths => {
                f.write_str("{ ")?;
                for (i, path) in paths.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    path.fmt(f)?;
                }
                f.write_str(" }")
            }
        }
    }
}

/// The paths reachable from the tail of some path using only edges that collect nothing and keep
/// the type (in practice key and root type resolutions), at most one per subgraph.
#[derive(Debug, Clone)]
pub(crate) struct IndirectPaths {
    pub(crate) paths: Arc<Vec<Arc<OpGraphPath>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct IndirectPathsCacheKey {
    tail: NodeIndex,
    last_edge: Option<EdgeIndex>,
    is_top_level: bool,
    override_conditions: EnabledOverrideConditions,
}

/// Caches the suffixes computed by indirect path searches. Suffixes only depend on where the
/// search starts (and which edge led there), so they can be shared by every path sharing a tail,
/// as long as no exclusion or context constrains the search.
#[derive(Debug, Default)]
pub(crate) struct IndirectPathsCache {
    suffixes: Mutex<IndexMap<IndirectPathsCacheKey, Arc<Vec<Arc<OpGraphPath>>>>>,
}

impl IndirectPathsCache {
    fn get(&self, key: &IndirectPathsCacheKey) -> Option<Arc<Vec<Arc<OpGraphPath>>>> {
        self.suffixes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn insert(&self, key: IndirectPathsCacheKey, suffixes: Arc<Vec<Arc<OpGraphPath>>>) {
        self.suffixes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_insert(suffixes);
    }

    pub(crate) fn len(&self) -> usize {
        self.suffixes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A set of simultaneous paths, along with their indirect options, computed on first use.
#[derive(Debug, Clone)]
pub(crate) struct SimultaneousPathsWithLazyIndirectPaths {
    pub(crate) paths: SimultaneousPaths,
    pub(crate) context: OpGraphPathContext,
    pub(crate) excluded_destinations: ExcludedDestinations,
    pub(crate) excluded_conditions: ExcludedConditions,
    lazily_computed_indirect_paths: Vec<Option<IndirectPaths>>,
}

impl Display for SimultaneousPathsWithLazyIndirectPaths {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.paths.fmt(f)
    }
}

/// Advances one option of an open branch with an operation element.
///
/// Returns `None` when the element cannot be collected from these paths at all, and an empty
/// list when the element is guaranteed to select nothing (a fragment whose type condition
/// matches none of the possible runtime types).
pub(crate) fn advance_simultaneous_paths_with_operation(
    supergraph_schema: &ValidFederationSchema,
    simultaneous_paths: &mut SimultaneousPathsWithLazyIndirectPaths,
    operation_element: &OpPathElement,
    condition_resolver: &mut impl ConditionResolver,
    override_conditions: &EnabledOverrideConditions,
) -> Result<Option<Vec<SimultaneousPathsWithLazyIndirectPaths>>, FederationError> {
    debug!(
        "Trying to advance {} with {}",
        simultaneous_paths, operation_element
    );
    let options = simultaneous_paths.advance_with_operation_element(
        supergraph_schema,
        operation_element,
        condition_resolver,
        override_conditions,
    )?;
    match &options {
        None => debug!("Cannot be advanced with {operation_element}"),
        Some(options) => {
            debug!("Advanced into {} option(s)", options.len());
            snapshot!(
                "SimultaneousPaths",
                options
                    .iter()
                    .map(|option| option.to_string())
                    .collect::<Vec<_>>()
                    .join("\n"),
                "advanced options"
            );
        }
    }
    Ok(options)
}

impl SimultaneousPathsWithLazyIndirectPaths {
    pub(crate) fn new(
        paths: SimultaneousPaths,
        context: OpGraphPathContext,
        excluded_destinations: ExcludedDestinations,
        excluded_conditions: ExcludedConditions,
    ) -> Self {
        let path_count = paths.0.len();
        Self {
            paths,
            context,
            excluded_destinations,
            excluded_conditions,
            lazily_computed_indirect_paths: vec![None; path_count],
        }
    }

    fn indirect_options(
        &mut self,
        updated_context: &OpGraphPathContext,
        path_index: usize,
        condition_resolver: &mut impl ConditionResolver,
        override_conditions: &EnabledOverrideConditions,
    ) -> Result<IndirectPaths, FederationError> {
        if let Some(Some(indirect_paths)) = self.lazily_computed_indirect_paths.get(path_index) {
            return Ok(indirect_paths.clone());
        }
        let Some(path) = self.paths.0.get(path_index) else {
            crate::bail!("No path at index {path_index} of {}", self.paths);
        };
        let indirect_paths = path.advance_with_non_collecting_and_type_preserving_transitions(
            updated_context,
            condition_resolver,
            &self.excluded_destinations,
            &self.excluded_conditions,
            override_conditions,
        )?;
        if let Some(slot) = self.lazily_computed_indirect_paths.get_mut(path_index) {
            *slot = Some(indirect_paths.clone());
        }
        Ok(indirect_paths)
    }

    /// Advances every path of the set with the element, directly or through indirect paths, and
    /// returns the cartesian product of the options found for each path.
    pub(crate) fn advance_with_operation_element(
        &mut self,
        supergraph_schema: &ValidFederationSchema,
        operation_element: &OpPathElement,
        condition_resolver: &mut impl ConditionResolver,
        override_conditions: &EnabledOverrideConditions,
    ) -> Result<Option<Vec<SimultaneousPathsWithLazyIndirectPaths>>, FederationError> {
        let updated_context = self.context.with_context_of(operation_element)?;
        let is_terminal = operation_element.is_terminal()?;
        let paths = self.paths.0.clone();
        let mut options_for_each_path = Vec::with_capacity(paths.len());
        for (path_index, path) in paths.iter().enumerate() {
            let mut options = Vec::new();
            let (direct_options, is_only_type_exploded) = path.advance_with_operation_element(
                supergraph_schema,
                operation_element,
                &updated_context,
                condition_resolver,
                override_conditions,
            )?;
            if let Some(direct_options) = direct_options {
                if direct_options.is_empty() {
                    // The element selects nothing from this path, so it selects nothing from the
                    // whole set either.
                    return Ok(Some(vec![]));
                }
                // A leaf collected locally can't be collected any cheaper by jumping elsewhere.
                // Type-exploded options are an exception: another subgraph may resolve the field
                // on the abstract type directly.
                if is_terminal && is_only_type_exploded != Some(true) {
                    options_for_each_path.push(direct_options);
                    continue;
                }
                options = direct_options;
            }

            let indirect_paths = self.indirect_options(
                &updated_context,
                path_index,
                condition_resolver,
                override_conditions,
            )?;
            let indirect_paths = match operation_element {
                OpPathElement::Field(field) => {
                    filter_non_collecting_paths_for_field(&indirect_paths.paths, field)?
                }
                OpPathElement::InlineFragment(_) => indirect_paths.paths.to_vec(),
            };
            for indirect_path in indirect_paths {
                let (advanced, _) = indirect_path.advance_with_operation_element(
                    supergraph_schema,
                    operation_element,
                    &updated_context,
                    condition_resolver,
                    override_conditions,
                )?;
                let Some(advanced) = advanced else {
                    continue;
                };
                if advanced.is_empty() {
                    return Ok(Some(vec![]));
                }
                options.extend(advanced);
            }

            if options.is_empty() {
                return Ok(None);
            }
            options_for_each_path.push(options);
        }

        let all_options = flat_cartesian_product(
            options_for_each_path
                .into_iter()
                .map(|options| options.into_iter().map(|option| option.0).collect())
                .collect(),
        );
        Ok(Some(
            all_options
                .into_iter()
                .map(|paths| {
                    SimultaneousPathsWithLazyIndirectPaths::new(
                        SimultaneousPaths(paths),
                        updated_context.clone(),
                        self.excluded_destinations.clone(),
                        self.excluded_conditions.clone(),
                    )
                })
                .collect(),
        ))
    }
}

/// Removes the indirect paths that are pointless for collecting a leaf field: if we jumped to a
/// subgraph through a key that already contains the field, we could have collected the field
/// before jumping.
fn filter_non_collecting_paths_for_field(
    paths: &[Arc<OpGraphPath>],
    field: &Field,
) -> Result<Vec<Arc<OpGraphPath>>, FederationError> {
    if !field.is_leaf()? {
        return Ok(paths.to_vec());
    }
    let mut filtered = Vec::with_capacity(paths.len());
    for path in paths {
        if let Some(last_edge) = path.last_edge() {
            let edge_weight = path.graph.edge_weight(last_edge)?;
            if matches!(
                edge_weight.transition,
                QueryGraphEdgeTransition::KeyResolution
            ) && let Some(conditions) = &edge_weight.conditions
                && conditions.contains_top_level_field(field)?
            {
                continue;
            }
        }
        filtered.push(path.clone());
    }
    Ok(filtered)
}

type AdvanceOptions = (Option<Vec<SimultaneousPaths>>, Option<bool>);

impl OpGraphPath {
    /// Computes the paths reachable from the tail using only non-collecting, type-preserving
    /// edges, keeping for each subgraph the path with the fewest edges (then the cheapest).
    pub(crate) fn advance_with_non_collecting_and_type_preserving_transitions(
        &self,
        context: &OpGraphPathContext,
        condition_resolver: &mut impl ConditionResolver,
        excluded_destinations: &ExcludedDestinations,
        excluded_conditions: &ExcludedConditions,
        override_conditions: &EnabledOverrideConditions,
    ) -> Result<IndirectPaths, FederationError> {
        let is_top_level = self.is_on_top_level_query_root()?;
        let cache_key = (excluded_destinations.is_empty()
            && excluded_conditions.is_empty()
            && context.is_empty())
        .then(|| IndirectPathsCacheKey {
            tail: self.tail,
            last_edge: self.last_non_null_edge(),
            is_top_level,
            override_conditions: override_conditions.clone(),
        });
        let cached = match (&cache_key, condition_resolver.indirect_paths_cache()) {
            (Some(key), Some(cache)) => cache.get(key),
            _ => None,
        };
        let suffixes = match cached {
            Some(suffixes) => {
                trace!("Reusing {} cached indirect path(s)", suffixes.len());
                suffixes
            }
            None => {
                let suffixes = Arc::new(self.indirect_path_suffixes(
                    is_top_level,
                    context,
                    condition_resolver,
                    excluded_destinations,
                    excluded_conditions,
                    override_conditions,
                )?);
                if let (Some(key), Some(cache)) =
                    (cache_key, condition_resolver.indirect_paths_cache())
                {
                    cache.insert(key, suffixes.clone());
                }
                suffixes
            }
        };
        let paths = suffixes
            .iter()
            .map(|suffix| Ok(Arc::new(self.concat(suffix)?)))
            .collect::<Result<Vec<_>, FederationError>>()?;
        Ok(IndirectPaths {
            paths: Arc::new(paths),
        })
    }

    fn indirect_path_suffixes(
        &self,
        is_top_level: bool,
        context: &OpGraphPathContext,
        condition_resolver: &mut impl ConditionResolver,
        excluded_destinations: &ExcludedDestinations,
        excluded_conditions: &ExcludedConditions,
        override_conditions: &EnabledOverrideConditions,
    ) -> Result<Vec<Arc<OpGraphPath>>, FederationError> {
        let tail_weight = self.graph.node_weight(self.tail)?;
        let tail_type_name = match &tail_weight.type_ {
            QueryGraphNodeType::SchemaType(type_pos) => Some(type_pos.type_name().clone()),
            QueryGraphNodeType::FederatedRootType(_) => None,
        };
        // `None` marks the subgraph we start from: there is no point in coming back to it.
        let mut best_path_by_source: IndexMap<Arc<str>, Option<(Arc<OpGraphPath>, QueryPlanCost)>> =
            IndexMap::default();
        best_path_by_source.insert(tail_weight.source.clone(), None);

        let mut to_try = vec![Arc::new(OpGraphPath::new(self.graph.clone(), self.tail)?)];
        while let Some(to_advance) = to_try.pop() {
            let next_edges = if to_advance.edges.is_empty() {
                self.next_edges()
            } else {
                to_advance.next_edges()
            };
            for edge in next_edges {
                let edge_weight = self.graph.edge_weight(edge)?;
                if edge_weight.transition.collect_operation_elements() {
                    continue;
                }
                let (_, edge_tail) = self.graph.edge_endpoints(edge)?;
                let edge_tail_weight = self.graph.node_weight(edge_tail)?;
                let target_source = &edge_tail_weight.source;
                if excluded_destinations.is_excluded(target_source) {
                    continue;
                }
                // Going back to a root from the top-level query root is never useful: we could
                // have entered that subgraph directly.
                let is_root_type_resolution = matches!(
                    edge_weight.transition,
                    QueryGraphEdgeTransition::RootTypeResolution { .. }
                );
                if is_top_level && is_root_type_resolution {
                    continue;
                }
                if excluded_conditions.is_excluded(edge_weight.conditions.as_ref()) {
                    continue;
                }
                if !edge_weight.satisfies_override_conditions(override_conditions) {
                    continue;
                }
                let preserves_type = match (&tail_type_name, &edge_tail_weight.type_) {
                    (None, _) => true,
                    (Some(tail_type_name), QueryGraphNodeType::SchemaType(target_type)) => {
                        target_type.type_name() == tail_type_name
                            || is_root_type_resolution
                            || self.graph.is_interface_object_node(edge_tail)?
                    }
                    (Some(_), QueryGraphNodeType::FederatedRootType(_)) => false,
                };
                if !preserves_type {
                    continue;
                }
                match best_path_by_source.get(target_source) {
                    Some(None) => continue,
                    Some(Some((best_path, _))) if best_path.size() <= to_advance.size() => {
                        continue;
                    }
                    _ => {}
                }

                let resolution = to_advance.can_satisfy_conditions(
                    edge,
                    condition_resolver,
                    context,
                    excluded_destinations,
                    excluded_conditions,
                )?;
                let ConditionResolution::Satisfied { cost, .. } = &resolution else {
                    continue;
                };
                let cost = *cost;
                let new_path =
                    Arc::new(to_advance.add(context.clone().into(), Some(edge), resolution)?);
                if let Some(Some((best_path, best_cost))) = best_path_by_source.get(target_source)
                    && (best_path.size() < new_path.size()
                        || (best_path.size() == new_path.size() && *best_cost <= cost))
                {
                    continue;
                }
                trace!("Found indirect path {new_path} (cost {cost})");
                best_path_by_source.insert(target_source.clone(), Some((new_path.clone(), cost)));
                to_try.push(new_path);
            }
        }
        Ok(best_path_by_source
            .into_values()
            .flatten()
            .map(|(path, _)| path)
            .collect())
    }

    /// Advances the path with an operation element using only edges out of the tail.
    ///
    /// The first element of the result is `None` if the element can't be collected from the tail,
    /// and an empty list if it is guaranteed to select nothing. The second element is `Some(true)`
    /// when the options come from exploding an abstract type into its runtime types.
    pub(crate) fn advance_with_operation_element(
        &self,
        supergraph_schema: &ValidFederationSchema,
        operation_element: &OpPathElement,
        context: &OpGraphPathContext,
        condition_resolver: &mut impl ConditionResolver,
        override_conditions: &EnabledOverrideConditions,
    ) -> Result<AdvanceOptions, FederationError> {
        let tail_weight = self.graph.node_weight(self.tail)?;
        let QueryGraphNodeType::SchemaType(tail_type_pos) = &tail_weight.type_ else {
            // Subgraphs must be entered before collecting anything.
            return Ok((None, None));
        };
        match operation_element {
            OpPathElement::Field(field) => match tail_type_pos {
                OutputTypeDefinitionPosition::Object(tail_type) => {
                    if let CompositeTypeDefinitionPosition::Object(field_parent) =
                        field.parent_type_position()
                        && field_parent != tail_type
                        && !self.tail_is_interface_object()?
                    {
                        return Ok((None, None));
                    }
                    let path = self.advance_with_field_edge(
                        field,
                        operation_element,
                        context,
                        condition_resolver,
                        override_conditions,
                    )?;
                    Ok((path.map(|path| vec![path.into()]), None))
                }
                OutputTypeDefinitionPosition::Interface(tail_type) => {
                    let tail_type: CompositeTypeDefinitionPosition = tail_type.clone().into();
                    if let CompositeTypeDefinitionPosition::Object(field_parent) =
                        field.parent_type_position()
                        && field_parent.type_name != *tail_type.type_name()
                    {
                        // We're on an interface but the field is on an implementation (which
                        // happens after an @interfaceObject resolved to the real interface): the
                        // cast the @interfaceObject absorbed has to be applied first. A parent
                        // named like the interface is the @interfaceObject itself, as in the
                        // conditions of its keys, so there is nothing to cast.
                        return self.advance_with_field_after_cast(
                            supergraph_schema,
                            tail_type,
                            field_parent.clone().into(),
                            operation_element,
                            context,
                            condition_resolver,
                            override_conditions,
                        );
                    }
                    if let Some(path) = self.advance_with_field_edge(
                        field,
                        operation_element,
                        context,
                        condition_resolver,
                        override_conditions,
                    )? {
                        return Ok((Some(vec![path.into()]), None));
                    }
                    self.type_explode_field(
                        supergraph_schema,
                        tail_type,
                        field,
                        context,
                        condition_resolver,
                        override_conditions,
                    )
                }
                OutputTypeDefinitionPosition::Union(tail_type) => {
                    // Only `__typename` can be collected on a union directly.
                    if let Some(path) = self.advance_with_field_edge(
                        field,
                        operation_element,
                        context,
                        condition_resolver,
                        override_conditions,
                    )? {
                        return Ok((Some(vec![path.into()]), None));
                    }
                    self.type_explode_field(
                        supergraph_schema,
                        tail_type.clone().into(),
                        field,
                        context,
                        condition_resolver,
                        override_conditions,
                    )
                }
                OutputTypeDefinitionPosition::Scalar(_) | OutputTypeDefinitionPosition::Enum(_) => {
                    Ok((None, None))
                }
            },
            OpPathElement::InlineFragment(inline_fragment) => {
                let Ok(tail_type) = CompositeTypeDefinitionPosition::try_from(tail_type_pos.clone())
                else {
                    return Ok((None, None));
                };
                self.advance_with_inline_fragment(
                    supergraph_schema,
                    tail_type,
                    inline_fragment,
                    operation_element,
                    context,
                    condition_resolver,
                    override_conditions,
                )
            }
        }
    }

    fn advance_with_field_edge(
        &self,
        field: &Field,
        operation_element: &OpPathElement,
        context: &OpGraphPathContext,
        condition_resolver: &mut impl ConditionResolver,
        override_conditions: &EnabledOverrideConditions,
    ) -> Result<Option<OpGraphPath>, FederationError> {
        let Some(edge) =
            self.graph
                .edge_for_field(self.tail, field.name(), override_conditions)?
        else {
            return Ok(None);
        };
        let resolution = self.can_satisfy_conditions(
            edge,
            condition_resolver,
            context,
            &Default::default(),
            &Default::default(),
        )?;
        if !matches!(resolution, ConditionResolution::Satisfied { .. }) {
            trace!("Conditions of {} cannot be satisfied", field.name());
            return Ok(None);
        }
        Ok(Some(self.add(
            operation_element.clone().into(),
            Some(edge),
            resolution,
        )?))
    }

    #[allow(clippy::too_many_arguments)]
    fn advance_with_field_after_cast(
        &self,
        supergraph_schema: &ValidFederationSchema,
        tail_type: CompositeTypeDefinitionPosition,
        field_parent: CompositeTypeDefinitionPosition,
        operation_element: &OpPathElement,
        context: &OpGraphPathContext,
        condition_resolver: &mut impl ConditionResolver,
        override_conditions: &EnabledOverrideConditions,
    ) -> Result<AdvanceOptions, FederationError> {
        let cast: OpPathElement =
            InlineFragment::new_cast(supergraph_schema, tail_type, field_parent).into();
        let (cast_options, _) = self.advance_with_operation_element(
            supergraph_schema,
            &cast,
            context,
            condition_resolver,
            override_conditions,
        )?;
        let Some(cast_options) = cast_options else {
            return Ok((None, None));
        };
        let mut options = Vec::new();
        for cast_option in cast_options {
            for cast_path in &cast_option.0 {
                let (field_options, _) = cast_path.advance_with_operation_element(
                    supergraph_schema,
                    operation_element,
                    context,
                    condition_resolver,
                    override_conditions,
                )?;
                let Some(field_options) = field_options else {
                    return Ok((None, None));
                };
                options.extend(field_options);
            }
        }
        Ok((Some(options), None))
    }

    /// Collects a field of an abstract type by casting to each possible runtime type and
    /// collecting the field on each of them. The options are the cartesian product of the options
    /// of each runtime type.
    fn type_explode_field(
        &self,
        supergraph_schema: &ValidFederationSchema,
        tail_type: CompositeTypeDefinitionPosition,
        field: &Field,
        context: &OpGraphPathContext,
        condition_resolver: &mut impl ConditionResolver,
        override_conditions: &EnabledOverrideConditions,
    ) -> Result<AdvanceOptions, FederationError> {
        let supergraph_tail_type: CompositeTypeDefinitionPosition = supergraph_schema
            .get_type(tail_type.type_name().clone())?
            .try_into()?;
        let mut options_by_implementation = Vec::new();
        for implementation in supergraph_schema.possible_runtime_types(supergraph_tail_type)? {
            if !self.runtime_types_of_tail.contains(&implementation) {
                continue;
            }
            let implementation_type: CompositeTypeDefinitionPosition = implementation.into();
            let cast: OpPathElement =
                InlineFragment::new_cast(supergraph_schema, tail_type.clone(), implementation_type.clone())
                    .into();
            let mut cast_paths = self.lazy_from_self(context);
            let Some(cast_options) = cast_paths.advance_with_operation_element(
                supergraph_schema,
                &cast,
                condition_resolver,
                override_conditions,
            )?
            else {
                return Ok((None, None));
            };
            if cast_options.is_empty() {
                continue;
            }
            let implementation_field: OpPathElement = field
                .with_updated_position(supergraph_schema.clone(), implementation_type)
                .into();
            let mut field_options = Vec::new();
            for mut cast_option in cast_options {
                let Some(advanced) = cast_option.advance_with_operation_element(
                    supergraph_schema,
                    &implementation_field,
                    condition_resolver,
                    override_conditions,
                )?
                else {
                    continue;
                };
                field_options.extend(advanced.into_iter().map(|option| option.paths.0));
            }
            if field_options.is_empty() {
                return Ok((None, None));
            }
            options_by_implementation.push(field_options);
        }
        let options = flat_cartesian_product(options_by_implementation)
            .into_iter()
            .map(SimultaneousPaths)
            .collect();
        Ok((Some(options), Some(true)))
    }

    #[allow(clippy::too_many_arguments)]
    fn advance_with_inline_fragment(
        &self,
        supergraph_schema: &ValidFederationSchema,
        tail_type: CompositeTypeDefinitionPosition,
        inline_fragment: &InlineFragment,
        operation_element: &OpPathElement,
        context: &OpGraphPathContext,
        condition_resolver: &mut impl ConditionResolver,
        override_conditions: &EnabledOverrideConditions,
    ) -> Result<AdvanceOptions, FederationError> {
        let Some(type_condition) = &inline_fragment.type_condition_position else {
            return Ok((Some(self.no_op_advance(operation_element)?), None));
        };
        if type_condition.type_name() == tail_type.type_name() {
            return Ok((Some(self.no_op_advance(operation_element)?), None));
        }

        if self.tail_is_interface_object()? {
            if let Some(edge) = self
                .graph
                .edge_for_type_name(self.tail, type_condition.type_name())?
            {
                let resolution = self.can_satisfy_conditions(
                    edge,
                    condition_resolver,
                    context,
                    &Default::default(),
                    &Default::default(),
                )?;
                if !matches!(resolution, ConditionResolution::Satisfied { .. }) {
                    return Ok((None, None));
                }
                let path = self.add(operation_element.clone().into(), Some(edge), resolution)?;
                return Ok((Some(vec![path.into()]), None));
            }
            // An abstract condition overlapping the interface is a no-op on the @interfaceObject.
            let supergraph_interface: CompositeTypeDefinitionPosition = supergraph_schema
                .get_type(tail_type.type_name().clone())?
                .try_into()?;
            let implementations = supergraph_schema.possible_runtime_types(supergraph_interface)?;
            if type_condition.is_abstract_type()
                && supergraph_schema
                    .possible_runtime_types(type_condition.clone())?
                    .iter()
                    .any(|runtime_type| implementations.contains(runtime_type))
            {
                return Ok((Some(self.no_op_advance(operation_element)?), None));
            }
            return Ok((Some(vec![]), None));
        }

        match &tail_type {
            CompositeTypeDefinitionPosition::Object(tail_object) => {
                // Casting an object to an abstract type that includes it changes nothing, and
                // casting it to anything else selects nothing.
                if type_condition.is_abstract_type()
                    && supergraph_schema
                        .possible_runtime_types(type_condition.clone())?
                        .contains(tail_object)
                {
                    return Ok((Some(self.no_op_advance(operation_element)?), None));
                }
                Ok((Some(vec![]), None))
            }
            CompositeTypeDefinitionPosition::Interface(_)
            | CompositeTypeDefinitionPosition::Union(_) => {
                if let Some(edge) = self
                    .graph
                    .edge_for_type_name(self.tail, type_condition.type_name())?
                {
                    let path = self.add(
                        operation_element.clone().into(),
                        Some(edge),
                        ConditionResolution::no_conditions(),
                    )?;
                    return Ok((Some(vec![path.into()]), None));
                }
                if type_condition.is_object_type() {
                    // Not a runtime type of the tail in this subgraph.
                    return Ok((Some(vec![]), None));
                }
                let intersection: Vec<_> = supergraph_schema
                    .possible_runtime_types(type_condition.clone())?
                    .into_iter()
                    .filter(|runtime_type| self.runtime_types_of_tail.contains(runtime_type))
                    .collect();
                if intersection.is_empty() {
                    return Ok((Some(vec![]), None));
                }
                let mut options_by_type = Vec::new();
                for runtime_type in intersection {
                    let cast: OpPathElement = InlineFragment {
                        schema: supergraph_schema.clone(),
                        parent_type_position: tail_type.clone(),
                        type_condition_position: Some(runtime_type.into()),
                        directives: inline_fragment.directives.clone(),
                    }
                    .into();
                    let mut cast_paths = self.lazy_from_self(context);
                    let Some(cast_options) = cast_paths.advance_with_operation_element(
                        supergraph_schema,
                        &cast,
                        condition_resolver,
                        override_conditions,
                    )?
                    else {
                        return Ok((None, None));
                    };
                    if cast_options.is_empty() {
                        continue;
                    }
                    options_by_type
                        .push(cast_options.into_iter().map(|option| option.paths.0).collect());
                }
                let options = flat_cartesian_product(options_by_type)
                    .into_iter()
                    .map(SimultaneousPaths)
                    .collect();
                Ok((Some(options), None))
            }
        }
    }

    /// The path itself, with a `None` edge recording the element when it carries directives.
    fn no_op_advance(
        &self,
        operation_element: &OpPathElement,
    ) -> Result<Vec<SimultaneousPaths>, FederationError> {
        let path = if operation_element.directives().is_empty() {
            self.clone()
        } else {
            self.add(
                operation_element.clone().into(),
                None,
                ConditionResolution::no_conditions(),
            )?
        };
        Ok(vec![path.into()])
    }

    fn lazy_from_self(&self, context: &OpGraphPathContext) -> SimultaneousPathsWithLazyIndirectPaths {
        SimultaneousPathsWithLazyIndirectPaths::new(
            Arc::new(self.clone()).into(),
            context.clone(),
            ExcludedDestinations::default(),
            ExcludedConditions::default(),
        )
    }
}
