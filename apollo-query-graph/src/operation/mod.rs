//! Normalized operations and selection sets.
//!
//! These are analogues of the apollo-compiler executable types with these changes:
//! - They store the schema they are queried against, and positions in that schema instead of
//!   bare type names.
//! - Fragment spreads are expanded into inline fragments.
//! - Selections are stored in a map keyed by what makes two selections mergeable, so merging
//!   selection sets is cheap.
//! - Collections are behind `Arc`s so cloning is cheap.
use std::fmt::Display;
use std::fmt::Formatter;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;

use apollo_compiler::ExecutableDocument;
use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::collections::IndexMap;
use apollo_compiler::executable;
use apollo_compiler::name;
use apollo_compiler::validation::Valid;
use indexmap::map::Entry;

use crate::bail;
use crate::error::FederationError;
use crate::error::SingleFederationError;
use crate::query_graph::graph_path::OpPathElement;
use crate::schema::ValidFederationSchema;
use crate::schema::position::CompositeTypeDefinitionPosition;
use crate::schema::position::FieldDefinitionPosition;
use crate::schema::position::TypeDefinitionPosition;

mod directive_list;

pub(crate) use directive_list::DirectiveList;

const SCHEMA_INTROSPECTION_FIELD_NAME: Name = name!("__schema");
const TYPE_INTROSPECTION_FIELD_NAME: Name = name!("__type");

/// An operation of an executable document, normalized against a schema.
#[derive(Debug, Clone)]
pub struct Operation {
    pub(crate) schema: ValidFederationSchema,
    pub(crate) root_kind: crate::schema::position::SchemaRootDefinitionKind,
    pub(crate) name: Option<Name>,
    pub(crate) selection_set: SelectionSet,
}

impl Operation {
    /// Parses and validates `source_text` against the schema, then normalizes the selected
    /// operation.
    pub fn parse(
        schema: ValidFederationSchema,
        source_text: &str,
        source_name: &str,
        operation_name: Option<&str>,
    ) -> Result<Self, FederationError> {
        let document =
            ExecutableDocument::parse_and_validate(schema.schema(), source_text, source_name)?;
        Operation::from_operation_document(schema, &document, operation_name)
    }

    pub fn from_operation_document(
        schema: ValidFederationSchema,
        document: &Valid<ExecutableDocument>,
        operation_name: Option<&str>,
    ) -> Result<Self, FederationError> {
        let operation = document.operations.get(operation_name).map_err(|_| {
            SingleFederationError::InvalidGraphQL {
                message: match operation_name {
                    Some(name) => format!("Unknown operation named \"{name}\""),
                    None => "Must provide operation name if query contains multiple operations."
                        .to_owned(),
                },
            }
        })?;
        let selection_set =
            SelectionSet::from_selection_set(&operation.selection_set, &document.fragments, &schema)?;
        Ok(Operation {
            schema,
            root_kind: operation.operation_type.into(),
            name: operation.name.clone(),
            selection_set,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.root_kind)?;
        if let Some(name) = &self.name {
            write!(f, " {name}")?;
        }
        write!(f, " {}", self.selection_set)
    }
}

/// What makes two selections of a selection set mergeable: same response name (or type
/// condition) and same directives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum SelectionKey {
    Field {
        /// Alias if any, else the field name.
        response_name: Name,
        directives: DirectiveList,
    },
    InlineFragment {
        type_condition: Option<Name>,
        directives: DirectiveList,
    },
}

pub(crate) type SelectionMap = IndexMap<SelectionKey, Selection>;

/// The named fragments of an executable document.
pub(crate) type FragmentMap = IndexMap<Name, Node<executable::Fragment>>;

#[derive(Debug, Clone)]
pub(crate) struct SelectionSet {
    pub(crate) schema: ValidFederationSchema,
    pub(crate) type_position: CompositeTypeDefinitionPosition,
    pub(crate) selections: Arc<SelectionMap>,
}

impl PartialEq for SelectionSet {
    fn eq(&self, other: &Self) -> bool {
        self.type_position == other.type_position && self.selections == other.selections
    }
}

impl Eq for SelectionSet {}

impl Hash for SelectionSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_position.hash(state);
        self.selections.len().hash(state);
        for key in self.selections.keys() {
            key.hash(state);
        }
    }
}

impl SelectionSet {
    pub(crate) fn empty(
        schema: ValidFederationSchema,
        type_position: CompositeTypeDefinitionPosition,
    ) -> Self {
        Self {
            schema,
            type_position,
            selections: Default::default(),
        }
    }

    /// Normalizes an apollo-compiler selection set: fragment spreads become inline fragments,
    /// `__schema`/`__type` introspection is dropped, fragments without directives on the parent
    /// type are hoisted, and selections with the same key are merged.
    pub(crate) fn from_selection_set(
        selection_set: &executable::SelectionSet,
        fragments: &FragmentMap,
        schema: &ValidFederationSchema,
    ) -> Result<SelectionSet, FederationError> {
        let type_position: CompositeTypeDefinitionPosition =
            schema.get_type(selection_set.ty.clone())?.try_into()?;
        let mut normalized_selections = vec![];
        SelectionSet::normalize_selections(
            &selection_set.selections,
            &type_position,
            &mut normalized_selections,
            fragments,
            schema,
        )?;
        let mut merged = SelectionSet::empty(schema.clone(), type_position);
        for selection in normalized_selections {
            merged.add_local_selection(selection)?;
        }
        Ok(merged)
    }

    fn normalize_selections(
        selections: &[executable::Selection],
        parent_type_position: &CompositeTypeDefinitionPosition,
        destination: &mut Vec<Selection>,
        fragments: &FragmentMap,
        schema: &ValidFederationSchema,
    ) -> Result<(), FederationError> {
        for selection in selections {
            match selection {
                executable::Selection::Field(field_selection) => {
                    if field_selection.name == SCHEMA_INTROSPECTION_FIELD_NAME
                        || field_selection.name == TYPE_INTROSPECTION_FIELD_NAME
                    {
                        continue;
                    }
                    let field = Field {
                        schema: schema.clone(),
                        field_position: parent_type_position.field(field_selection.name.clone()),
                        alias: field_selection.alias.clone(),
                        arguments: Arc::new(field_selection.arguments.clone()),
                        directives: DirectiveList::from(&field_selection.directives),
                    };
                    let selection_set = if field_selection.selection_set.selections.is_empty() {
                        None
                    } else {
                        Some(SelectionSet::from_selection_set(
                            &field_selection.selection_set,
                            fragments,
                            schema,
                        )?)
                    };
                    destination.push(Selection::from_field(field, selection_set));
                }
                executable::Selection::FragmentSpread(fragment_spread) => {
                    let Some(fragment) = fragments.get(&fragment_spread.fragment_name) else {
                        bail!(
                            "Fragment spread referenced non-existent fragment \"{}\"",
                            fragment_spread.fragment_name,
                        );
                    };
                    SelectionSet::normalize_fragment(
                        Some(fragment.type_condition()),
                        &fragment_spread.directives,
                        &fragment.selection_set,
                        parent_type_position,
                        destination,
                        fragments,
                        schema,
                    )?;
                }
                executable::Selection::InlineFragment(inline_fragment) => {
                    SelectionSet::normalize_fragment(
                        inline_fragment.type_condition.as_ref(),
                        &inline_fragment.directives,
                        &inline_fragment.selection_set,
                        parent_type_position,
                        destination,
                        fragments,
                        schema,
                    )?;
                }
            }
        }
        Ok(())
    }

    fn normalize_fragment(
        type_condition: Option<&Name>,
        directives: &executable::DirectiveList,
        selection_set: &executable::SelectionSet,
        parent_type_position: &CompositeTypeDefinitionPosition,
        destination: &mut Vec<Selection>,
        fragments: &FragmentMap,
        schema: &ValidFederationSchema,
    ) -> Result<(), FederationError> {
        let is_on_parent_type =
            type_condition.is_none_or(|type_name| type_name == parent_type_position.type_name());
        // A fragment on the parent type without directives adds nothing, so its selections are
        // hoisted into the parent.
        if is_on_parent_type && directives.is_empty() {
            return SelectionSet::normalize_selections(
                &selection_set.selections,
                parent_type_position,
                destination,
                fragments,
                schema,
            );
        }
        let type_condition_position = type_condition
            .map(|type_name| -> Result<CompositeTypeDefinitionPosition, FederationError> {
                Ok(schema.get_type(type_name.clone())?.try_into()?)
            })
            .transpose()?;
        let inline_fragment = InlineFragment {
            schema: schema.clone(),
            parent_type_position: parent_type_position.clone(),
            type_condition_position,
            directives: DirectiveList::from(directives),
        };
        let selection_set = SelectionSet::from_selection_set(selection_set, fragments, schema)?;
        destination.push(Selection::from_inline_fragment(
            inline_fragment,
            selection_set,
        ));
        Ok(())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.selections.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.selections.len()
    }

    pub(crate) fn iter(&self) -> impl DoubleEndedIterator<Item = &Selection> + ExactSizeIterator {
        self.selections.values()
    }

    pub(crate) fn contains_top_level_field(&self, field: &Field) -> Result<bool, FederationError> {
        if let Some(selection) = self.selections.get(&field.key()) {
            let Selection::Field(field_selection) = selection else {
                bail!(
                    "Field selection key for field \"{}\" references non-field selection",
                    field.field_position,
                );
            };
            Ok(field_selection.field == *field)
        } else {
            Ok(false)
        }
    }

    /// Adds a selection, merging it with an existing selection of the same key if any.
    pub(crate) fn add_local_selection(&mut self, selection: Selection) -> Result<(), FederationError> {
        let selections = Arc::make_mut(&mut self.selections);
        match selections.entry(selection.key()) {
            Entry::Vacant(entry) => {
                entry.insert(selection);
            }
            Entry::Occupied(mut entry) => {
                let merged = entry.get().merge(&selection)?;
                entry.insert(merged);
            }
        }
        Ok(())
    }

    /// Merges two selection sets on the same type into a new one.
    pub(crate) fn merge(&self, other: &SelectionSet) -> Result<SelectionSet, FederationError> {
        if self.type_position != other.type_position {
            bail!(
                "Cannot merge selection set on \"{}\" with selection set on \"{}\"",
                self.type_position,
                other.type_position,
            );
        }
        if Arc::ptr_eq(&self.selections, &other.selections) {
            return Ok(self.clone());
        }
        let mut merged = self.clone();
        for selection in other.iter() {
            merged.add_local_selection(selection.clone())?;
        }
        Ok(merged)
    }
}

impl Display for SelectionSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.selections.is_empty() {
            return f.write_str("{}");
        }
        f.write_str("{")?;
        for selection in self.iter() {
            write!(f, " {selection}")?;
        }
        f.write_str(" }")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Selection {
    Field(Arc<FieldSelection>),
    InlineFragment(Arc<InlineFragmentSelection>),
}

impl Selection {
    pub(crate) fn from_field(field: Field, selection_set: Option<SelectionSet>) -> Self {
        Selection::Field(Arc::new(FieldSelection {
            field,
            selection_set,
        }))
    }

    pub(crate) fn from_inline_fragment(
        inline_fragment: InlineFragment,
        selection_set: SelectionSet,
    ) -> Self {
        Selection::InlineFragment(Arc::new(InlineFragmentSelection {
            inline_fragment,
            selection_set,
        }))
    }

    pub(crate) fn key(&self) -> SelectionKey {
        match self {
            Selection::Field(field_selection) => field_selection.field.key(),
            Selection::InlineFragment(fragment_selection) => {
                fragment_selection.inline_fragment.key()
            }
        }
    }

    pub(crate) fn element(&self) -> OpPathElement {
        match self {
            Selection::Field(field_selection) => {
                OpPathElement::Field(field_selection.field.clone())
            }
            Selection::InlineFragment(fragment_selection) => {
                OpPathElement::InlineFragment(fragment_selection.inline_fragment.clone())
            }
        }
    }

    pub(crate) fn selection_set(&self) -> Option<&SelectionSet> {
        match self {
            Selection::Field(field_selection) => field_selection.selection_set.as_ref(),
            Selection::InlineFragment(fragment_selection) => {
                Some(&fragment_selection.selection_set)
            }
        }
    }

    fn merge(&self, other: &Selection) -> Result<Selection, FederationError> {
        match (self, other) {
            (Selection::Field(left), Selection::Field(right)) => {
                let selection_set = match (&left.selection_set, &right.selection_set) {
                    (Some(left), Some(right)) => Some(left.merge(right)?),
                    (Some(set), None) | (None, Some(set)) => Some(set.clone()),
                    (None, None) => None,
                };
                Ok(Selection::from_field(left.field.clone(), selection_set))
            }
            (Selection::InlineFragment(left), Selection::InlineFragment(right)) => {
                Ok(Selection::from_inline_fragment(
                    left.inline_fragment.clone(),
                    left.selection_set.merge(&right.selection_set)?,
                ))
            }
            _ => bail!("Cannot merge selections with mismatched kinds for the same key"),
        }
    }
}

impl Display for Selection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Selection::Field(field_selection) => {
                field_selection.field.fmt(f)?;
                if let Some(selection_set) = &field_selection.selection_set {
                    write!(f, " {selection_set}")?;
                }
                Ok(())
            }
            Selection::InlineFragment(fragment_selection) => write!(
                f,
                "{} {}",
                fragment_selection.inline_fragment, fragment_selection.selection_set
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FieldSelection {
    pub(crate) field: Field,
    pub(crate) selection_set: Option<SelectionSet>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InlineFragmentSelection {
    pub(crate) inline_fragment: InlineFragment,
    pub(crate) selection_set: SelectionSet,
}

/// A field element of an operation. Equality and hashing ignore the schema.
#[derive(Debug, Clone)]
pub(crate) struct Field {
    pub(crate) schema: ValidFederationSchema,
    pub(crate) field_position: FieldDefinitionPosition,
    pub(crate) alias: Option<Name>,
    pub(crate) arguments: Arc<Vec<Node<executable::Argument>>>,
    pub(crate) directives: DirectiveList,
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        self.field_position == other.field_position
            && self.alias == other.alias
            && self.arguments == other.arguments
            && self.directives == other.directives
    }
}

impl Eq for Field {}

impl Hash for Field {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.field_position.hash(state);
        self.alias.hash(state);
        self.arguments.len().hash(state);
        for argument in self.arguments.iter() {
            argument.hash(state);
        }
        self.directives.hash(state);
    }
}

impl Field {
    /// A trivial field without alias, arguments or directives.
    #[cfg(test)]
    pub(crate) fn from_position(
        schema: &ValidFederationSchema,
        field_position: FieldDefinitionPosition,
    ) -> Self {
        Self {
            schema: schema.clone(),
            field_position,
            alias: None,
            arguments: Default::default(),
            directives: Default::default(),
        }
    }

    pub(crate) fn name(&self) -> &Name {
        self.field_position.field_name()
    }

    pub(crate) fn response_name(&self) -> Name {
        self.alias.clone().unwrap_or_else(|| self.name().clone())
    }

    pub(crate) fn key(&self) -> SelectionKey {
        SelectionKey::Field {
            response_name: self.response_name(),
            directives: self.directives.clone(),
        }
    }

    pub(crate) fn parent_type_position(&self) -> &CompositeTypeDefinitionPosition {
        self.field_position.parent()
    }

    pub(crate) fn output_base_type(&self) -> Result<TypeDefinitionPosition, FederationError> {
        let definition = self.field_position.get(self.schema.schema())?;
        self.schema
            .get_type(definition.ty.inner_named_type().clone())
    }

    pub(crate) fn is_leaf(&self) -> Result<bool, FederationError> {
        Ok(matches!(
            self.output_base_type()?,
            TypeDefinitionPosition::Scalar(_) | TypeDefinitionPosition::Enum(_)
        ))
    }

    /// The same field, but on another parent type (for instance an implementation of the
    /// interface the field was queried on).
    pub(crate) fn with_updated_position(
        &self,
        schema: ValidFederationSchema,
        parent: CompositeTypeDefinitionPosition,
    ) -> Field {
        Field {
            schema,
            field_position: parent.field(self.name().clone()),
            alias: self.alias.clone(),
            arguments: self.arguments.clone(),
            directives: self.directives.clone(),
        }
    }
}

impl Display for Field {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(alias) = &self.alias {
            write!(f, "{alias}: ")?;
        }
        f.write_str(self.name())?;
        if !self.arguments.is_empty() {
            f.write_str("(")?;
            for (i, argument) in self.arguments.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(
                    f,
                    "{}: {}",
                    argument.name,
                    argument.value.serialize().no_indent()
                )?;
            }
            f.write_str(")")?;
        }
        self.directives.fmt(f)
    }
}

/// An inline fragment element of an operation. Equality and hashing ignore the schema.
#[derive(Debug, Clone)]
pub(crate) struct InlineFragment {
    pub(crate) schema: ValidFederationSchema,
    pub(crate) parent_type_position: CompositeTypeDefinitionPosition,
    pub(crate) type_condition_position: Option<CompositeTypeDefinitionPosition>,
    pub(crate) directives: DirectiveList,
}

impl PartialEq for InlineFragment {
    fn eq(&self, other: &Self) -> bool {
        self.parent_type_position == other.parent_type_position
            && self.type_condition_position == other.type_condition_position
            && self.directives == other.directives
    }
}

impl Eq for InlineFragment {}

impl Hash for InlineFragment {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.parent_type_position.hash(state);
        self.type_condition_position.hash(state);
        self.directives.hash(state);
    }
}

impl InlineFragment {
    /// A fragment casting `parent_type_position` to `type_condition_position`, without
    /// directives.
    pub(crate) fn new_cast(
        schema: &ValidFederationSchema,
        parent_type_position: CompositeTypeDefinitionPosition,
        type_condition_position: CompositeTypeDefinitionPosition,
    ) -> Self {
        Self {
            schema: schema.clone(),
            parent_type_position,
            type_condition_position: Some(type_condition_position),
            directives: Default::default(),
        }
    }

    pub(crate) fn key(&self) -> SelectionKey {
        SelectionKey::InlineFragment {
            type_condition: self
                .type_condition_position
                .as_ref()
                .map(|position| position.type_name().clone()),
            directives: self.directives.clone(),
        }
    }
}

impl Display for InlineFragment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(type_condition) = &self.type_condition_position {
            write!(f, "... on {}", type_condition.type_name())?;
        } else {
            f.write_str("...")?;
        }
        self.directives.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const SDL: &str = r#"
        type Query { t: T i: I }
        interface I { id: ID! }
        type T implements I { id: ID! name: String other: T }
        type U implements I { id: ID! }
    "#;

    fn schema() -> ValidFederationSchema {
        ValidFederationSchema::parse(SDL, "schema.graphql").unwrap()
    }

    #[test]
    fn normalizes_fragments_and_merges_fields() {
        let operation = Operation::parse(
            schema(),
            r#"
            query Q {
              t { id ...F }
              t { other { id } }
              i { ... on T { name } ... on I { id } }
            }
            fragment F on T { name other { name } }
            "#,
            "op.graphql",
            None,
        )
        .unwrap();
        assert_eq!(operation.name(), Some("Q"));
        assert_eq!(
            operation.selection_set.to_string(),
            "{ t { id name other { name id } } i { ... on T { name } id } }"
        );
    }

    #[test]
    fn keeps_fragments_with_directives() {
        let operation = Operation::parse(
            schema(),
            r#"query($b: Boolean!) { t { ... @include(if: $b) { id } } }"#,
            "op.graphql",
            None,
        )
        .unwrap();
        assert_eq!(
            operation.selection_set.to_string(),
            "{ t { ... @include(if: $b) { id } } }"
        );
    }

    #[test]
    fn contains_top_level_field_compares_whole_field() {
        let schema = schema();
        let operation =
            Operation::parse(schema.clone(), "{ t { id name } }", "op.graphql", None).unwrap();
        let Some(Selection::Field(t)) = operation.selection_set.iter().next() else {
            panic!("expected a field");
        };
        let t_selections = t.selection_set.as_ref().unwrap();
        let t_type = t_selections.type_position.clone();
        let id = Field::from_position(&schema, t_type.field(name!("id")));
        assert!(t_selections.contains_top_level_field(&id).unwrap());
        let other = Field::from_position(&schema, t_type.field(name!("other")));
        assert!(!t_selections.contains_top_level_field(&other).unwrap());
    }

    #[test]
    fn merging_selection_sets_on_different_types_fails() {
        let schema = schema();
        let t = SelectionSet::empty(
            schema.clone(),
            schema.get_type(name!("T")).unwrap().try_into().unwrap(),
        );
        let u = SelectionSet::empty(
            schema.clone(),
            schema.get_type(name!("U")).unwrap().try_into().unwrap(),
        );
        assert!(t.merge(&u).is_err());
        assert_eq!(t.merge(&t).unwrap(), t);
    }
}
