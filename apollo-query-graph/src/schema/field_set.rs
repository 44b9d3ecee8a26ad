use apollo_compiler::executable::FieldSet;
use apollo_compiler::schema::NamedType;

use crate::error::FederationError;
use crate::error::MultipleFederationErrors;
use crate::error::SingleFederationError;
use crate::operation::FragmentMap;
use crate::operation::Selection;
use crate::operation::SelectionSet;
use crate::schema::ValidFederationSchema;

// Field sets do not allow aliases, but the GraphQL parser accepts them, so they are rejected
// after parsing.
fn check_absence_of_aliases(selection_set: &SelectionSet) -> Result<(), FederationError> {
    fn visit_selection_set(errors: &mut MultipleFederationErrors, selection_set: &SelectionSet) {
        for selection in selection_set.iter() {
            match selection {
                Selection::InlineFragment(fragment) => {
                    visit_selection_set(errors, &fragment.selection_set)
                }
                Selection::Field(field) => {
                    if let Some(alias) = &field.field.alias {
                        errors.push(
                            SingleFederationError::InvalidGraphQL {
                                message: format!(
                                    r#"Cannot use alias "{alias}" in "{}": aliases are not currently supported in field sets"#,
                                    field.field
                                ),
                            }
                            .into(),
                        );
                    }
                    if let Some(selection_set) = &field.selection_set {
                        visit_selection_set(errors, selection_set);
                    }
                }
            }
        }
    }

    let mut errors = MultipleFederationErrors::default();
    visit_selection_set(&mut errors, selection_set);
    errors.into_result()
}

/// Parses the `fields` argument of a `@key`, `@requires` or `@provides` application against the
/// given type.
pub(crate) fn parse_field_set(
    schema: &ValidFederationSchema,
    parent_type_name: NamedType,
    field_set: &str,
) -> Result<SelectionSet, FederationError> {
    // Braces are optional in field sets.
    let field_set = FieldSet::parse_and_validate(
        schema.schema(),
        parent_type_name,
        field_set,
        "field_set.graphql",
    )?;

    // A field set cannot contain named fragments.
    let fragments = FragmentMap::default();
    let selection_set =
        SelectionSet::from_selection_set(&field_set.selection_set, &fragments, schema)?;
    check_absence_of_aliases(&selection_set)?;
    Ok(selection_set)
}
