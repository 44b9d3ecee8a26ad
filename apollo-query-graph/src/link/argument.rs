use apollo_compiler::Name;
use apollo_compiler::ast::Value;
use apollo_compiler::schema::Directive;

use crate::error::FederationError;
use crate::error::SingleFederationError;

fn directive_argument<'doc>(
    application: &'doc Directive,
    name: &Name,
) -> Option<&'doc Value> {
    application
        .specified_argument_by_name(name)
        .map(|value| &**value)
        .filter(|value| !matches!(value, Value::Null))
}

pub(crate) fn directive_optional_string_argument<'doc>(
    application: &'doc Directive,
    name: &Name,
) -> Result<Option<&'doc str>, FederationError> {
    match directive_argument(application, name) {
        None => Ok(None),
        Some(value) => value.as_str().map(Some).ok_or_else(|| {
            SingleFederationError::Internal {
                message: format!(
                    "Argument \"{}\" of directive \"@{}\" must be a string.",
                    name, application.name
                ),
            }
            .into()
        }),
    }
}

pub(crate) fn directive_required_string_argument<'doc>(
    application: &'doc Directive,
    name: &Name,
) -> Result<&'doc str, FederationError> {
    directive_optional_string_argument(application, name)?.ok_or_else(|| {
        SingleFederationError::Internal {
            message: format!(
                "Required argument \"{}\" of directive \"@{}\" was not present.",
                name, application.name
            ),
        }
        .into()
    })
}

pub(crate) fn directive_optional_boolean_argument(
    application: &Directive,
    name: &Name,
) -> Result<Option<bool>, FederationError> {
    match directive_argument(application, name) {
        None => Ok(None),
        Some(value) => value.to_bool().map(Some).ok_or_else(|| {
            SingleFederationError::Internal {
                message: format!(
                    "Argument \"{}\" of directive \"@{}\" must be a boolean.",
                    name, application.name
                ),
            }
            .into()
        }),
    }
}
