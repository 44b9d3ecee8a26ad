use apollo_compiler::Name;
use apollo_compiler::name;
use apollo_compiler::schema::Directive;

use crate::error::FederationError;
use crate::link::argument::directive_optional_boolean_argument;
use crate::link::argument::directive_optional_string_argument;
use crate::link::argument::directive_required_string_argument;

pub(crate) const KEY_DIRECTIVE_NAME: Name = name!("key");
pub(crate) const REQUIRES_DIRECTIVE_NAME: Name = name!("requires");
pub(crate) const PROVIDES_DIRECTIVE_NAME: Name = name!("provides");
pub(crate) const EXTERNAL_DIRECTIVE_NAME: Name = name!("external");
pub(crate) const OVERRIDE_DIRECTIVE_NAME: Name = name!("override");
pub(crate) const INTERFACE_OBJECT_DIRECTIVE_NAME: Name = name!("interfaceObject");

pub(crate) const FIELDS_ARGUMENT_NAME: Name = name!("fields");
pub(crate) const RESOLVABLE_ARGUMENT_NAME: Name = name!("resolvable");
pub(crate) const FROM_ARGUMENT_NAME: Name = name!("from");
pub(crate) const LABEL_ARGUMENT_NAME: Name = name!("label");

/// Root fields that subgraphs expose for the router's own use.
pub(crate) const ENTITIES_QUERY_FIELD_NAME: Name = name!("_entities");
pub(crate) const SERVICE_QUERY_FIELD_NAME: Name = name!("_service");

/// Definitions of the federation directives (and the types they need), inserted in subgraph
/// schemas which use a directive without defining it.
pub(crate) const FEDERATION_DEFINITIONS: &[(&str, &str)] = &[
    ("FieldSet", "scalar FieldSet"),
    ("link__Import", "scalar link__Import"),
    ("link__Purpose", "enum link__Purpose { SECURITY EXECUTION }"),
    (
        "@key",
        "directive @key(fields: FieldSet!, resolvable: Boolean = true) repeatable on OBJECT | INTERFACE",
    ),
    (
        "@requires",
        "directive @requires(fields: FieldSet!) on FIELD_DEFINITION",
    ),
    (
        "@provides",
        "directive @provides(fields: FieldSet!) on FIELD_DEFINITION",
    ),
    (
        "@external",
        "directive @external(reason: String) on OBJECT | FIELD_DEFINITION",
    ),
    (
        "@shareable",
        "directive @shareable repeatable on OBJECT | FIELD_DEFINITION",
    ),
    (
        "@override",
        "directive @override(from: String!, label: String) on FIELD_DEFINITION",
    ),
    ("@interfaceObject", "directive @interfaceObject on OBJECT"),
    (
        "@link",
        "directive @link(url: String, as: String, for: link__Purpose, import: [link__Import]) repeatable on SCHEMA",
    ),
];

pub(crate) struct KeyDirectiveArguments<'doc> {
    pub(crate) fields: &'doc str,
    pub(crate) resolvable: bool,
}

pub(crate) struct RequiresDirectiveArguments<'doc> {
    pub(crate) fields: &'doc str,
}

pub(crate) struct ProvidesDirectiveArguments<'doc> {
    pub(crate) fields: &'doc str,
}

pub(crate) struct OverrideDirectiveArguments<'doc> {
    pub(crate) from: &'doc str,
    pub(crate) label: Option<&'doc str>,
}

pub(crate) fn key_directive_arguments(
    application: &Directive,
) -> Result<KeyDirectiveArguments<'_>, FederationError> {
    Ok(KeyDirectiveArguments {
        fields: directive_required_string_argument(application, &FIELDS_ARGUMENT_NAME)?,
        resolvable: directive_optional_boolean_argument(application, &RESOLVABLE_ARGUMENT_NAME)?
            .unwrap_or(true),
    })
}

pub(crate) fn requires_directive_arguments(
    application: &Directive,
) -> Result<RequiresDirectiveArguments<'_>, FederationError> {
    Ok(RequiresDirectiveArguments {
        fields: directive_required_string_argument(application, &FIELDS_ARGUMENT_NAME)?,
    })
}

pub(crate) fn provides_directive_arguments(
    application: &Directive,
) -> Result<ProvidesDirectiveArguments<'_>, FederationError> {
    Ok(ProvidesDirectiveArguments {
        fields: directive_required_string_argument(application, &FIELDS_ARGUMENT_NAME)?,
    })
}

pub(crate) fn override_directive_arguments(
    application: &Directive,
) -> Result<OverrideDirectiveArguments<'_>, FederationError> {
    Ok(OverrideDirectiveArguments {
        from: directive_required_string_argument(application, &FROM_ARGUMENT_NAME)?,
        label: directive_optional_string_argument(application, &LABEL_ARGUMENT_NAME)?,
    })
}
