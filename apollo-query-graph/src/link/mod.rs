//! The federation directives understood when building query graphs out of subgraph schemas.

pub(crate) mod argument;
pub(crate) mod federation_spec_definition;
