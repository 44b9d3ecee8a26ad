use std::hash::Hash;
use std::hash::Hasher;
use std::ops::Deref;
use std::sync::Arc;

use apollo_compiler::Name;
use apollo_compiler::Schema;
use apollo_compiler::collections::IndexMap;
use apollo_compiler::collections::IndexSet;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::validation::Valid;

use crate::error::FederationError;
use crate::error::SingleFederationError;
use crate::link::federation_spec_definition::INTERFACE_OBJECT_DIRECTIVE_NAME;
use crate::link::federation_spec_definition::KEY_DIRECTIVE_NAME;
use crate::schema::position::CompositeTypeDefinitionPosition;
use crate::schema::position::EnumTypeDefinitionPosition;
use crate::schema::position::InputObjectTypeDefinitionPosition;
use crate::schema::position::InterfaceTypeDefinitionPosition;
use crate::schema::position::ObjectTypeDefinitionPosition;
use crate::schema::position::ScalarTypeDefinitionPosition;
use crate::schema::position::SchemaRootDefinitionKind;
use crate::schema::position::TypeDefinitionPosition;
use crate::schema::position::UnionTypeDefinitionPosition;

pub(crate) mod field_set;
pub(crate) mod position;

#[derive(Debug)]
pub struct FederationSchema {
    schema: Valid<Schema>,
    /// Object types implementing each interface, in schema order.
    implementers: IndexMap<Name, IndexSet<ObjectTypeDefinitionPosition>>,
}

impl FederationSchema {
    fn new(schema: Valid<Schema>) -> Self {
        let mut implementers: IndexMap<Name, IndexSet<ObjectTypeDefinitionPosition>> =
            IndexMap::default();
        for (type_name, type_) in &schema.types {
            let ExtendedType::Object(object) = type_ else {
                continue;
            };
            for interface in &object.implements_interfaces {
                implementers
                    .entry(interface.name.clone())
                    .or_default()
                    .insert(ObjectTypeDefinitionPosition::new(type_name.clone()));
            }
        }
        Self {
            schema,
            implementers,
        }
    }

    pub fn schema(&self) -> &Valid<Schema> {
        &self.schema
    }

    pub(crate) fn get_types(&self) -> impl Iterator<Item = TypeDefinitionPosition> + '_ {
        self.schema
            .types
            .iter()
            .filter(|(_, type_)| !type_.is_built_in())
            .map(|(type_name, type_)| position_for(type_name.clone(), type_))
    }

    pub(crate) fn get_type(&self, type_name: Name) -> Result<TypeDefinitionPosition, FederationError> {
        let type_ = self
            .schema
            .types
            .get(&type_name)
            .ok_or_else(|| SingleFederationError::Internal {
                message: format!("Schema has no type \"{type_name}\""),
            })?;
        Ok(position_for(type_name, type_))
    }

    pub(crate) fn try_get_type(&self, type_name: Name) -> Option<TypeDefinitionPosition> {
        self.get_type(type_name).ok()
    }

    pub(crate) fn possible_runtime_types(
        &self,
        composite_type_definition_position: CompositeTypeDefinitionPosition,
    ) -> Result<IndexSet<ObjectTypeDefinitionPosition>, FederationError> {
        Ok(match composite_type_definition_position {
            CompositeTypeDefinitionPosition::Object(pos) => IndexSet::from_iter([pos]),
            CompositeTypeDefinitionPosition::Interface(pos) => self
                .implementers
                .get(&pos.type_name)
                .cloned()
                .unwrap_or_default(),
            CompositeTypeDefinitionPosition::Union(pos) => pos
                .get(self.schema())?
                .members
                .iter()
                .map(|member| ObjectTypeDefinitionPosition::new(member.name.clone()))
                .collect(),
        })
    }

    pub(crate) fn root_type(
        &self,
        root_kind: SchemaRootDefinitionKind,
    ) -> Option<ObjectTypeDefinitionPosition> {
        let definition = &self.schema.schema_definition;
        let root = match root_kind {
            SchemaRootDefinitionKind::Query => definition.query.as_ref(),
            SchemaRootDefinitionKind::Mutation => definition.mutation.as_ref(),
            SchemaRootDefinitionKind::Subscription => definition.subscription.as_ref(),
        }?;
        Some(ObjectTypeDefinitionPosition::new(root.name.clone()))
    }

    /// The kind of root this object type is, if any.
    pub(crate) fn root_kind_of(&self, type_name: &Name) -> Option<SchemaRootDefinitionKind> {
        [
            SchemaRootDefinitionKind::Query,
            SchemaRootDefinitionKind::Mutation,
            SchemaRootDefinitionKind::Subscription,
        ]
        .into_iter()
        .find(|kind| {
            self.root_type(*kind)
                .is_some_and(|root| &root.type_name == type_name)
        })
    }

    pub(crate) fn is_interface_object_type(&self, type_name: &Name) -> bool {
        matches!(
            self.schema.types.get(type_name),
            Some(ExtendedType::Object(object))
                if object.directives.has(&INTERFACE_OBJECT_DIRECTIVE_NAME)
        )
    }

    pub(crate) fn is_entity_type(&self, type_name: &Name) -> bool {
        self.schema
            .types
            .get(type_name)
            .is_some_and(|type_| type_.directives().has(&KEY_DIRECTIVE_NAME))
    }
}

fn position_for(type_name: Name, type_: &ExtendedType) -> TypeDefinitionPosition {
    match type_ {
        ExtendedType::Scalar(_) => ScalarTypeDefinitionPosition::new(type_name).into(),
        ExtendedType::Object(_) => ObjectTypeDefinitionPosition::new(type_name).into(),
        ExtendedType::Interface(_) => InterfaceTypeDefinitionPosition::new(type_name).into(),
        ExtendedType::Union(_) => UnionTypeDefinitionPosition::new(type_name).into(),
        ExtendedType::Enum(_) => EnumTypeDefinitionPosition::new(type_name).into(),
        ExtendedType::InputObject(_) => InputObjectTypeDefinitionPosition::new(type_name).into(),
    }
}

/// A validated schema, shared behind an `Arc`. Two handles are equal when they point to the same
/// underlying schema.
#[derive(Debug, Clone)]
pub struct ValidFederationSchema(Arc<FederationSchema>);

impl ValidFederationSchema {
    pub fn new(schema: Valid<Schema>) -> Result<ValidFederationSchema, FederationError> {
        Ok(ValidFederationSchema(Arc::new(FederationSchema::new(schema))))
    }

    pub fn parse(sdl: &str, path: &str) -> Result<ValidFederationSchema, FederationError> {
        Self::new(Schema::parse_and_validate(sdl, path)?)
    }
}

impl Deref for ValidFederationSchema {
    type Target = FederationSchema;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PartialEq for ValidFederationSchema {
    fn eq(&self, other: &ValidFederationSchema) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ValidFederationSchema {}

impl Hash for ValidFederationSchema {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state);
    }
}

#[cfg(test)]
mod tests {
    use apollo_compiler::name;

    use super::*;

    const SDL: &str = r#"
        type Query { i: I u: U }
        interface I { id: ID! }
        type A implements I { id: ID! }
        type B implements I { id: ID! }
        type C { c: Int }
        union U = C | A
    "#;

    #[test]
    fn possible_runtime_types_of_abstract_types() {
        let schema = ValidFederationSchema::parse(SDL, "schema.graphql").unwrap();
        let interface = InterfaceTypeDefinitionPosition::new(name!("I")).into();
        let names: Vec<_> = schema
            .possible_runtime_types(interface)
            .unwrap()
            .into_iter()
            .map(|t| t.type_name.to_string())
            .collect();
        assert_eq!(names, vec!["A", "B"]);

        let union_ = UnionTypeDefinitionPosition::new(name!("U")).into();
        let names: Vec<_> = schema
            .possible_runtime_types(union_)
            .unwrap()
            .into_iter()
            .map(|t| t.type_name.to_string())
            .collect();
        assert_eq!(names, vec!["C", "A"]);
    }

    #[test]
    fn root_types() {
        let schema = ValidFederationSchema::parse(SDL, "schema.graphql").unwrap();
        assert_eq!(
            schema
                .root_type(SchemaRootDefinitionKind::Query)
                .map(|t| t.type_name.to_string()),
            Some("Query".to_owned())
        );
        assert!(schema.root_type(SchemaRootDefinitionKind::Mutation).is_none());
        assert_eq!(
            schema.root_kind_of(&name!("Query")),
            Some(SchemaRootDefinitionKind::Query)
        );
        assert_eq!(schema.root_kind_of(&name!("A")), None);
    }

    #[test]
    fn handles_compare_by_identity() {
        let first = ValidFederationSchema::parse(SDL, "schema.graphql").unwrap();
        let second = ValidFederationSchema::parse(SDL, "schema.graphql").unwrap();
        assert_eq!(first, first.clone());
        assert_ne!(first, second);
    }
}
