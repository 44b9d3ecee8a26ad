use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;

use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::Schema;
use apollo_compiler::ast;
use apollo_compiler::name;
use apollo_compiler::schema::Component;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::schema::FieldDefinition;
use apollo_compiler::schema::InterfaceType;
use apollo_compiler::schema::ObjectType;
use apollo_compiler::schema::UnionType;

use crate::error::FederationError;

pub(crate) static INTROSPECTION_TYPENAME_FIELD_NAME: Name = name!("__typename");

/// A zero-allocation error representation for position lookups, because many of these errors are
/// actually immediately discarded.
#[derive(Debug, thiserror::Error)]
pub(crate) enum PositionLookupError {
    #[error("Schema has no type `{0}`")]
    TypeMissing(Name),
    #[error("Schema type `{0}` is not {1}")]
    TypeWrongKind(Name, &'static str),
    #[error("Type `{0}` has no field `{1}`")]
    MissingField(Name, Name),
}

impl From<PositionLookupError> for FederationError {
    fn from(value: PositionLookupError) -> Self {
        FederationError::internal(value.to_string())
    }
}

/// A position wasn't of the variant a conversion needed.
#[derive(Debug, thiserror::Error)]
#[error("Type `{actual}` was unexpectedly not {expected}")]
pub(crate) struct PositionConvertError<T: Debug + Display> {
    actual: T,
    expected: &'static str,
}

impl<T: Debug + Display> From<PositionConvertError<T>> for FederationError {
    fn from(value: PositionConvertError<T>) -> Self {
        FederationError::internal(value.to_string())
    }
}

/// Declares the position of a named type. Positions of kinds the graph reads definitions of also
/// get a `get` returning that definition:
/// ```no_compile
/// named_type_position!(ObjectTypeDefinitionPosition: Object(ObjectType), "an object type");
/// ```
macro_rules! named_type_position {
    ( $name:ident ) => {
        #[derive(Clone, PartialEq, Eq, Hash)]
        pub(crate) struct $name {
            pub(crate) type_name: Name,
        }

        impl $name {
            pub(crate) fn new(type_name: Name) -> Self {
                Self { type_name }
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.type_name)
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                Display::fmt(self, f)
            }
        }
    };
    ( $name:ident: $kind:ident($definition:ty), $expected:literal ) => {
        named_type_position!($name);

        impl $name {
            const EXPECTED: &'static str = $expected;

            pub(crate) fn get<'schema>(
                &self,
                schema: &'schema Schema,
            ) -> Result<&'schema Node<$definition>, PositionLookupError> {
                let Some(definition) = schema.types.get(&self.type_name) else {
                    return Err(PositionLookupError::TypeMissing(self.type_name.clone()));
                };
                let ExtendedType::$kind(definition) = definition else {
                    return Err(PositionLookupError::TypeWrongKind(
                        self.type_name.clone(),
                        Self::EXPECTED,
                    ));
                };
                Ok(definition)
            }
        }
    };
}

named_type_position!(ScalarTypeDefinitionPosition);
named_type_position!(ObjectTypeDefinitionPosition: Object(ObjectType), "an object type");
named_type_position!(InterfaceTypeDefinitionPosition: Interface(InterfaceType), "an interface type");
named_type_position!(UnionTypeDefinitionPosition: Union(UnionType), "a union type");
named_type_position!(EnumTypeDefinitionPosition);
named_type_position!(InputObjectTypeDefinitionPosition);

/// Declares an enum over some kinds of named type positions, with a `type_name` accessor.
macro_rules! type_position_enum {
    ( $(#[$attr:meta])* $name:ident { $($kind:ident($position:ident)),+ $(,)? } ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::From, derive_more::Display)]
        pub(crate) enum $name {
            $($kind($position)),+
        }

        impl $name {
            pub(crate) fn type_name(&self) -> &Name {
                match self {
                    $($name::$kind(position) => &position.type_name),+
                }
            }
        }
    };
}

/// `TryFrom` narrowing a position enum to the listed variants, either unwrapped or re-wrapped
/// into another enum (through its `From` impls).
macro_rules! narrowing_conversion {
    ( $from:ident::{$($kind:ident),+} -> $to:ident ) => {
        impl TryFrom<$from> for $to {
            type Error = PositionConvertError<$from>;

            fn try_from(position: $from) -> Result<Self, Self::Error> {
                match position {
                    $($from::$kind(inner) => Ok(inner.into()),)+
                    actual => Err(PositionConvertError {
                        actual,
                        expected: $to::EXPECTED,
                    }),
                }
            }
        }
    };
}

/// `From` widening a position enum into one admitting more kinds.
macro_rules! widening_conversion {
    ( $from:ident::{$($kind:ident),+} -> $to:ident ) => {
        impl From<$from> for $to {
            fn from(position: $from) -> Self {
                match position {
                    $($from::$kind(inner) => inner.into()),+
                }
            }
        }
    };
}

type_position_enum!(TypeDefinitionPosition {
    Scalar(ScalarTypeDefinitionPosition),
    Object(ObjectTypeDefinitionPosition),
    Interface(InterfaceTypeDefinitionPosition),
    Union(UnionTypeDefinitionPosition),
    Enum(EnumTypeDefinitionPosition),
    InputObject(InputObjectTypeDefinitionPosition),
});

type_position_enum!(
    /// Positions of types a field can return.
    OutputTypeDefinitionPosition {
        Scalar(ScalarTypeDefinitionPosition),
        Object(ObjectTypeDefinitionPosition),
        Interface(InterfaceTypeDefinitionPosition),
        Union(UnionTypeDefinitionPosition),
        Enum(EnumTypeDefinitionPosition),
    }
);

impl OutputTypeDefinitionPosition {
    const EXPECTED: &'static str = "an output type";
}

type_position_enum!(
    /// Positions of types with a selection set: the possible graph nodes besides leaves.
    CompositeTypeDefinitionPosition {
        Object(ObjectTypeDefinitionPosition),
        Interface(InterfaceTypeDefinitionPosition),
        Union(UnionTypeDefinitionPosition),
    }
);

impl CompositeTypeDefinitionPosition {
    const EXPECTED: &'static str = "a composite type";

    pub(crate) fn is_object_type(&self) -> bool {
        matches!(self, CompositeTypeDefinitionPosition::Object(_))
    }

    pub(crate) fn is_abstract_type(&self) -> bool {
        !self.is_object_type()
    }

    pub(crate) fn field(&self, field_name: Name) -> FieldDefinitionPosition {
        FieldDefinitionPosition {
            parent: self.clone(),
            field_name,
        }
    }

    pub(crate) fn introspection_typename_field(&self) -> FieldDefinitionPosition {
        self.field(INTROSPECTION_TYPENAME_FIELD_NAME.clone())
    }
}

narrowing_conversion!(OutputTypeDefinitionPosition::{Object} -> ObjectTypeDefinitionPosition);
narrowing_conversion!(TypeDefinitionPosition::{Object} -> ObjectTypeDefinitionPosition);
narrowing_conversion!(TypeDefinitionPosition::{Interface} -> InterfaceTypeDefinitionPosition);
narrowing_conversion!(TypeDefinitionPosition::{Scalar, Object, Interface, Union, Enum} -> OutputTypeDefinitionPosition);
narrowing_conversion!(OutputTypeDefinitionPosition::{Object, Interface, Union} -> CompositeTypeDefinitionPosition);
narrowing_conversion!(TypeDefinitionPosition::{Object, Interface, Union} -> CompositeTypeDefinitionPosition);
widening_conversion!(CompositeTypeDefinitionPosition::{Object, Interface, Union} -> OutputTypeDefinitionPosition);
widening_conversion!(CompositeTypeDefinitionPosition::{Object, Interface, Union} -> TypeDefinitionPosition);

/// The position of a field (or of the `__typename` meta-field) on a composite type.
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) struct FieldDefinitionPosition {
    pub(crate) parent: CompositeTypeDefinitionPosition,
    pub(crate) field_name: Name,
}

impl FieldDefinitionPosition {
    pub(crate) fn type_name(&self) -> &Name {
        self.parent.type_name()
    }

    pub(crate) fn field_name(&self) -> &Name {
        &self.field_name
    }

    pub(crate) fn parent(&self) -> &CompositeTypeDefinitionPosition {
        &self.parent
    }

    pub(crate) fn is_introspection_typename_field(&self) -> bool {
        self.field_name == INTROSPECTION_TYPENAME_FIELD_NAME
    }

    /// Looks up the field definition, including meta-fields like `__typename`.
    pub(crate) fn get<'schema>(
        &self,
        schema: &'schema Schema,
    ) -> Result<&'schema Component<FieldDefinition>, PositionLookupError> {
        schema
            .type_field(self.type_name(), &self.field_name)
            .map_err(|_| {
                PositionLookupError::MissingField(self.type_name().clone(), self.field_name.clone())
            })
    }

    pub(crate) fn try_get<'schema>(
        &self,
        schema: &'schema Schema,
    ) -> Option<&'schema Component<FieldDefinition>> {
        self.get(schema).ok()
    }
}

impl Display for FieldDefinitionPosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.type_name(), self.field_name)
    }
}

impl Debug for FieldDefinitionPosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum_macros::Display,
    strum_macros::EnumIter,
    serde::Serialize,
)]
pub(crate) enum SchemaRootDefinitionKind {
    #[strum(to_string = "query")]
    Query,
    #[strum(to_string = "mutation")]
    Mutation,
    #[strum(to_string = "subscription")]
    Subscription,
}

impl From<SchemaRootDefinitionKind> for ast::OperationType {
    fn from(value: SchemaRootDefinitionKind) -> Self {
        match value {
            SchemaRootDefinitionKind::Query => ast::OperationType::Query,
            SchemaRootDefinitionKind::Mutation => ast::OperationType::Mutation,
            SchemaRootDefinitionKind::Subscription => ast::OperationType::Subscription,
        }
    }
}

impl From<ast::OperationType> for SchemaRootDefinitionKind {
    fn from(value: ast::OperationType) -> Self {
        match value {
            ast::OperationType::Query => SchemaRootDefinitionKind::Query,
            ast::OperationType::Mutation => SchemaRootDefinitionKind::Mutation,
            ast::OperationType::Subscription => SchemaRootDefinitionKind::Subscription,
        }
    }
}
