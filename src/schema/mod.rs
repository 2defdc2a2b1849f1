//! Schema registry: type definitions, payload validation, compatibility
//! checking and fingerprinting.

pub mod compat;
pub mod registry;
pub mod types;
pub mod validate;

pub use compat::{check_compatibility, ChangeKind, SchemaChange};
pub use registry::{RegistryError, SchemaDoc, SchemaRegistry};
pub use types::{EdgeTypeDef, FieldDef, FieldKind, NodeTypeDef, TypeDefError};
pub use validate::{expand_defaults, validate_patch, validate_payload, validate_props, FieldError};
