pub mod error;
pub mod key;
pub mod model;
pub mod value;

pub use error::{DbError, Result};
pub use key::Key;
pub use model::{
    EntityModel, EntityValidator, FieldInfo, SchemaValidator, TypeInfo, VersionInfo,
};
pub use value::{DataType, Tuple, Value};
