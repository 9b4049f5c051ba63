//! Purpose: Define the stable public Rust API boundary for dblite.
//! Exports: Schema, record, query, and storage types plus the error taxonomy.
//! Role: Public, additive-only surface; hides the engine glue module.
//! Invariants: Engine-specific types (rusqlite) never appear in these signatures,
//! except for raw SQL text passed through `Storage::sql`.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::options::{Autocommit, Location, StorageOptions};
pub use crate::core::query::{CompiledWhere, Condition, Query, compile};
pub use crate::core::record::Record;
pub use crate::core::schema::{Field, ID_FIELD, Schema, SchemaBuilder, StorageType};
pub use crate::core::serializer::{self, CompressedStr, Identity, Serializer};
pub use crate::core::storage::{Delete, Records, SqlQuery, SqlRows, Storage};
pub use crate::core::value::Value;
