// Core modules: schema mapping, query compilation, serialization, and storage.
pub mod engine;
pub mod error;
pub mod options;
pub mod query;
pub mod record;
pub mod schema;
pub mod serializer;
pub mod storage;
pub mod value;
