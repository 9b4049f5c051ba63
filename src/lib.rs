//! Purpose: Schema-mapped record storage over SQLite with a dictionary query language.
//! Exports: `api` (stable surface) and `core` (schema, query, serializer, storage internals).
//! Role: Library backing the `dblite` CLI and embedding applications.
//! Invariants: Callers should depend on `api`; `core` paths may move between releases.
//! Invariants: Every public operation reports failures through `api::Error`.
pub mod api;
pub mod core;
