//! Purpose: Configuration for opening a store: where it lives and how writes are committed.
//! Exports: `Location`, `StorageOptions`, `Autocommit`, `MEMORY_PATH`.
//! Role: Parsed and validated before any connection I/O; failures are `ErrorKind::Config`.
//! Invariants: Locations render back to the `sqlite://<path>:<table>` form they parse from.
//! Invariants: Autocommit thresholds are never zero.
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::core::error::{Error, ErrorKind};
use crate::core::schema::is_identifier;

const SCHEME: &str = "sqlite://";
pub const MEMORY_PATH: &str = ":memory:";
const DEFAULT_FETCH_SIZE: usize = 256;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Location {
    path: PathBuf,
    table: String,
}

impl Location {
    pub fn new(path: impl Into<PathBuf>, table: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            table: table.into(),
        }
    }

    pub fn in_memory(table: impl Into<String>) -> Self {
        Self::new(MEMORY_PATH, table)
    }

    /// Parses `sqlite://<path>:<table>`; the table follows the last `:`.
    pub fn parse(uri: &str) -> Result<Self, Error> {
        let Some(rest) = uri.strip_prefix(SCHEME) else {
            return Err(Error::new(ErrorKind::Config)
                .with_message(format!("unsupported location `{uri}`"))
                .with_hint("Locations look like sqlite://path/to/db.sqlite:table"));
        };
        let Some((path, table)) = rest.rsplit_once(':') else {
            return Err(Error::new(ErrorKind::Config)
                .with_message(format!("location `{uri}` has no table name"))
                .with_hint("Append the table after a colon: sqlite://db.sqlite:product"));
        };
        Ok(Self::new(path, table))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn is_memory(&self) -> bool {
        self.path.as_os_str() == MEMORY_PATH
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::new(ErrorKind::Config).with_message("location path is empty"));
        }
        if self.table.is_empty() {
            return Err(Error::new(ErrorKind::Config)
                .with_message("table name is empty")
                .with_path(&self.path));
        }
        if !is_identifier(&self.table) || self.table.to_ascii_lowercase().starts_with("sqlite_") {
            return Err(Error::new(ErrorKind::Config)
                .with_message(format!("unusable table name `{}`", self.table))
                .with_hint("Table names must match [A-Za-z_][A-Za-z0-9_]*"));
        }
        if self.is_memory() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(Error::new(ErrorKind::Config)
                    .with_message("parent directory does not exist")
                    .with_path(parent));
            }
        }
        if self.path.is_dir() {
            return Err(Error::new(ErrorKind::Config)
                .with_message("location path is a directory")
                .with_path(&self.path));
        }
        Ok(())
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}:{}", self.path.display(), self.table)
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(from = "AutocommitRepr")]
pub enum Autocommit {
    /// Caller commits explicitly.
    #[default]
    Off,
    /// Commit after every write.
    EveryWrite,
    /// Commit once this many writes are pending.
    Every(usize),
}

impl Autocommit {
    /// Pending-write count that triggers a commit.
    pub fn threshold(self) -> Option<usize> {
        match self {
            Self::Off => None,
            Self::EveryWrite => Some(1),
            Self::Every(n) => Some(n),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AutocommitRepr {
    Flag(bool),
    Every(usize),
}

impl From<AutocommitRepr> for Autocommit {
    fn from(repr: AutocommitRepr) -> Self {
        match repr {
            AutocommitRepr::Flag(false) => Self::Off,
            AutocommitRepr::Flag(true) => Self::EveryWrite,
            AutocommitRepr::Every(n) => Self::Every(n),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StorageOptions {
    pub autocommit: Autocommit,
    /// Rows fetched per page while iterating `get` results.
    pub fetch_size: usize,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            autocommit: Autocommit::Off,
            fetch_size: DEFAULT_FETCH_SIZE,
        }
    }
}

impl StorageOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn autocommit(mut self, autocommit: Autocommit) -> Self {
        self.autocommit = autocommit;
        self
    }

    pub fn fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = fetch_size;
        self
    }

    /// Parses `{"autocommit": false | true | N, "fetch_size": N}`.
    pub fn from_json(value: &JsonValue) -> Result<Self, Error> {
        let options: Self = serde_json::from_value(value.clone()).map_err(|err| {
            Error::new(ErrorKind::Config)
                .with_message("invalid storage options")
                .with_hint(r#"Example: {"autocommit": 50}"#)
                .with_source(err)
        })?;
        options.validate()?;
        Ok(options)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.autocommit == Autocommit::Every(0) {
            return Err(Error::new(ErrorKind::Config)
                .with_message("autocommit threshold must be positive")
                .with_hint("Use false to disable autocommit"));
        }
        if self.fetch_size == 0 {
            return Err(Error::new(ErrorKind::Config).with_message("fetch_size must be positive"));
        }
        Ok(())
    }
}
