//! Error taxonomy for the sync engine.
//!
//! Every failure surfaced by the engine is one of five kinds. Actions abort
//! on the first error and clean up their staging resources; the manager
//! decides per call site whether to aggregate, swallow, or propagate.

use std::path::PathBuf;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The extract phase failed; a source-side problem.
    #[error("extract for table '{table}' failed")]
    Extract {
        table: String,
        #[source]
        source: anyhow::Error,
    },

    /// The load phase failed; source schema drift or a target issue.
    #[error("load into table '{table}' failed")]
    Load {
        table: String,
        #[source]
        source: anyhow::Error,
    },

    /// On-disk chunking of an extract file failed.
    #[error("failed to split extract file {}", path.display())]
    Split {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// Schema introspection found a missing relation.
    #[error("no such table: {0}")]
    NoSuchTable(String),

    /// Invalid plan or connection options, surfaced at startup.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn extract(table: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        SyncError::Extract {
            table: table.into(),
            source: source.into(),
        }
    }

    pub fn load(table: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        SyncError::Load {
            table: table.into(),
            source: source.into(),
        }
    }

    pub fn split(path: impl Into<PathBuf>, source: impl Into<anyhow::Error>) -> Self {
        SyncError::Split {
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        SyncError::Config(message.into())
    }

    /// Whether the error is scoped to a single table. Table-scoped errors
    /// are swallowed per iteration by the incremental loop; anything else
    /// escapes immediately.
    pub fn is_table_scoped(&self) -> bool {
        matches!(
            self,
            SyncError::Extract { .. }
                | SyncError::Load { .. }
                | SyncError::Split { .. }
                | SyncError::NoSuchTable(_)
        )
    }

    /// Process exit code for CLI wrappers.
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::Config(_) => 2,
            _ => 1,
        }
    }
}
