use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The ledger could not be persisted, the next run may re-process images
    #[error("couldn't save ledger {path}: {source}")]
    LedgerSave {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("couldn't write run summary {path}: {source}")]
    SummaryWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("couldn't build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}
