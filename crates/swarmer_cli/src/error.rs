use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Swarmer(#[from] swarmer::error::Error),

    #[error("Could not open the log file `{0}`: {1}")]
    LogFile(PathBuf, io::Error),

    #[error("Could not set the logger: {0}")]
    Logger(#[from] tracing::subscriber::SetGlobalDefaultError),
}
