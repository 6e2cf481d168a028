use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid tempo map: {0}")]
    InvalidTempoMap(String),

    #[error("Track '{track}': {unmatched} of {total} note events unpaired (threshold 5%)")]
    UnpairedEventsExceedThreshold {
        track: String,
        unmatched: usize,
        total: usize,
    },

    #[error("Track '{0}' is required but no NES channel accepts it")]
    UnassignableTrack(String),

    #[error("Encoded song ({got} bytes) exceeds {mapper} PRG capacity ({capacity} bytes)")]
    RomSizeExceeded {
        mapper: &'static str,
        got: usize,
        capacity: usize,
    },

    #[error("Internal invariant violated in {stage}: {message}")]
    InternalInvariant {
        stage: &'static str,
        message: String,
    },

    #[error("Compilation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
