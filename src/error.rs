use std::io;

use thiserror::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the producer can hit. None of them are retried.
#[derive(Debug, Error)]
pub enum Error {
    /// Opening, sizing or mapping the control block failed
    #[error("shared memory {name}: {source}")]
    SharedMemory {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Buffer device open/allocate/map/release failed
    #[error("buffer device: {op}: {source}")]
    Device {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("output {output} has invalid geometry {width}x{height}")]
    InvalidGeometry { output: usize, width: i32, height: i32 },

    /// Requester raised `num_outputs` past the rings built at startup
    #[error("output {output} has no buffer ring (only {rings} allocated at startup)")]
    OutputWithoutRing { output: usize, rings: usize },

    #[error("output id {0} does not fit in one byte")]
    OutputIdOutOfRange(i32),

    /// Exporting a transferable handle failed
    #[error("exporting handle {handle}: {source}")]
    Export {
        handle: u32,
        #[source]
        source: io::Error,
    },

    #[error("short write on handle channel: sent {sent} of 1 bytes")]
    ShortWrite { sent: usize },

    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("config: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn device(op: &'static str) -> Self {
        Error::Device {
            op,
            source: io::Error::last_os_error(),
        }
    }
}
