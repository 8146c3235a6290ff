use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResidencyError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid residency configuration: {0}")]
    Config(#[from] toml::de::Error),

    /// The kernel driver rejected a call outright. Distinct from memory pressure:
    /// retrying a broken contract cannot succeed.
    #[error("Kernel driver error in {op}: {reason}")]
    Driver { op: &'static str, reason: String },

    #[error("Operation timed out")]
    WaitTimeout,

    #[error("Out of GPU Memory ({bytes_to_trim} bytes could not be trimmed)")]
    OutOfMemory { bytes_to_trim: u64 },

    #[error("Invalid engine context ID: {0}")]
    InvalidContextId(u32),

    #[error("A host range cannot be split into more than {max} fragments")]
    TooManyFragments { max: usize },

    #[error("Host range 0x{ptr:x}+0x{size:x} partially overlaps a registered fragment")]
    FragmentOverlap { ptr: usize, size: u64 },

    #[error("Unknown allocation: {0}")]
    UnknownAllocation(u64),
}

impl ResidencyError {
    pub(crate) fn driver(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Driver {
            op,
            reason: reason.into(),
        }
    }
}

// A convenient alias
pub type ResidencyResult<T> = Result<T, ResidencyError>;
