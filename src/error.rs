use crate::types::Pe;

pub type Result<T> = std::result::Result<T, SymraError>;

#[derive(Debug, thiserror::Error)]
pub enum SymraError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid value for {what}: {value}")]
    InvalidValue { what: &'static str, value: i64 },

    #[error("address out of range: offset {offset:#x} beyond heap of {heap_size:#x} bytes")]
    OutOfRange { offset: usize, heap_size: usize },

    #[error("invalid PE {pe}: world size is {npes}")]
    InvalidPe { pe: Pe, npes: u32 },

    #[error("team range invalid: start={start} stride={stride} size={size} exceeds parent of {parent_size}")]
    InvalidTeamRange {
        start: u32,
        stride: u32,
        size: u32,
        parent_size: u32,
    },

    #[error("no free team index: all {max_teams} team slots in use")]
    TeamsExhausted { max_teams: usize },

    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("completion reported status {status:#x} for peer {pe} (wqe index {index})")]
    CompletionStatus { pe: Pe, status: u8, index: u64 },

    #[error("context not initialized")]
    NotInitialized,

    #[error("bootstrap error: {message}")]
    Bootstrap {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("bootstrap magic mismatch: expected session {expected:#018x}, peer sent {actual:#018x}")]
    MagicMismatch { expected: u64, actual: u64 },

    #[error("connection to {addr} not established after {attempts} attempts ({kind})")]
    RetriesExhausted {
        addr: String,
        attempts: u32,
        kind: &'static str,
    },

    #[error("deadline exceeded while {operation}")]
    Timeout { operation: &'static str },

    #[error("allocation of {requested} bytes failed: {reason}")]
    AllocationFailed { requested: usize, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SymraError {
    /// Create a `Transport` error with just a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Transport` error with a message and a source error.
    pub fn transport_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a `Bootstrap` error with just a message.
    pub fn bootstrap(msg: impl Into<String>) -> Self {
        Self::Bootstrap {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Bootstrap` error with a message and a source error.
    pub fn bootstrap_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Bootstrap {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_display() {
        let e = SymraError::OutOfRange {
            offset: 0x1000,
            heap_size: 0x800,
        };
        assert_eq!(
            e.to_string(),
            "address out of range: offset 0x1000 beyond heap of 0x800 bytes"
        );
    }

    #[test]
    fn test_magic_mismatch_display() {
        let e = SymraError::MagicMismatch {
            expected: 0xdead_beef_0102_0304,
            actual: 0x1,
        };
        assert!(e.to_string().contains("0xdeadbeef01020304"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let e: SymraError = io.into();
        assert!(e.to_string().contains("refused"));
    }

    #[test]
    fn test_all_variants_display() {
        let errors: Vec<SymraError> = vec![
            SymraError::InvalidParameter("npes=0".into()),
            SymraError::InvalidValue {
                what: "stride",
                value: -1,
            },
            SymraError::OutOfRange {
                offset: 1,
                heap_size: 0,
            },
            SymraError::InvalidPe { pe: 9, npes: 4 },
            SymraError::InvalidTeamRange {
                start: 2,
                stride: 3,
                size: 4,
                parent_size: 8,
            },
            SymraError::TeamsExhausted { max_teams: 64 },
            SymraError::transport("wq full"),
            SymraError::CompletionStatus {
                pe: 1,
                status: 0x12,
                index: 7,
            },
            SymraError::NotInitialized,
            SymraError::bootstrap("root unreachable"),
            SymraError::MagicMismatch {
                expected: 1,
                actual: 2,
            },
            SymraError::RetriesExhausted {
                addr: "127.0.0.1:9999".into(),
                attempts: 50,
                kind: "ETIMEDOUT",
            },
            SymraError::Timeout { operation: "quiet" },
            SymraError::AllocationFailed {
                requested: 1 << 30,
                reason: "layout".into(),
            },
        ];
        for e in &errors {
            assert!(!e.to_string().is_empty(), "empty display for {e:?}");
        }
    }
}
