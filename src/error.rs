use thiserror::Error;

/// Subsystem that originated an error, per the error-propagation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Transport,
    Decomposer,
    Recoverer,
    Correlator,
    Assembler,
    TableBuilder,
    Ingest,
    Config,
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Subsystem::Transport => "transport",
            Subsystem::Decomposer => "decomposer",
            Subsystem::Recoverer => "recoverer",
            Subsystem::Correlator => "correlator",
            Subsystem::Assembler => "assembler",
            Subsystem::TableBuilder => "table_builder",
            Subsystem::Ingest => "ingest",
            Subsystem::Config => "config",
        };
        write!(f, "{s}")
    }
}

/// Machine-readable kind code, stable across error variants for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TransportError,
    RequestRejected,
    CorruptMessage,
    TypeConflict,
    OverlappingDomain,
    EmptyAggregate,
    StaticSizeExceeded,
    UnknownColumn,
    RowOutOfRange,
    Cancelled,
    DeadlineExceeded,
    ConfigInvalid,
    SupplierEmptyPoll,
}

/// The single error type surfaced by every public operation in this crate.
#[derive(Debug, Clone, Error)]
pub enum DpError {
    #[error("[{subsystem}] transport error: {message}")]
    TransportError { subsystem: Subsystem, message: String },

    #[error("[{subsystem}] request rejected: {message}")]
    RequestRejected { subsystem: Subsystem, message: String },

    #[error("[{subsystem}] corrupt message: {message}")]
    CorruptMessage { subsystem: Subsystem, message: String },

    #[error("[{subsystem}] type conflict on column '{column}': {expected} vs {found}")]
    TypeConflict {
        subsystem: Subsystem,
        column: String,
        expected: String,
        found: String,
    },

    #[error("[{subsystem}] overlapping time domains between blocks starting at {a_start} and {b_start}")]
    OverlappingDomain {
        subsystem: Subsystem,
        a_start: String,
        b_start: String,
    },

    #[error("[{subsystem}] aggregate has no blocks")]
    EmptyAggregate { subsystem: Subsystem },

    #[error("[{subsystem}] static table would require {actual} bytes, exceeding cap of {cap}")]
    StaticSizeExceeded {
        subsystem: Subsystem,
        actual: u64,
        cap: u64,
    },

    #[error("[{subsystem}] unknown column '{column}'")]
    UnknownColumn { subsystem: Subsystem, column: String },

    #[error("[{subsystem}] row {row} out of range (len {len})")]
    RowOutOfRange {
        subsystem: Subsystem,
        row: usize,
        len: usize,
    },

    #[error("[{subsystem}] cancelled")]
    Cancelled { subsystem: Subsystem },

    #[error("[{subsystem}] deadline exceeded")]
    DeadlineExceeded { subsystem: Subsystem },

    #[error("[{subsystem}] invalid configuration: {message}")]
    ConfigInvalid { subsystem: Subsystem, message: String },

    #[error("[{subsystem}] ingest supplier produced nothing within the poll timeout")]
    SupplierEmptyPoll { subsystem: Subsystem },
}

impl DpError {
    pub fn subsystem(&self) -> Subsystem {
        match self {
            DpError::TransportError { subsystem, .. }
            | DpError::RequestRejected { subsystem, .. }
            | DpError::CorruptMessage { subsystem, .. }
            | DpError::TypeConflict { subsystem, .. }
            | DpError::OverlappingDomain { subsystem, .. }
            | DpError::EmptyAggregate { subsystem }
            | DpError::StaticSizeExceeded { subsystem, .. }
            | DpError::UnknownColumn { subsystem, .. }
            | DpError::RowOutOfRange { subsystem, .. }
            | DpError::Cancelled { subsystem }
            | DpError::DeadlineExceeded { subsystem }
            | DpError::ConfigInvalid { subsystem, .. }
            | DpError::SupplierEmptyPoll { subsystem } => *subsystem,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DpError::TransportError { .. } => ErrorKind::TransportError,
            DpError::RequestRejected { .. } => ErrorKind::RequestRejected,
            DpError::CorruptMessage { .. } => ErrorKind::CorruptMessage,
            DpError::TypeConflict { .. } => ErrorKind::TypeConflict,
            DpError::OverlappingDomain { .. } => ErrorKind::OverlappingDomain,
            DpError::EmptyAggregate { .. } => ErrorKind::EmptyAggregate,
            DpError::StaticSizeExceeded { .. } => ErrorKind::StaticSizeExceeded,
            DpError::UnknownColumn { .. } => ErrorKind::UnknownColumn,
            DpError::RowOutOfRange { .. } => ErrorKind::RowOutOfRange,
            DpError::Cancelled { .. } => ErrorKind::Cancelled,
            DpError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            DpError::ConfigInvalid { .. } => ErrorKind::ConfigInvalid,
            DpError::SupplierEmptyPoll { .. } => ErrorKind::SupplierEmptyPoll,
        }
    }
}

pub type Result<T> = std::result::Result<T, DpError>;
