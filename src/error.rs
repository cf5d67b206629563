//! Process-level error taxonomy and exit categories.
//!
//! The copy engine reports problems as a [`Category`]; the first non-clean
//! category recorded wins and becomes the process exit status, following the
//! numbering convention of the SCSI status categories used by sg utilities.

use thiserror::Error;

/// Exit-status categories. The numeric values are the wire-compatible exit
/// codes scripts expect from sg-family dd tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Category {
    /// Full success.
    Clean = 0,
    /// Bad command-line operands or contradictory flags.
    SyntaxError = 1,
    /// Device reports NOT READY sense.
    NotReady = 2,
    /// Medium or hardware error sense.
    MediumHard = 3,
    /// ILLEGAL REQUEST sense.
    IllegalRequest = 5,
    /// UNIT ATTENTION sense (retryable).
    UnitAttention = 6,
    /// Device does not implement the command.
    InvalidOp = 9,
    /// ABORTED COMMAND sense (retryable).
    AbortedCommand = 11,
    /// Could not open or stat a file.
    FileError = 15,
    /// Recovered error sense (logged, treated as success).
    Recovered = 21,
    /// Anything else, including an interrupted copy with blocks remaining.
    Other = 99,
}

impl Category {
    /// Exit code for the process.
    #[inline]
    pub fn exit_code(self) -> i32 {
        self as i32
    }

    /// True for completions that should be retried on the same segment.
    #[inline]
    pub fn is_retryable(self) -> bool {
        matches!(self, Category::AbortedCommand | Category::UnitAttention)
    }

    /// True for completions the copy may treat as success.
    #[inline]
    pub fn is_clean(self) -> bool {
        matches!(self, Category::Clean | Category::Recovered)
    }
}

/// Errors raised while validating operands and opening files, before any
/// worker thread exists.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("{0}")]
    Syntax(String),

    #[error("could not open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("could not position {path} to block {blk}: {source}")]
    Seek {
        path: String,
        blk: i64,
        source: std::io::Error,
    },

    #[error("unable to access {0}")]
    Access(String),

    #[error("sg tape devices are not supported: {0}")]
    TapeDevice(String),

    #[error("sg device setup failed on {path}: {reason}")]
    SgPrepare { path: String, reason: String },

    #[error("couldn't calculate a block count, please give one")]
    CountUnknown,
}

impl SetupError {
    /// Map a setup failure onto its exit category.
    pub fn category(&self) -> Category {
        match self {
            SetupError::Syntax(_) => Category::SyntaxError,
            SetupError::CountUnknown => Category::Other,
            _ => Category::FileError,
        }
    }
}
