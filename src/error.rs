use std::path::PathBuf;

/// Operations the session exposes but does not implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Test,
    SaveModel,
    ResumeFrom,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let verb = match self {
            Operation::Test => "test model",
            Operation::SaveModel => "save model",
            Operation::ResumeFrom => "resume training",
        };
        f.write_str(verb)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StampNetError {
    /// Geometry or configuration rejected before any computation.
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("cannot {0} yet")]
    UnimplementedOperation(Operation),

    /// Feature/label rows disagree with each other or with the geometry.
    #[error("data shape mismatch: {0}")]
    DataShapeMismatch(String),

    #[error("parse error in {path}:{line}: {msg}")]
    Parse {
        path: PathBuf,
        line: usize,
        msg: String,
    },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StampNetError>;
