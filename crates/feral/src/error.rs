use thiserror::Error;

/// Process exit code for a successful run.
pub const E_OK: i32 = 0;
/// Generic failure.
pub const E_FAIL: i32 = 1;
/// The external parser or code generator rejected the source.
pub const E_PARSE_FAIL: i32 = 2;
/// A runtime failure reached the driver uncaught.
pub const E_EXEC_FAIL: i32 = 3;

#[derive(Debug, Error)]
pub enum Error {
    #[error("module '{0}' not found in locations: {1:?}")]
    ModuleNotFound(String, Vec<String>),

    #[error("unable to load module file: {0}")]
    LoadFail(String),

    #[error("module file '{file}' does not contain init function ({symbol})")]
    InitMissing { file: String, symbol: String },

    #[error("init function in module file '{0}' didn't return okay")]
    InitFailed(String),

    #[error("native module '{file}' was built against ABI version {got}, expected {expected}")]
    AbiMismatch { file: String, got: u32, expected: u32 },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("{0}")]
    Domain(String),

    #[error("uncaught raised value: {0}")]
    Raised(String),

    #[error("exceeded call stack bound of {0}")]
    StackExceeded(usize),

    #[error("assertion failed: {0}")]
    AssertionFailed(String),

    #[error("{0}")]
    Exec(String),
}

pub type Result<T> = std::result::Result<T, Error>;
