use std::{error::Error, fmt, io};

use backtrace::Backtrace;

/// The error codes surfaced by the engine.
///
/// Callers are expected to branch on the "logical" codes (`KeyNotFound`,
/// `DuplicateKey`, `CursorIsNil`) as part of normal control flow, and to
/// treat the rest as failures of the current call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvParameter,
    InvFileHeader,
    InvKeySize,
    InvRecordSize,
    KeyNotFound,
    DuplicateKey,
    TxnConflict,
    CursorIsNil,
    CursorStillOpen,
    NeedRecovery,
    LogInvFileHeader,
    IoError,
    FileNotFound,
    OutOfMemory,
    WouldBlock,
    LimitsReached,
    WriteProtected,
    InternalError,
}

pub struct GroveError {
    kind: ErrorKind,
    details: String,
    backtrace: Backtrace,
}

impl GroveError {
    pub fn new(kind: ErrorKind, msg: &str) -> GroveError {
        GroveError {
            kind,
            details: msg.to_string(),
            backtrace: Backtrace::new_unresolved(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn key_not_found() -> GroveError {
        GroveError::new(ErrorKind::KeyNotFound, "key not found")
    }

    pub fn inv_parameter(msg: &str) -> GroveError {
        GroveError::new(ErrorKind::InvParameter, msg)
    }

    pub fn internal(msg: &str) -> GroveError {
        GroveError::new(ErrorKind::InternalError, msg)
    }

    pub fn io(e: &io::Error) -> GroveError {
        match e.kind() {
            io::ErrorKind::NotFound => {
                GroveError::new(ErrorKind::FileNotFound, &e.to_string())
            }
            io::ErrorKind::WouldBlock => {
                GroveError::new(ErrorKind::WouldBlock, &e.to_string())
            }
            _ => GroveError::new(ErrorKind::IoError, &e.to_string()),
        }
    }
}

impl fmt::Display for GroveError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.details)
    }
}

impl fmt::Debug for GroveError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.details)
    }
}

impl Error for GroveError {
    fn description(&self) -> &str {
        &self.details
    }
}

impl From<io::Error> for GroveError {
    fn from(e: io::Error) -> Self {
        GroveError::io(&e)
    }
}

impl GroveError {
    /// The backtrace captured when the error was constructed. Resolution is
    /// deferred until somebody actually asks for it.
    pub fn backtrace(&self) -> Backtrace {
        let mut bt = self.backtrace.clone();
        bt.resolve();
        bt
    }
}
