use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Failure to open a [`Sandbox`](crate::Sandbox).
///
/// Everything acquired before the failing step has already been released when
/// one of these is returned.
#[derive(Error, Debug)]
pub enum Error {
    /// Wasmtime engine error (compile, deserialize, link, instantiate, trap
    /// during initialization).
    #[error("wasm error: {0}")]
    Wasm(#[source] anyhow::Error),

    /// A required entry point is not exported by the guest module.
    #[error("guest module does not export `{0}`")]
    MissingExport(&'static str),

    /// One-time interpreter setup returned a non-zero status.
    #[error("guest initialization failed with status {0}")]
    Init(i32),

    /// The host allocator refused a request.
    #[error("host allocation of {0} bytes failed")]
    OutOfMemory(usize),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Filesystem I/O error (scratch files, cache, preopens).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallErrorKind {
    /// Guest memory exhausted while marshaling arguments.
    OutOfMemory,
    /// The guest reset entry point failed.
    Reset,
    /// The guest trapped.
    Trap,
    /// Non-zero exit status with no more specific message.
    Exit,
    /// Non-zero exit status with a guest-reported message.
    Guest,
    /// Host-side temp file or read-back failure.
    Io,
}

/// Failure of a single call. The sandbox stays usable afterwards.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct CallError {
    kind: CallErrorKind,
    message: String,
    exit_code: i32,
}

impl CallError {
    pub(crate) fn new(kind: CallErrorKind, message: impl Into<String>, exit_code: i32) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code,
        }
    }

    pub(crate) fn io(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::Io, message, -1)
    }

    pub(crate) fn out_of_memory() -> Self {
        Self::new(
            CallErrorKind::OutOfMemory,
            "guest memory allocation failed",
            -1,
        )
    }

    #[must_use]
    pub const fn kind(&self) -> CallErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Exit status of the guest, `-1` when indeterminate.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.exit_code
    }
}
