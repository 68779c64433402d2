use std::cell::Cell;

use tracing::trace;
use wasmtime::Engine;
use wasmtime_wasi::I32Exit;

use crate::error::{CallError, CallErrorKind};

thread_local! {
    static THREAD_ENV: Cell<bool> = const { Cell::new(false) };
}

/// Per-thread execution context marker.
///
/// The outermost guard on a thread eagerly initializes the engine's
/// thread-local state and owns the marker; nested guards leave it alone.
pub struct ThreadEnv {
    owned: bool,
}

impl ThreadEnv {
    pub fn ensure() -> Self {
        let owned = !THREAD_ENV.with(|env| env.replace(true));
        if owned {
            Engine::tls_eager_initialize();
            trace!("thread execution context acquired");
        }
        Self { owned }
    }

    #[cfg(test)]
    pub const fn owned(&self) -> bool {
        self.owned
    }
}

impl Drop for ThreadEnv {
    fn drop(&mut self) {
        if self.owned {
            THREAD_ENV.with(|env| env.set(false));
            trace!("thread execution context released");
        }
    }
}

/// How the run entry point ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Returned(i32),
    /// The guest called `proc_exit`.
    Exited(i32),
    Trapped(String),
}

impl RunOutcome {
    pub fn from_call(result: wasmtime::Result<i32>) -> Self {
        match result {
            Ok(code) => Self::Returned(code),
            Err(e) => match e.downcast_ref::<I32Exit>() {
                Some(exit) => Self::Exited(exit.0),
                None => Self::Trapped(format!("{e:#}")),
            },
        }
    }
}

/// Decide the call result from the run outcome.
///
/// A trap always wins. Otherwise a zero status is success; a non-zero status
/// takes the guest's last-error text when it has one and a generic message
/// when it does not. `last_error` is only consulted for non-zero statuses.
pub fn settle(
    outcome: RunOutcome,
    last_error: impl FnOnce() -> Option<String>,
) -> Result<i32, CallError> {
    let code = match outcome {
        RunOutcome::Trapped(message) => {
            return Err(CallError::new(CallErrorKind::Trap, message, -1));
        }
        RunOutcome::Returned(code) | RunOutcome::Exited(code) => code,
    };
    if code == 0 {
        return Ok(0);
    }
    match last_error().filter(|message| !message.is_empty()) {
        Some(message) => Err(CallError::new(CallErrorKind::Guest, message, code)),
        None => Err(CallError::new(
            CallErrorKind::Exit,
            format!("tool exited with error (exit code {code})"),
            code,
        )),
    }
}

/// NUL-terminated string at `ptr` in guest memory. Null and out-of-range
/// pointers read as `None`; an unterminated string runs to the end of memory.
pub fn read_cstr(memory: &[u8], ptr: u32) -> Option<String> {
    if ptr == 0 {
        return None;
    }
    let tail = memory.get(usize::try_from(ptr).ok()?..)?;
    let len = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
    Some(String::from_utf8_lossy(&tail[..len]).into_owned())
}
