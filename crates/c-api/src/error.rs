use std::{
    borrow::Cow,
    cell::RefCell,
    ffi::{CStr, CString, c_char},
};

thread_local! {
    static LAST_ERROR: RefCell<Option<Error>> = const { RefCell::new(None) };
}

/// Message of the last failed `exifbox_create` on this thread, or NULL.
///
/// The pointer stays valid until the next failing call on the same thread.
#[unsafe(no_mangle)]
pub extern "C" fn exifbox_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| {
        slot.borrow_mut()
            .as_mut()
            .map_or(std::ptr::null(), Error::c_error)
    })
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error(transparent)]
    Open(#[from] exifbox::Error),

    #[error("C Error")]
    C(Cow<'static, CStr>),
}

pub type Result<T> = std::result::Result<T, Error>;

fn into_cstr(msg: String) -> Cow<'static, CStr> {
    CString::new(msg).map_or_else(|_| c"error message contains NUL".into(), Into::into)
}

impl Error {
    fn c_error(&mut self) -> *const c_char {
        match self {
            Self::C(msg) => msg.as_ptr(),
            other => {
                *other = Self::C(into_cstr(other.to_string()));
                other.c_error()
            }
        }
    }
}

pub fn set_last_error(err: Error) {
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = Some(err);
    });
}
