use crate::{
    alloc::{HostBuf, SharedAllocator},
    error::CallError,
    options::Transform,
};

/// Successful call result.
#[derive(Debug)]
pub struct Output {
    data: HostBuf,
    exit_code: i32,
}

impl Output {
    pub(crate) const fn new(data: HostBuf, exit_code: i32) -> Self {
        Self { data, exit_code }
    }

    /// Captured standard output, or the produced file for buffer writes.
    /// May contain NUL bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// The data as UTF-8, if it is valid UTF-8.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(self.data()).ok()
    }

    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.exit_code
    }

    #[must_use]
    pub fn into_data(self) -> HostBuf {
        self.data
    }

    pub(crate) fn replace_data(&mut self, data: HostBuf) {
        self.data = data;
    }
}

/// Run `transform` over successful output; errors pass through untouched.
pub(crate) fn apply_transform(
    result: Result<Output, CallError>,
    transform: Option<&Transform<'_>>,
    alloc: &SharedAllocator,
) -> Result<Output, CallError> {
    match (result, transform) {
        (Ok(mut output), Some(transform)) => {
            let replaced =
                transform(output.data(), alloc).unwrap_or_else(|| HostBuf::empty(alloc));
            output.replace_data(replaced);
            Ok(output)
        }
        (result, _) => result,
    }
}
