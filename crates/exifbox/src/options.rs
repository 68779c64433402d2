use crate::alloc::{HostBuf, SharedAllocator};

/// Post-processing hook for successful output.
///
/// Receives the captured bytes and the sandbox allocator, and returns the
/// replacement buffer. Returning `None` leaves the output empty.
pub type Transform<'a> = dyn Fn(&[u8], &SharedAllocator) -> Option<HostBuf> + 'a;

/// Per-call options, borrowed for the duration of one call.
#[derive(Clone, Copy, Default)]
pub struct CallOptions<'a> {
    pub(crate) args: &'a [&'a str],
    pub(crate) config_path: Option<&'a str>,
    pub(crate) tags: &'a [&'a str],
    pub(crate) transform: Option<&'a Transform<'a>>,
}

impl<'a> CallOptions<'a> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra flags placed before everything else.
    #[must_use]
    pub const fn args(mut self, args: &'a [&'a str]) -> Self {
        self.args = args;
        self
    }

    /// Tool configuration file, passed as `-config <path>`.
    #[must_use]
    pub const fn config_path(mut self, path: &'a str) -> Self {
        self.config_path = Some(path);
        self
    }

    /// Tag assignments such as `-Artist=Jane`.
    #[must_use]
    pub const fn tags(mut self, tags: &'a [&'a str]) -> Self {
        self.tags = tags;
        self
    }

    /// Applied to successful output of `read` and `read_from_buffer`.
    #[must_use]
    pub const fn transform(mut self, transform: &'a Transform<'a>) -> Self {
        self.transform = Some(transform);
        self
    }
}

impl core::fmt::Debug for CallOptions<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CallOptions")
            .field("args", &self.args)
            .field("config_path", &self.config_path)
            .field("tags", &self.tags)
            .field("transform", &self.transform.map(|_| "<fn>"))
            .finish()
    }
}

/// In-memory input tagged with a file name. Only the extension of the name
/// matters; the tool uses it to pick a format.
#[derive(Clone, Copy, Debug)]
pub struct NamedBuffer<'a> {
    pub data: &'a [u8],
    pub filename: &'a str,
}

impl<'a> NamedBuffer<'a> {
    #[must_use]
    pub const fn new(data: &'a [u8], filename: &'a str) -> Self {
        Self { data, filename }
    }
}
