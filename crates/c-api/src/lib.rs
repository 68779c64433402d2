use std::{
    ffi::{CStr, c_char, c_int, c_void},
    num::NonZeroUsize,
    path::Path,
    ptr::NonNull,
    sync::Arc,
};

use exifbox::{
    CallError, CallOptions, Config, HostAllocator, HostBuf, Malloc, NamedBuffer, Output, Sandbox,
    SharedAllocator,
};
use tracing::warn;

use crate::error::{Error, Result};

mod error;

pub use error::exifbox_last_error;

macro_rules! c_try {
    ($alloc:expr, $expr:expr) => {
        match $expr {
            Ok(val) => val,
            Err(e) => return ExifboxResult::failure($alloc, &e.to_string(), -1),
        }
    };
}

/// Caller-supplied allocator. Every string in an [`ExifboxResult`], the
/// module image copy and transform replacements go through it. The context
/// handle itself and engine-internal state use the Rust global allocator.
#[repr(C)]
pub struct ExifboxAllocator {
    /// Returns NULL on failure. `size` is never 0.
    pub alloc: Option<unsafe extern "C" fn(size: usize, ctx: *mut c_void) -> *mut c_void>,
    /// `size` is 0 when unknown.
    pub free: Option<unsafe extern "C" fn(ptr: *mut c_void, size: usize, ctx: *mut c_void)>,
    /// Forwarded as the last argument of `alloc` and `free`.
    pub ctx: *mut c_void,
}

struct CAllocator {
    alloc: unsafe extern "C" fn(usize, *mut c_void) -> *mut c_void,
    free: unsafe extern "C" fn(*mut c_void, usize, *mut c_void),
    ctx: *mut c_void,
}

// SAFETY: the embedder promises its allocator may be called from any thread.
unsafe impl Send for CAllocator {}
// SAFETY: as above.
unsafe impl Sync for CAllocator {}

impl CAllocator {
    fn new(raw: &ExifboxAllocator) -> Result<Self> {
        match (raw.alloc, raw.free) {
            (Some(alloc), Some(free)) => Ok(Self {
                alloc,
                free,
                ctx: raw.ctx,
            }),
            _ => Err(Error::InvalidArgument("allocator needs both alloc and free")),
        }
    }
}

// SAFETY: forwards to the embedder's functions, which carry the same contract.
unsafe impl HostAllocator for CAllocator {
    fn allocate(&self, size: NonZeroUsize) -> Option<NonNull<u8>> {
        // SAFETY: `size` is non-zero as documented on `ExifboxAllocator::alloc`.
        NonNull::new(unsafe { (self.alloc)(size.get(), self.ctx) }.cast::<u8>())
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: `ptr` came from `self.alloc`.
        unsafe { (self.free)(ptr.as_ptr().cast(), size, self.ctx) };
    }
}

/// Runtime configuration. Zero-initialize for defaults.
#[repr(C)]
pub struct ExifboxConfig {
    /// NULL uses malloc/free. Covers result strings and the image copy, not
    /// the context handle.
    pub allocator: *const ExifboxAllocator,
    /// Default 8 MiB.
    pub wasm_stack_size: u32,
    /// Default 32 MiB.
    pub wasm_heap_size: u32,
    /// Default 8 MiB.
    pub exec_stack_size: u32,
    /// Module image. NULL together with `program_path` reads both from the
    /// `EXIFBOX_MODULE` / `EXIFBOX_PROGRAM` environment variables.
    pub module_path: *const c_char,
    pub program_path: *const c_char,
    /// Directory for compiled-module artifacts. NULL disables caching.
    pub cache_dir: *const c_char,
}

/// Post-process successful tool output. Returns a NUL-terminated string
/// allocated with the context's allocator, or NULL for empty output. The
/// library frees the original data.
pub type ExifboxTransformFn =
    unsafe extern "C" fn(data: *const c_char, len: usize, ctx: *mut c_void) -> *mut c_char;

/// Per-call options. Zero-initialize for defaults.
#[repr(C)]
pub struct ExifboxOptions {
    /// Extra tool arguments.
    pub args: *const *const c_char,
    pub argc: c_int,
    /// Passed as `-config <path>`.
    pub config_path: *const c_char,
    /// Tag assignments such as `-Artist=John`.
    pub tags: *const *const c_char,
    pub ntags: c_int,
    pub transform: Option<ExifboxTransformFn>,
    pub transform_ctx: *mut c_void,
}

/// In-memory input. The filename extension selects the format handling.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct ExifboxBuf {
    pub data: *const c_void,
    pub len: usize,
    pub filename: *const c_char,
}

/// Outcome of a call, owned by the context's allocator. Release it with
/// [`exifbox_result_free`].
///
/// On success `data`/`data_len` hold the output and `error` is NULL. On
/// failure `error` holds a message and `data` is NULL.
#[repr(C)]
pub struct ExifboxResult {
    pub success: bool,
    pub data: *mut c_char,
    pub data_len: usize,
    pub error: *mut c_char,
    pub exit_code: i32,
}

impl ExifboxResult {
    fn from_output(output: Output) -> Self {
        let exit_code = output.exit_code();
        let (data, data_len) = output.into_data().into_raw();
        Self {
            success: true,
            data: data.cast(),
            data_len,
            error: std::ptr::null_mut(),
            exit_code,
        }
    }

    fn failure(alloc: &SharedAllocator, message: &str, exit_code: i32) -> Self {
        let error = HostBuf::copy_from(alloc, message.as_bytes())
            .map_or(std::ptr::null_mut(), |buf| buf.into_raw().0);
        Self {
            success: false,
            data: std::ptr::null_mut(),
            data_len: 0,
            error: error.cast(),
            exit_code,
        }
    }

    fn from_call(alloc: &SharedAllocator, result: std::result::Result<Output, CallError>) -> Self {
        match result {
            Ok(output) => Self::from_output(output),
            Err(e) => Self::failure(alloc, e.message(), e.exit_code()),
        }
    }

    /// # Safety
    ///
    /// The strings must have been produced by `alloc`.
    unsafe fn release(&mut self, alloc: &SharedAllocator) {
        for ptr in [&mut self.data, &mut self.error] {
            if let Some(ptr) = NonNull::new(std::mem::replace(ptr, std::ptr::null_mut())) {
                // SAFETY: adopted from `alloc` with unknown size, freed once.
                drop(unsafe { HostBuf::from_raw_parts(alloc, ptr.cast(), 0, 0) });
            }
        }
        self.data_len = 0;
    }
}

pub struct ExifboxHandle {
    sandbox: Sandbox,
}

impl ExifboxHandle {
    fn open(cfg: Option<&ExifboxConfig>) -> Result<Box<Self>> {
        let mut config = match cfg {
            Some(cfg) if !cfg.module_path.is_null() || !cfg.program_path.is_null() => {
                // SAFETY: non-null strings are NUL-terminated per the header.
                let module = unsafe { c_str(cfg.module_path, "module_path") }?;
                // SAFETY: as above.
                let program = unsafe { c_str(cfg.program_path, "program_path") }?;
                Config::from_files(module, program)?
            }
            _ => Config::from_env()?,
        };

        if let Some(cfg) = cfg {
            // SAFETY: a non-null allocator points at a live struct per the header.
            if let Some(raw) = unsafe { cfg.allocator.as_ref() } {
                config = config.allocator(Arc::new(CAllocator::new(raw)?));
            }
            // SAFETY: as above.
            if let Some(cache) = unsafe { opt_str(cfg.cache_dir, "cache_dir") }? {
                config = config.cache(Some(cache.into()));
            }
            config = config
                .guest_stack_size(cfg.wasm_stack_size)
                .guest_heap_size(cfg.wasm_heap_size)
                .exec_stack_size(cfg.exec_stack_size);
        }

        Ok(Box::new(Self {
            sandbox: Sandbox::open(config)?,
        }))
    }

    fn allocator(&self) -> SharedAllocator {
        Arc::clone(self.sandbox.allocator())
    }
}

/// Load the module and initialize the tool.
///
/// Returns NULL on failure; [`exifbox_last_error`] describes why.
///
/// # Safety
///
/// `cfg` must be NULL or point at a valid [`ExifboxConfig`] whose non-null
/// strings are NUL-terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn exifbox_create(
    cfg: Option<&ExifboxConfig>,
) -> Option<Box<ExifboxHandle>> {
    match ExifboxHandle::open(cfg) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "exifbox_create failed");
            error::set_last_error(e);
            None
        }
    }
}

/// Destroy a context. NULL is a no-op.
#[unsafe(no_mangle)]
pub extern "C" fn exifbox_destroy(_ctx: Option<Box<ExifboxHandle>>) {}

/// Read metadata of the file at `path` as JSON.
///
/// # Safety
///
/// `ctx` must be a live context, `path` a NUL-terminated string and `opts`
/// NULL or valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn exifbox_read(
    ctx: &mut ExifboxHandle,
    path: *const c_char,
    opts: Option<&ExifboxOptions>,
) -> ExifboxResult {
    let alloc = ctx.allocator();
    // SAFETY: caller contract.
    let path = c_try!(&alloc, unsafe { c_str(path, "path") });
    // SAFETY: caller contract.
    let result = c_try!(&alloc, unsafe {
        with_options(opts, |options| ctx.sandbox.read(path, options))
    });
    ExifboxResult::from_call(&alloc, result)
}

/// Read metadata of an in-memory file as JSON.
///
/// # Safety
///
/// `input` must describe readable memory and `opts` must be NULL or valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn exifbox_read_buf(
    ctx: &mut ExifboxHandle,
    input: ExifboxBuf,
    opts: Option<&ExifboxOptions>,
) -> ExifboxResult {
    let alloc = ctx.allocator();
    // SAFETY: caller contract.
    let input = c_try!(&alloc, unsafe { named_buffer(&input) });
    // SAFETY: caller contract.
    let result = c_try!(&alloc, unsafe {
        with_options(opts, |options| ctx.sandbox.read_from_buffer(input, options))
    });
    ExifboxResult::from_call(&alloc, result)
}

/// Write the tags in `opts` to `in_path`, or to `out_path` when it is
/// non-null.
///
/// # Safety
///
/// `in_path` must be a NUL-terminated string, `out_path` NULL or one, and
/// `opts` NULL or valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn exifbox_write(
    ctx: &mut ExifboxHandle,
    in_path: *const c_char,
    out_path: *const c_char,
    opts: Option<&ExifboxOptions>,
) -> ExifboxResult {
    let alloc = ctx.allocator();
    // SAFETY: caller contract.
    let in_path = c_try!(&alloc, unsafe { c_str(in_path, "in_path") });
    // SAFETY: caller contract.
    let out_path = c_try!(&alloc, unsafe { opt_str(out_path, "out_path") });
    // SAFETY: caller contract.
    let result = c_try!(&alloc, unsafe {
        with_options(opts, |options| {
            ctx.sandbox.write(in_path, out_path.map(Path::new), options)
        })
    });
    ExifboxResult::from_call(&alloc, result)
}

/// Write the tags in `opts` to an in-memory file. The result holds the
/// modified file bytes.
///
/// # Safety
///
/// `input` must describe readable memory and `opts` must be NULL or valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn exifbox_write_buf(
    ctx: &mut ExifboxHandle,
    input: ExifboxBuf,
    opts: Option<&ExifboxOptions>,
) -> ExifboxResult {
    let alloc = ctx.allocator();
    // SAFETY: caller contract.
    let input = c_try!(&alloc, unsafe { named_buffer(&input) });
    // SAFETY: caller contract.
    let result = c_try!(&alloc, unsafe {
        with_options(opts, |options| ctx.sandbox.write_to_buffer(input, options))
    });
    ExifboxResult::from_call(&alloc, result)
}

/// Free the strings in `result` and reset them to NULL.
///
/// `ctx` is the context whose allocator produced them; NULL falls back to
/// `free`. A NULL `result` is a no-op.
///
/// # Safety
///
/// `result` must be NULL or a result returned by this library that has not
/// been freed yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn exifbox_result_free(
    ctx: Option<&ExifboxHandle>,
    result: Option<&mut ExifboxResult>,
) {
    let Some(result) = result else {
        return;
    };
    let alloc: SharedAllocator = match ctx {
        Some(ctx) => ctx.allocator(),
        None => Arc::new(Malloc),
    };
    // SAFETY: caller contract.
    unsafe { result.release(&alloc) };
}

unsafe fn c_str<'a>(ptr: *const c_char, what: &'static str) -> Result<&'a str> {
    // SAFETY: forwarded.
    unsafe { opt_str(ptr, what) }?.ok_or(Error::InvalidArgument(what))
}

unsafe fn opt_str<'a>(ptr: *const c_char, what: &'static str) -> Result<Option<&'a str>> {
    if ptr.is_null() {
        return Ok(None);
    }
    // SAFETY: non-null strings are NUL-terminated per the caller contract.
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map(Some)
        .map_err(|_| Error::InvalidArgument(what))
}

unsafe fn str_array<'a>(
    ptr: *const *const c_char,
    len: c_int,
    what: &'static str,
) -> Result<Vec<&'a str>> {
    let len = usize::try_from(len).unwrap_or(0);
    if len == 0 {
        return Ok(Vec::new());
    }
    if ptr.is_null() {
        return Err(Error::InvalidArgument(what));
    }
    // SAFETY: `ptr` holds `len` entries per the caller contract.
    let entries = unsafe { std::slice::from_raw_parts(ptr, len) };
    entries
        .iter()
        // SAFETY: as above.
        .map(|&entry| unsafe { c_str(entry, what) })
        .collect()
}

unsafe fn named_buffer<'a>(input: &ExifboxBuf) -> Result<NamedBuffer<'a>> {
    let data = if input.len == 0 {
        &[][..]
    } else if input.data.is_null() {
        return Err(Error::InvalidArgument("input data"));
    } else {
        // SAFETY: `data` is readable for `len` bytes per the caller contract.
        unsafe { std::slice::from_raw_parts(input.data.cast::<u8>(), input.len) }
    };
    // SAFETY: as above.
    let filename = unsafe { opt_str(input.filename, "input filename") }?.unwrap_or_default();
    Ok(NamedBuffer::new(data, filename))
}

/// Hand successful output to a C transform and adopt what it returns.
unsafe fn adopt_transformed(
    transform: ExifboxTransformFn,
    ctx: *mut c_void,
    data: &[u8],
    alloc: &SharedAllocator,
) -> Option<HostBuf> {
    // Output buffers are NUL-terminated unless empty.
    let input = if data.is_empty() {
        c"".as_ptr()
    } else {
        data.as_ptr().cast()
    };
    // SAFETY: `input` is a NUL-terminated string of `data.len()` bytes.
    let replaced = NonNull::new(unsafe { transform(input, data.len(), ctx) })?;
    // SAFETY: the transform returns a NUL-terminated string.
    let len = unsafe { CStr::from_ptr(replaced.as_ptr()) }.to_bytes().len();
    // SAFETY: the transform allocates with the context's allocator.
    Some(unsafe { HostBuf::from_raw_parts(alloc, replaced.cast(), len, 0) })
}

unsafe fn with_options<R>(
    opts: Option<&ExifboxOptions>,
    f: impl FnOnce(&CallOptions<'_>) -> R,
) -> Result<R> {
    let Some(opts) = opts else {
        return Ok(f(&CallOptions::default()));
    };
    // SAFETY: caller contract.
    let args = unsafe { str_array(opts.args, opts.argc, "args") }?;
    // SAFETY: caller contract.
    let tags = unsafe { str_array(opts.tags, opts.ntags, "tags") }?;
    // SAFETY: caller contract.
    let config_path = unsafe { opt_str(opts.config_path, "config_path") }?;

    let hook = |data: &[u8], alloc: &SharedAllocator| -> Option<HostBuf> {
        let transform = opts.transform?;
        // SAFETY: the embedder supplied the function and its context together.
        unsafe { adopt_transformed(transform, opts.transform_ctx, data, alloc) }
    };

    let mut options = CallOptions::new().args(&args).tags(&tags);
    if let Some(path) = config_path {
        options = options.config_path(path);
    }
    if opts.transform.is_some() {
        options = options.transform(&hook);
    }
    Ok(f(&options))
}
