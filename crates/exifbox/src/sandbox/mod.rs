//! Sandbox lifecycle and the tool-level call surface.
//!
//! Typical flow:
//! 1. Build a [`Config`](crate::Config) from the module image and program.
//! 2. [`Sandbox::open`] it once; this compiles, instantiates and initializes
//!    the guest.
//! 3. Issue any number of [`Sandbox::read`] / [`Sandbox::write`] calls (or
//!    their buffer variants). Every call resets the guest first, so calls are
//!    independent of each other, including after failures.
//!
//! A `Sandbox` runs one call at a time. Use [`SharedSandbox`] to share one
//! between threads.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tempfile::TempPath;
use tracing::{debug, info_span, warn};
use wasmtime::Module;

use crate::{
    TRACE_TARGET,
    alloc::{HostBuf, SharedAllocator},
    config::Config,
    error::{CallError, Error, Result},
    internal::{
        capture::Capture,
        compile::load_module,
        engine::{EngineKey, EngineLease, global_registry},
        guest::Guest,
        io::{read_back, reserve_output, spill, suffix_of},
        marshal::argument_list,
        state::StoreParams,
    },
    options::{CallOptions, NamedBuffer},
    output::{Output, apply_transform},
};

/// Baseline flags for reads: JSON, duplicates kept, short names, numeric
/// values, family-1 groups, binary payloads included.
pub const READ_DEFAULTS: [&str; 6] = ["-json", "-a", "-s", "-n", "-G1", "-b"];

/// One instantiated guest and everything it owns.
pub struct Sandbox {
    // Field order is teardown order.
    guest: Guest,
    _module: Module,
    _image: HostBuf,
    _engine: EngineLease,
    capture: Capture,
    program: TempPath,
    program_path: String,
    scratch_dir: PathBuf,
    alloc: SharedAllocator,
}

impl Sandbox {
    /// Compile, instantiate and initialize the guest described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails; everything acquired up to that
    /// point has been released by then.
    pub fn open(config: Config) -> Result<Self> {
        let span = info_span!(target: TRACE_TARGET, "sandbox.open");
        let _enter = span.enter();

        let alloc = config.resolved_allocator();
        let scratch_dir = std::path::absolute(
            config
                .scratch_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
        )?;

        let engine = global_registry()
            .acquire(EngineKey {
                max_wasm_stack: config.max_wasm_stack(),
            })
            .map_err(Error::Wasm)?;

        // Private copy; the engine never sees the caller's buffer.
        let image = HostBuf::copy_from(&alloc, &config.module)
            .ok_or(Error::OutOfMemory(config.module.len()))?;
        let module = load_module(engine.engine(), &image, config.cache.as_deref())?;
        debug!(bytes = image.len(), "module loaded");

        let program = spill(&scratch_dir, &config.program, None)?;
        let program_path = program
            .to_str()
            .ok_or_else(|| Error::Config("scratch directory path is not valid UTF-8".into()))?
            .to_owned();
        let capture = Capture::new(&scratch_dir)?;

        let params = StoreParams {
            argv0: &config.guest_argv0,
            scratch_dir: &scratch_dir,
            mounts: &config.mounts,
            memory_budget: config.memory_budget(),
        };
        let mut guest = Guest::instantiate(engine.engine(), &module, &params, &capture)?;
        if let Err(e) = guest.init() {
            guest.free_interpreter();
            return Err(e);
        }
        debug!(program = %program_path, "sandbox ready");

        Ok(Self {
            guest,
            _module: module,
            _image: image,
            _engine: engine,
            capture,
            program,
            program_path,
            scratch_dir,
            alloc,
        })
    }

    /// Tear down the guest and remove the sandbox's files.
    pub fn close(self) {
        drop(self);
    }

    #[must_use]
    pub const fn allocator(&self) -> &SharedAllocator {
        &self.alloc
    }

    /// Directory holding this sandbox's temporary files.
    #[must_use]
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Run the tool with `options` followed by `tail` as its arguments.
    ///
    /// # Errors
    ///
    /// Returns a [`CallError`] if the call fails; the sandbox remains usable.
    pub fn execute(
        &mut self,
        tail: &[&str],
        options: &CallOptions<'_>,
    ) -> Result<Output, CallError> {
        let args = argument_list(options, tail);
        let span = info_span!(target: TRACE_TARGET, "sandbox.call", argc = args.len());
        let _enter = span.enter();

        let result = self
            .guest
            .call(&args, &self.program_path, &self.capture, &self.alloc);
        match &result {
            Ok(output) => debug!(bytes = output.data().len(), "call succeeded"),
            Err(e) => debug!(
                kind = ?e.kind(),
                exit_code = e.exit_code(),
                message = e.message(),
                "call failed"
            ),
        }
        result
    }

    /// Read all metadata of the file at `path` as JSON.
    ///
    /// # Errors
    ///
    /// Returns a [`CallError`] if the tool fails.
    pub fn read(
        &mut self,
        path: impl AsRef<Path>,
        options: &CallOptions<'_>,
    ) -> Result<Output, CallError> {
        let path = guest_path(path.as_ref())?;
        let mut tail = SmallVec::<[&str; 8]>::from_slice(&READ_DEFAULTS);
        tail.push(path.as_str());
        let result = self.execute(&tail, options);
        apply_transform(result, options.transform, &self.alloc)
    }

    /// [`Sandbox::read`] on in-memory data.
    ///
    /// # Errors
    ///
    /// Returns a [`CallError`] if the temporary input cannot be written or
    /// the tool fails.
    pub fn read_from_buffer(
        &mut self,
        input: NamedBuffer<'_>,
        options: &CallOptions<'_>,
    ) -> Result<Output, CallError> {
        let tmp = spill(&self.scratch_dir, input.data, suffix_of(input.filename))
            .map_err(|e| CallError::io(format!("failed to write temp file: {e}")))?;
        let result = self.read(&tmp, options);
        remove_temp(tmp);
        result
    }

    /// Apply the tag assignments in `options` to `in_path`.
    ///
    /// With `out_path` the result goes to a new file, which must not exist
    /// yet. Without it the input is modified in place.
    ///
    /// # Errors
    ///
    /// Returns a [`CallError`] if the tool fails.
    pub fn write(
        &mut self,
        in_path: impl AsRef<Path>,
        out_path: Option<&Path>,
        options: &CallOptions<'_>,
    ) -> Result<Output, CallError> {
        let input = guest_path(in_path.as_ref())?;
        match out_path {
            Some(out_path) => {
                let output = guest_path(out_path)?;
                self.execute(&["-o", output.as_str(), input.as_str()], options)
            }
            None => self.execute(&["-overwrite_original", input.as_str()], options),
        }
    }

    /// [`Sandbox::write`] on in-memory data. The output holds the bytes of
    /// the produced file.
    ///
    /// # Errors
    ///
    /// Returns a [`CallError`] if a temporary file cannot be created, the
    /// tool fails, or the tool reports success without producing a file.
    pub fn write_to_buffer(
        &mut self,
        input: NamedBuffer<'_>,
        options: &CallOptions<'_>,
    ) -> Result<Output, CallError> {
        let suffix = suffix_of(input.filename);
        let in_tmp = spill(&self.scratch_dir, input.data, suffix)
            .map_err(|e| CallError::io(format!("failed to write input temp file: {e}")))?;
        let out_tmp = match reserve_output(&self.scratch_dir, suffix) {
            Ok(path) => path,
            Err(e) => {
                remove_temp(in_tmp);
                return Err(CallError::io(format!(
                    "failed to create output temp file: {e}"
                )));
            }
        };

        let result = self
            .write(&in_tmp, Some(&*out_tmp), options)
            .and_then(|output| {
                let data = read_back(&out_tmp, &self.alloc).map_err(|e| {
                    debug!(error = %e, "output read-back failed");
                    CallError::io("output file not produced")
                })?;
                Ok(Output::new(data, output.exit_code()))
            });

        remove_temp(out_tmp);
        remove_temp(in_tmp);
        result
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _span = info_span!(target: TRACE_TARGET, "sandbox.close").entered();
        self.guest.free_interpreter();
        debug!(program = %self.program.display(), "sandbox closed");
    }
}

impl core::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Sandbox")
            .field("program", &self.program_path)
            .field("scratch_dir", &self.scratch_dir)
            .finish_non_exhaustive()
    }
}

/// A [`Sandbox`] serialized behind a mutex, for use from several threads.
///
/// Calls block while another thread's call is in flight.
#[derive(Debug)]
pub struct SharedSandbox {
    inner: Mutex<Sandbox>,
}

impl SharedSandbox {
    #[must_use]
    pub const fn new(sandbox: Sandbox) -> Self {
        Self {
            inner: Mutex::new(sandbox),
        }
    }

    /// # Errors
    /// See [`Sandbox::open`].
    pub fn open(config: Config) -> Result<Self> {
        Sandbox::open(config).map(Self::new)
    }

    /// Run `f` with exclusive access to the sandbox.
    pub fn with<R>(&self, f: impl FnOnce(&mut Sandbox) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// # Errors
    /// See [`Sandbox::read`].
    pub fn read(
        &self,
        path: impl AsRef<Path>,
        options: &CallOptions<'_>,
    ) -> Result<Output, CallError> {
        self.inner.lock().read(path, options)
    }

    /// # Errors
    /// See [`Sandbox::read_from_buffer`].
    pub fn read_from_buffer(
        &self,
        input: NamedBuffer<'_>,
        options: &CallOptions<'_>,
    ) -> Result<Output, CallError> {
        self.inner.lock().read_from_buffer(input, options)
    }

    /// # Errors
    /// See [`Sandbox::write`].
    pub fn write(
        &self,
        in_path: impl AsRef<Path>,
        out_path: Option<&Path>,
        options: &CallOptions<'_>,
    ) -> Result<Output, CallError> {
        self.inner.lock().write(in_path, out_path, options)
    }

    /// # Errors
    /// See [`Sandbox::write_to_buffer`].
    pub fn write_to_buffer(
        &self,
        input: NamedBuffer<'_>,
        options: &CallOptions<'_>,
    ) -> Result<Output, CallError> {
        self.inner.lock().write_to_buffer(input, options)
    }

    #[must_use]
    pub fn into_inner(self) -> Sandbox {
        self.inner.into_inner()
    }
}

/// Absolute, UTF-8 form of `path` as the guest will see it.
fn guest_path(path: &Path) -> Result<String, CallError> {
    let absolute = std::path::absolute(path)
        .map_err(|e| CallError::io(format!("invalid path `{}`: {e}", path.display())))?;
    absolute
        .into_os_string()
        .into_string()
        .map_err(|_| CallError::io(format!("path `{}` is not valid UTF-8", path.display())))
}

fn remove_temp(path: TempPath) {
    let shown = path.display().to_string();
    if let Err(e) = path.close()
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %shown, error = %e, "failed to remove temp file");
    }
}
