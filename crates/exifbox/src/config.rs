use std::{
    borrow::Cow,
    path::{Path, PathBuf},
};

pub use wasmtime_wasi::{DirPerms, FilePerms};

use crate::{
    alloc::{SharedAllocator, default_allocator},
    error::{Error, Result},
};

/// Environment variable naming the guest module image.
pub const MODULE_ENV: &str = "EXIFBOX_MODULE";
/// Environment variable naming the guest program text.
pub const PROGRAM_ENV: &str = "EXIFBOX_PROGRAM";

const DEFAULT_STACK_SIZE: u32 = 8 * 1024 * 1024;
const DEFAULT_HEAP_SIZE: u32 = 32 * 1024 * 1024;
const DEFAULT_ARGV0: &str = "zeroperl";

/// Extra host directory exposed to the guest.
#[derive(Clone, Debug)]
pub struct Mount {
    pub(crate) host: PathBuf,
    pub(crate) guest: String,
    pub(crate) dir_perms: DirPerms,
    pub(crate) file_perms: FilePerms,
}

/// Settings for [`Sandbox::open`](crate::Sandbox::open).
///
/// Sizes left unset, or set to zero, use their defaults.
#[derive(Clone)]
pub struct Config {
    pub(crate) module: Cow<'static, [u8]>,
    pub(crate) program: Cow<'static, [u8]>,
    pub(crate) allocator: Option<SharedAllocator>,
    guest_stack_size: u32,
    guest_heap_size: u32,
    exec_stack_size: u32,
    pub(crate) scratch_dir: Option<PathBuf>,
    pub(crate) cache: Option<PathBuf>,
    pub(crate) mounts: Vec<Mount>,
    pub(crate) guest_argv0: String,
}

impl Config {
    /// `module` is a wasm or precompiled module image, `program` the script
    /// its run entry point executes.
    pub fn new(
        module: impl Into<Cow<'static, [u8]>>,
        program: impl Into<Cow<'static, [u8]>>,
    ) -> Self {
        Self {
            module: module.into(),
            program: program.into(),
            allocator: None,
            guest_stack_size: 0,
            guest_heap_size: 0,
            exec_stack_size: 0,
            scratch_dir: None,
            cache: None,
            mounts: Vec::new(),
            guest_argv0: DEFAULT_ARGV0.to_string(),
        }
    }

    /// # Errors
    /// Returns an error if either file cannot be read.
    pub fn from_files(module: impl AsRef<Path>, program: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(read_input(module.as_ref())?, read_input(program.as_ref())?))
    }

    /// Load the module and program from the paths in [`MODULE_ENV`] and
    /// [`PROGRAM_ENV`].
    ///
    /// # Errors
    /// Returns an error if a variable is unset or a file cannot be read.
    pub fn from_env() -> Result<Self> {
        let var = |name: &str| {
            std::env::var_os(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::Config(format!("{name} is not set")))
        };
        Self::from_files(var(MODULE_ENV)?, var(PROGRAM_ENV)?)
    }

    /// Allocator for every host buffer the sandbox hands out. Defaults to
    /// `malloc`/`free`.
    #[must_use]
    pub fn allocator(mut self, allocator: SharedAllocator) -> Self {
        self.allocator = Some(allocator);
        self
    }

    #[must_use]
    pub const fn guest_stack_size(mut self, size: u32) -> Self {
        self.guest_stack_size = size;
        self
    }

    #[must_use]
    pub const fn guest_heap_size(mut self, size: u32) -> Self {
        self.guest_heap_size = size;
        self
    }

    /// Native stack available to guest execution.
    #[must_use]
    pub const fn exec_stack_size(mut self, size: u32) -> Self {
        self.exec_stack_size = size;
        self
    }

    /// Directory for temporary files. It is also the only general-purpose
    /// writable directory the guest sees. Defaults to the system temporary
    /// directory.
    #[must_use]
    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Set the optional compiled-module cache directory.
    ///
    /// When set, compiled artifacts are cached on disk and reused across
    /// opens.
    #[must_use]
    pub fn cache(mut self, cache: Option<PathBuf>) -> Self {
        self.cache = cache;
        self
    }

    /// Expose an extra host directory to the guest.
    #[must_use]
    pub fn mount(
        mut self,
        host_path: impl AsRef<Path>,
        guest_path: impl AsRef<str>,
        dir_perms: DirPerms,
        file_perms: FilePerms,
    ) -> Self {
        self.mounts.push(Mount {
            host: host_path.as_ref().to_path_buf(),
            guest: guest_path.as_ref().to_string(),
            dir_perms,
            file_perms,
        });
        self
    }

    #[must_use]
    pub fn guest_argv0(mut self, argv0: impl Into<String>) -> Self {
        self.guest_argv0 = argv0.into();
        self
    }

    pub(crate) fn resolved_allocator(&self) -> SharedAllocator {
        self.allocator.clone().unwrap_or_else(default_allocator)
    }

    /// Bytes the guest may grow its linear memory by after instantiation.
    pub(crate) fn memory_budget(&self) -> usize {
        let stack = or_default(self.guest_stack_size, DEFAULT_STACK_SIZE);
        let heap = or_default(self.guest_heap_size, DEFAULT_HEAP_SIZE);
        to_usize(stack).saturating_add(to_usize(heap))
    }

    pub(crate) fn max_wasm_stack(&self) -> usize {
        to_usize(or_default(self.exec_stack_size, DEFAULT_STACK_SIZE))
    }
}

impl core::fmt::Debug for Config {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Config")
            .field("module_bytes", &self.module.len())
            .field("program_bytes", &self.program.len())
            .field("custom_allocator", &self.allocator.is_some())
            .field("guest_stack_size", &self.guest_stack_size)
            .field("guest_heap_size", &self.guest_heap_size)
            .field("exec_stack_size", &self.exec_stack_size)
            .field("scratch_dir", &self.scratch_dir)
            .field("cache", &self.cache)
            .field("mounts", &self.mounts)
            .field("guest_argv0", &self.guest_argv0)
            .finish()
    }
}

const fn or_default(value: u32, default: u32) -> u32 {
    if value == 0 { default } else { value }
}

fn to_usize(value: u32) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

fn read_input(path: &Path) -> Result<Cow<'static, [u8]>> {
    std::fs::read(path)
        .map(Cow::Owned)
        .map_err(|e| Error::Config(format!("failed to read `{}`: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sizes_keep_defaults() {
        let config = Config::new(&b""[..], &b""[..])
            .guest_stack_size(0)
            .guest_heap_size(0)
            .exec_stack_size(0);
        assert_eq!(config.memory_budget(), 40 * 1024 * 1024);
        assert_eq!(config.max_wasm_stack(), 8 * 1024 * 1024);
    }

    #[test]
    fn explicit_sizes_are_used() {
        let config = Config::new(&b""[..], &b""[..])
            .guest_stack_size(1024)
            .guest_heap_size(4096)
            .exec_stack_size(512 * 1024);
        assert_eq!(config.memory_budget(), 5120);
        assert_eq!(config.max_wasm_stack(), 512 * 1024);
    }

    #[test]
    fn missing_file_is_reported_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("zeroperl.wasm");
        let err = Config::from_files(&missing, &missing).unwrap_err();
        assert!(err.to_string().contains("zeroperl.wasm"));
    }

    #[test]
    fn from_files_reads_both_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("m.wasm");
        let program = dir.path().join("p.pl");
        std::fs::write(&module, b"\0asm").unwrap();
        std::fs::write(&program, b"print 1;").unwrap();
        let config = Config::from_files(&module, &program).unwrap();
        assert_eq!(&*config.module, b"\0asm");
        assert_eq!(&*config.program, b"print 1;");
        assert_eq!(config.guest_argv0, "zeroperl");
    }
}
