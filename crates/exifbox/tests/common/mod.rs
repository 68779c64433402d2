#![allow(dead_code)]

use std::{
    num::NonZeroUsize,
    path::Path,
    ptr::NonNull,
    sync::{
        Arc, Once,
        atomic::{AtomicIsize, Ordering},
    },
};

use anyhow::{Context, Result};
use exifbox::{Config, HostAllocator, Malloc, Output, Sandbox};
use tempfile::TempDir;

pub const FAKE_GUEST: &str = include_str!("../fixtures/fake_guest.wat");
pub const FAKE_PROGRAM: &[u8] = b"print \"hello\\n\";\n";

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

pub fn fake_config(scratch: &Path) -> Config {
    Config::new(FAKE_GUEST.as_bytes(), FAKE_PROGRAM).scratch_dir(scratch)
}

/// Fake guest sandbox over a private scratch directory.
pub fn open_fake() -> Result<(TempDir, Sandbox)> {
    init_tracing();
    let scratch = tempfile::tempdir().context("failed to create scratch dir")?;
    let sandbox = Sandbox::open(fake_config(scratch.path())).context("failed to open sandbox")?;
    Ok((scratch, sandbox))
}

pub fn lines(output: &Output) -> Vec<&str> {
    output
        .as_str()
        .expect("fake guest output is UTF-8")
        .lines()
        .collect()
}

/// Outstanding guest allocations reported by the fake guest during a call.
pub fn live_count(output: &Output) -> u32 {
    let first = lines(output)[0];
    first
        .strip_prefix("live=")
        .and_then(|n| n.parse().ok())
        .unwrap_or_else(|| panic!("unexpected first line {first:?}"))
}

pub fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .expect("read scratch dir")
        .map(|entry| entry.expect("dir entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// `malloc` with a live-allocation counter.
#[derive(Default)]
pub struct CountingAllocator {
    pub live: AtomicIsize,
}

impl CountingAllocator {
    pub fn live(&self) -> isize {
        self.live.load(Ordering::SeqCst)
    }
}

unsafe impl HostAllocator for CountingAllocator {
    fn allocate(&self, size: NonZeroUsize) -> Option<NonNull<u8>> {
        self.live.fetch_add(1, Ordering::SeqCst);
        Malloc.allocate(size)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        unsafe { Malloc.deallocate(ptr, size) };
    }
}

pub fn counting() -> Arc<CountingAllocator> {
    Arc::new(CountingAllocator::default())
}

/// Real guest inputs from the environment, or `None` (with a one-time note)
/// when they are not configured.
pub fn real_guest_config() -> Option<Config> {
    static SKIP_MESSAGE_ONCE: Once = Once::new();
    match Config::from_env() {
        Ok(config) => Some(config),
        Err(e) => {
            SKIP_MESSAGE_ONCE.call_once(|| {
                eprintln!(
                    "skipping real guest tests: {e}. Set {} and {} to the interpreter \
                     module and tool script.",
                    exifbox::MODULE_ENV,
                    exifbox::PROGRAM_ENV
                );
            });
            None
        }
    }
}
