//! Host to guest argument marshaling.
//!
//! Arguments become NUL-terminated strings in guest memory plus a table of
//! little-endian `u32` pointers. Every guest allocation lands in a [`Frame`]
//! as soon as it succeeds, so one [`Frame::release`] frees everything
//! whether marshaling finished or stopped halfway.

use smallvec::SmallVec;

use crate::{error::CallError, options::CallOptions};

const POINTER_SIZE: usize = size_of::<u32>();

/// Guest-side allocation primitives.
pub trait GuestHeap {
    /// Allocate `size` bytes; `None` when the guest allocator is exhausted.
    fn alloc(&mut self, size: u32) -> Option<u32>;

    fn free(&mut self, ptr: u32);

    /// Copy `bytes` to `ptr`. Returns `false` when the range is out of bounds.
    fn write(&mut self, ptr: u32, bytes: &[u8]) -> bool;
}

/// Argument order seen by the tool: caller flags, then `-config <path>`, then
/// tag assignments, then the operation's own positional tail. Later flags
/// override earlier ones.
pub fn argument_list<'a>(options: &CallOptions<'a>, tail: &[&'a str]) -> SmallVec<[&'a str; 16]> {
    let config = usize::from(options.config_path.is_some()) * 2;
    let mut list =
        SmallVec::with_capacity(options.args.len() + config + options.tags.len() + tail.len());
    list.extend_from_slice(options.args);
    if let Some(path) = options.config_path {
        list.push("-config");
        list.push(path);
    }
    list.extend_from_slice(options.tags);
    list.extend_from_slice(tail);
    list
}

/// Guest memory owned by one call.
#[derive(Debug)]
pub struct Frame {
    allocations: SmallVec<[u32; 16]>,
    argc: i32,
    argv: u32,
    program: u32,
}

impl Frame {
    pub const fn argc(&self) -> i32 {
        self.argc
    }

    pub const fn argv(&self) -> u32 {
        self.argv
    }

    pub const fn program(&self) -> u32 {
        self.program
    }

    /// Free every allocation, newest first.
    pub fn release(self, heap: &mut impl GuestHeap) {
        for ptr in self.allocations.into_iter().rev() {
            heap.free(ptr);
        }
    }

    fn string(&mut self, heap: &mut impl GuestHeap, s: &str) -> Option<u32> {
        let size = u32::try_from(s.len()).ok()?.checked_add(1)?;
        let ptr = heap.alloc(size)?;
        self.allocations.push(ptr);

        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        heap.write(ptr, &bytes).then_some(ptr)
    }

    fn fill(&mut self, heap: &mut impl GuestHeap, args: &[&str], program: &str) -> Option<()> {
        let mut table = Vec::with_capacity(args.len().max(1) * POINTER_SIZE);
        for arg in args {
            let ptr = self.string(heap, arg)?;
            table.extend_from_slice(&ptr.to_le_bytes());
        }
        if table.is_empty() {
            // Keep argv a valid, distinct allocation even with no arguments.
            table.extend_from_slice(&0u32.to_le_bytes());
        }

        let argv = heap.alloc(u32::try_from(table.len()).ok()?)?;
        self.allocations.push(argv);
        if !heap.write(argv, &table) {
            return None;
        }
        self.argv = argv;
        self.program = self.string(heap, program)?;
        Some(())
    }
}

/// Write `args` and `program` into guest memory.
///
/// # Errors
///
/// Returns an out-of-memory [`CallError`] if any guest allocation fails; the
/// allocations made before the failure have been freed by then.
pub fn marshal(
    heap: &mut impl GuestHeap,
    args: &[&str],
    program: &str,
) -> Result<Frame, CallError> {
    let argc = i32::try_from(args.len()).map_err(|_| CallError::out_of_memory())?;
    let mut frame = Frame {
        allocations: SmallVec::with_capacity(args.len() + 2),
        argc,
        argv: 0,
        program: 0,
    };
    if frame.fill(heap, args, program).is_some() {
        Ok(frame)
    } else {
        frame.release(heap);
        Err(CallError::out_of_memory())
    }
}
