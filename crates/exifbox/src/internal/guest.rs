use tracing::{debug, warn};
use wasmtime::{
    AsContextMut, Engine, Func, Instance, Memory, Module, Store, TypedFunc, Val, WasmParams,
    WasmResults,
};

use crate::{
    alloc::SharedAllocator,
    error::{CallError, CallErrorKind, Error, Result},
    internal::{
        capture::Capture,
        invoke::{RunOutcome, ThreadEnv, read_cstr, settle},
        marshal::{Frame, GuestHeap, marshal},
        state::{GuestState, StoreParams},
    },
    output::Output,
};

const INIT: &str = "zeroperl_init";
const RESET: &str = "zeroperl_reset";
const RUN_FILE: &str = "zeroperl_run_file";
const FLUSH: &str = "zeroperl_flush";
const LAST_ERROR: &str = "zeroperl_last_error";
const FREE_INTERPRETER: &str = "zeroperl_free_interpreter";
const MALLOC: &str = "malloc";
const FREE: &str = "free";
const MEMORY: &str = "memory";

/// Entry points resolved once at instantiation.
struct Entries {
    init: TypedFunc<(), i32>,
    reset: TypedFunc<(), i32>,
    run_file: TypedFunc<(u32, i32, u32), i32>,
    flush: Func,
    last_error: Option<TypedFunc<(), u32>>,
    free_interpreter: Option<Func>,
    malloc: TypedFunc<u32, u32>,
    free: TypedFunc<u32, ()>,
    memory: Memory,
}

fn typed<P: WasmParams, R: WasmResults>(
    store: &mut Store<GuestState>,
    instance: &Instance,
    name: &'static str,
) -> Result<Option<TypedFunc<P, R>>> {
    let Some(func) = instance.get_func(&mut *store, name) else {
        return Ok(None);
    };
    func.typed(&*store)
        .map(Some)
        .map_err(|e| Error::Wasm(e.context(format!("export `{name}` has an unexpected signature"))))
}

fn required<P: WasmParams, R: WasmResults>(
    store: &mut Store<GuestState>,
    instance: &Instance,
    name: &'static str,
) -> Result<TypedFunc<P, R>> {
    typed(store, instance, name)?.ok_or(Error::MissingExport(name))
}

impl Entries {
    fn resolve(store: &mut Store<GuestState>, instance: &Instance) -> Result<Self> {
        Ok(Self {
            init: required(store, instance, INIT)?,
            reset: required(store, instance, RESET)?,
            run_file: required(store, instance, RUN_FILE)?,
            flush: instance
                .get_func(&mut *store, FLUSH)
                .ok_or(Error::MissingExport(FLUSH))?,
            last_error: typed(store, instance, LAST_ERROR)?,
            free_interpreter: instance.get_func(&mut *store, FREE_INTERPRETER),
            malloc: required(store, instance, MALLOC)?,
            free: required(store, instance, FREE)?,
            memory: instance
                .get_memory(&mut *store, MEMORY)
                .ok_or(Error::MissingExport(MEMORY))?,
        })
    }
}

/// A guest instance and its resolved entry points.
pub struct Guest {
    store: Store<GuestState>,
    entries: Entries,
}

/// Guest allocator view used while marshaling one call.
struct StoreHeap<'a> {
    store: &'a mut Store<GuestState>,
    entries: &'a Entries,
}

impl GuestHeap for StoreHeap<'_> {
    fn alloc(&mut self, size: u32) -> Option<u32> {
        match self.entries.malloc.call(&mut *self.store, size) {
            Ok(0) => None,
            Ok(ptr) => Some(ptr),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "guest malloc trapped");
                None
            }
        }
    }

    fn free(&mut self, ptr: u32) {
        if let Err(e) = self.entries.free.call(&mut *self.store, ptr) {
            warn!(error = %format!("{e:#}"), ptr, "guest free trapped");
        }
    }

    fn write(&mut self, ptr: u32, bytes: &[u8]) -> bool {
        usize::try_from(ptr).is_ok_and(|offset| {
            self.entries
                .memory
                .write(&mut *self.store, offset, bytes)
                .is_ok()
        })
    }
}

/// Call an export whose result arity the guest chooses, ignoring results.
fn call_untyped(mut store: impl AsContextMut, func: &Func) -> wasmtime::Result<()> {
    let arity = func.ty(&store).results().len();
    let mut results = vec![Val::I32(0); arity];
    func.call(&mut store, &[], &mut results)
}

impl Guest {
    /// Link, instantiate, and resolve entry points. Does not run init.
    pub fn instantiate(
        engine: &Engine,
        module: &Module,
        params: &StoreParams<'_>,
        capture: &Capture,
    ) -> Result<Self> {
        let linker = GuestState::new_linker(engine).map_err(Error::Wasm)?;
        let mut store = GuestState::new_store(engine, params, capture).map_err(Error::Wasm)?;
        let instance = linker
            .instantiate(&mut store, module)
            .map_err(Error::Wasm)?;
        let entries = Entries::resolve(&mut store, &instance)?;
        debug!(
            memory_bytes = store.data().limiter.current(),
            "guest instantiated"
        );
        Ok(Self { store, entries })
    }

    /// One-time interpreter setup.
    pub fn init(&mut self) -> Result<()> {
        let _thread = ThreadEnv::ensure();
        match self.entries.init.call(&mut self.store, ()) {
            Ok(0) => Ok(()),
            Ok(rc) => Err(Error::Init(rc)),
            Err(e) => Err(Error::Wasm(e.context("guest initialization trapped"))),
        }
    }

    /// Run the tool once with `args`, returning captured stdout on success.
    pub fn call(
        &mut self,
        args: &[&str],
        program: &str,
        capture: &Capture,
        alloc: &SharedAllocator,
    ) -> core::result::Result<Output, CallError> {
        let _thread = ThreadEnv::ensure();
        self.reset()?;

        let frame = marshal(&mut self.heap(), args, program)?;
        let result = self.run(&frame, capture, alloc);
        frame.release(&mut self.heap());
        result
    }

    /// Tear down the interpreter, if the guest supports it.
    pub fn free_interpreter(&mut self) {
        let Some(func) = self.entries.free_interpreter else {
            return;
        };
        let _thread = ThreadEnv::ensure();
        if let Err(e) = call_untyped(&mut self.store, &func) {
            warn!(error = %format!("{e:#}"), "guest interpreter teardown failed");
        }
    }

    fn heap(&mut self) -> StoreHeap<'_> {
        StoreHeap {
            store: &mut self.store,
            entries: &self.entries,
        }
    }

    fn reset(&mut self) -> core::result::Result<(), CallError> {
        let rc = match self.entries.reset.call(&mut self.store, ()) {
            Ok(0) => return Ok(()),
            Ok(rc) => rc,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "guest reset trapped");
                -1
            }
        };
        Err(CallError::new(CallErrorKind::Reset, "guest reset failed", rc))
    }

    fn run(
        &mut self,
        frame: &Frame,
        capture: &Capture,
        alloc: &SharedAllocator,
    ) -> core::result::Result<Output, CallError> {
        capture
            .clear()
            .map_err(|e| CallError::io(format!("failed to reset captured output: {e}")))?;

        let result = self
            .entries
            .run_file
            .call(&mut self.store, (frame.program(), frame.argc(), frame.argv()));
        let outcome = RunOutcome::from_call(result);
        debug!(?outcome, "run entry point finished");

        if let Err(e) = call_untyped(&mut self.store, &self.entries.flush) {
            warn!(error = %format!("{e:#}"), "guest flush failed");
        }

        let code = settle(outcome, || self.last_error())?;
        let data = capture
            .read(alloc)
            .map_err(|e| CallError::io(format!("failed to read captured output: {e}")))?;
        Ok(Output::new(data, code))
    }

    fn last_error(&mut self) -> Option<String> {
        let func = self.entries.last_error.clone()?;
        let ptr = func
            .call(&mut self.store, ())
            .map_err(|e| warn!(error = %format!("{e:#}"), "guest last-error query trapped"))
            .ok()?;
        read_cstr(self.entries.memory.data(&self.store), ptr)
    }
}
