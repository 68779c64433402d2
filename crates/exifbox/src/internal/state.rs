use std::path::Path;

use anyhow::Context as _;
use tracing::trace;
use wasmtime::{Engine, Linker, Store};
use wasmtime_wasi::{
    DirPerms, FilePerms, WasiCtxBuilder,
    p1::{self, WasiP1Ctx},
};

use crate::{
    config::Mount,
    internal::{
        capture::{Capture, GuestLog},
        resource::MemoryLimiter,
    },
};

/// Store data for one guest instance.
pub struct GuestState {
    pub limiter: MemoryLimiter,
    wasi: WasiP1Ctx,
}

/// Settings that shape the guest's WASI view of the host.
pub struct StoreParams<'a> {
    pub argv0: &'a str,
    pub scratch_dir: &'a Path,
    pub mounts: &'a [Mount],
    pub memory_budget: usize,
}

impl GuestState {
    /// Linker with WASI preview1 and the `env` host stubs the guest imports.
    ///
    /// # Errors
    ///
    /// Returns an error if any import fails to register.
    pub fn new_linker(engine: &Engine) -> anyhow::Result<Linker<Self>> {
        let mut linker = Linker::<Self>::new(engine);
        p1::add_to_linker_sync(&mut linker, |s: &mut Self| &mut s.wasi)?;
        // Unused by the sandboxed tool, but the import must resolve.
        linker.func_wrap(
            "env",
            "call_host_function",
            |id: i32, args: i32, len: i32| -> i32 {
                trace!(id, args, len, "host function stub called");
                0
            },
        )?;
        Ok(linker)
    }

    /// # Errors
    ///
    /// Returns an error if a preopened directory cannot be opened.
    pub fn new_store(
        engine: &Engine,
        params: &StoreParams<'_>,
        capture: &Capture,
    ) -> anyhow::Result<Store<Self>> {
        let mut builder = WasiCtxBuilder::new();
        builder
            .arg(params.argv0)
            .allow_tcp(false)
            .allow_udp(false)
            .allow_ip_name_lookup(false)
            .stdout(capture.stdout())
            .stderr(GuestLog);

        builder
            .preopened_dir("/", "/", DirPerms::READ, FilePerms::READ)
            .context("failed to preopen `/`")?;
        let scratch = params
            .scratch_dir
            .to_str()
            .context("scratch directory path is not valid UTF-8")?;
        builder
            .preopened_dir(params.scratch_dir, scratch, DirPerms::all(), FilePerms::all())
            .with_context(|| format!("failed to preopen scratch directory `{scratch}`"))?;
        if Path::new("/dev").is_dir() {
            builder
                .preopened_dir("/dev", "/dev", DirPerms::all(), FilePerms::all())
                .context("failed to preopen `/dev`")?;
        }
        for mount in params.mounts {
            builder
                .preopened_dir(&mount.host, &mount.guest, mount.dir_perms, mount.file_perms)
                .with_context(|| {
                    format!(
                        "failed to add directory mapping '{}' -> '{}'",
                        mount.host.display(),
                        mount.guest
                    )
                })?;
        }

        let mut store = Store::new(
            engine,
            Self {
                limiter: MemoryLimiter::new(params.memory_budget),
                wasi: builder.build_p1(),
            },
        );
        store.limiter(|s| &mut s.limiter);
        Ok(store)
    }
}
