use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
};

use parking_lot::Mutex;
use tracing::debug;
use wasmtime::{Config, Engine};

/// Engine-level settings; sandboxes with equal keys share one engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EngineKey {
    pub max_wasm_stack: usize,
}

struct Entry {
    engine: Engine,
    leases: usize,
}

/// Shared global engine registry state.
struct RegistryShared {
    engines: Mutex<HashMap<EngineKey, Entry>>,
}

pub struct EngineRegistry {
    shared: Arc<RegistryShared>,
}

/// Lease that keeps a registry engine alive for one sandbox.
pub struct EngineLease {
    key: EngineKey,
    engine: Engine,
    shared: Arc<RegistryShared>,
}

impl EngineRegistry {
    fn new() -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                engines: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn acquire(&self, key: EngineKey) -> wasmtime::Result<EngineLease> {
        let mut engines = self.shared.engines.lock();
        let engine = if let Some(entry) = engines.get_mut(&key) {
            entry.leases += 1;
            entry.engine.clone()
        } else {
            let mut cfg = Config::new();
            configure_engine(&mut cfg, key);
            let engine = Engine::new(&cfg)?;
            debug!(?key, "engine created");
            engines.insert(
                key,
                Entry {
                    engine: engine.clone(),
                    leases: 1,
                },
            );
            engine
        };
        drop(engines);
        Engine::tls_eager_initialize();

        Ok(EngineLease {
            key,
            engine,
            shared: Arc::clone(&self.shared),
        })
    }

    #[cfg(test)]
    fn leases(&self, key: EngineKey) -> usize {
        self.shared
            .engines
            .lock()
            .get(&key)
            .map_or(0, |entry| entry.leases)
    }
}

impl EngineLease {
    pub const fn engine(&self) -> &Engine {
        &self.engine
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        let mut engines = self.shared.engines.lock();
        if let Some(entry) = engines.get_mut(&self.key) {
            entry.leases -= 1;
            if entry.leases == 0 {
                engines.remove(&self.key);
                debug!(key = ?self.key, "engine released");
            }
        }
    }
}

pub fn global_registry() -> &'static EngineRegistry {
    static GLOBAL_REGISTRY: OnceLock<EngineRegistry> = OnceLock::new();
    GLOBAL_REGISTRY.get_or_init(EngineRegistry::new)
}

pub fn configure_engine(cfg: &mut Config, key: EngineKey) {
    cfg.max_wasm_stack(key.max_wasm_stack);
    cfg.table_lazy_init(false);
    cfg.generate_address_map(false);
    cfg.wasm_backtrace(false);
    cfg.native_unwind_info(false);
    cfg.cranelift_opt_level(wasmtime::OptLevel::Speed);
}
