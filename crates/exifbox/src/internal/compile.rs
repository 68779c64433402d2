use std::path::Path;

use tracing::debug;
use wasmtime::{Engine, Module, Precompiled};

use crate::{
    error::{Error, Result},
    internal::cache::{cache_key, write_cache_file_atomic},
};

/// Turn a module image into a loaded [`Module`].
///
/// Precompiled artifacts are deserialized as-is; plain wasm is compiled, going
/// through the on-disk cache when one is configured.
pub fn load_module(engine: &Engine, image: &[u8], cache: Option<&Path>) -> Result<Module> {
    match Engine::detect_precompiled(image) {
        Some(Precompiled::Module) => {
            debug!("loading precompiled module");
            // SAFETY: the embedder supplies the image as a trusted artifact;
            // incompatible artifacts fail the compatibility check and surface
            // as an error.
            unsafe { Module::deserialize(engine, image) }.map_err(Error::Wasm)
        }
        Some(Precompiled::Component) => Err(Error::Config(
            "component images are not supported; provide a core module".to_string(),
        )),
        None => compile_module(engine, image, cache),
    }
}

fn compile_module(engine: &Engine, image: &[u8], cache: Option<&Path>) -> Result<Module> {
    let Some(cache_dir) = cache else {
        debug!(bytes = image.len(), "compiling module");
        return Module::new(engine, image).map_err(Error::Wasm);
    };

    std::fs::create_dir_all(cache_dir)?;
    let key = cache_key(engine, image);
    let cache_path = cache_dir.join(format!("{key}.cwasm"));

    // SAFETY: cache entries are written by this crate for the same engine
    // configuration; stale or foreign files fail deserialization.
    if let Ok(module) = unsafe { Module::deserialize_file(engine, &cache_path) } {
        debug!(path = %cache_path.display(), "module cache hit");
        return Ok(module);
    }

    debug!(path = %cache_path.display(), "module cache miss");
    let bytes = engine.precompile_module(image).map_err(Error::Wasm)?;
    write_cache_file_atomic(&cache_path, &bytes)?;

    // SAFETY: see above.
    unsafe { Module::deserialize_file(engine, &cache_path) }.map_err(Error::Wasm)
}
