use std::{
    collections::hash_map::DefaultHasher,
    fmt::Write as _,
    hash::{Hash, Hasher},
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use sha2::{Digest, Sha256};
use wasmtime::Engine;

fn engine_fingerprint(engine: &Engine) -> u64 {
    let mut hasher = DefaultHasher::new();
    engine.precompile_compatibility_hash().hash(&mut hasher);
    hasher.finish()
}

/// File stem for the compiled artifact of `image` under `engine`.
pub fn cache_key(engine: &Engine, image: &[u8]) -> String {
    let mut image_h = Sha256::new();
    image_h.update(image);
    let image_digest = image_h.finalize();

    let mut h = Sha256::new();
    h.update(b"exifbox-cache-v1\0");
    h.update(image_digest);
    h.update(engine_fingerprint(engine).to_le_bytes());

    let digest = h.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

pub fn write_cache_file_atomic(cache_path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    static CACHE_WRITE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

    let sequence = CACHE_WRITE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let tmp_path =
        cache_path.with_extension(format!("cwasm.tmp-{}-{sequence}", std::process::id()));

    std::fs::write(&tmp_path, bytes)?;
    match std::fs::rename(&tmp_path, cache_path) {
        Ok(()) => Ok(()),
        // Windows doesn't atomically replace by default; treat a concurrent winner as success.
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = std::fs::remove_file(&tmp_path);
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_path);
            Err(e)
        }
    }
}
