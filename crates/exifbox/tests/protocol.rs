mod common;

use std::{
    cell::Cell,
    path::Path,
    sync::{Arc, atomic::Ordering},
    thread,
};

use anyhow::{Context, Result};
use exifbox::{
    CallErrorKind, CallOptions, Config, Error, HostBuf, NamedBuffer, READ_DEFAULTS, Sandbox,
    SharedAllocator, SharedSandbox,
};

use common::{
    FAKE_PROGRAM, counting, entries, fake_config, init_tracing, lines, live_count, open_fake,
};

#[test]
fn arguments_reach_the_guest_in_order() -> Result<()> {
    let (_scratch, mut sandbox) = open_fake()?;
    let options = CallOptions::new()
        .args(&["-fast"])
        .config_path("/etc/tool.cfg")
        .tags(&["-Artist=A"]);

    let out = sandbox.execute(&["first", "second"], &options)?;

    assert_eq!(out.exit_code(), 0);
    assert_eq!(
        lines(&out),
        [
            "live=08",
            "-fast",
            "-config",
            "/etc/tool.cfg",
            "-Artist=A",
            "first",
            "second"
        ]
    );
    Ok(())
}

#[test]
fn read_uses_baseline_flags_and_an_absolute_path() -> Result<()> {
    let (_scratch, mut sandbox) = open_fake()?;
    let out = sandbox.read("photo.jpg", &CallOptions::default())?;
    let lines = lines(&out);

    assert_eq!(&lines[1..7], READ_DEFAULTS);
    let path = Path::new(lines[7]);
    assert!(path.is_absolute(), "{path:?} is not absolute");
    assert!(path.ends_with("photo.jpg"));
    assert_eq!(lines.len(), 8);
    Ok(())
}

#[test]
fn guest_memory_is_released_after_every_outcome() -> Result<()> {
    let (_scratch, mut sandbox) = open_fake()?;
    let none = CallOptions::default();
    let baseline = live_count(&sandbox.execute(&["a"], &none)?);
    assert_eq!(baseline, 3);

    let long = "x".repeat(5000);
    for _ in 0..3 {
        let err = sandbox.execute(&["a", long.as_str()], &none).unwrap_err();
        assert_eq!(err.kind(), CallErrorKind::OutOfMemory);
        assert_eq!(err.exit_code(), -1);

        for control in ["!t", "!x", "!e", "!c"] {
            sandbox.execute(&[control], &none).unwrap_err();
        }
    }

    assert_eq!(live_count(&sandbox.execute(&["a"], &none)?), baseline);
    Ok(())
}

#[test]
fn proc_exit_distinguishes_success_from_failure() -> Result<()> {
    let (_scratch, mut sandbox) = open_fake()?;
    let none = CallOptions::default();

    let out = sandbox.execute(&["!z"], &none)?;
    assert_eq!(out.exit_code(), 0);
    assert_eq!(lines(&out)[1], "!z");

    let err = sandbox.execute(&["!x"], &none).unwrap_err();
    assert_eq!(err.kind(), CallErrorKind::Exit);
    assert_eq!(err.exit_code(), 3);
    assert!(err.message().contains("exit code 3"), "{}", err.message());
    Ok(())
}

#[test]
fn traps_report_engine_text() -> Result<()> {
    let (_scratch, mut sandbox) = open_fake()?;
    let err = sandbox
        .execute(&["!t"], &CallOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), CallErrorKind::Trap);
    assert_eq!(err.exit_code(), -1);
    assert!(err.message().contains("unreachable"), "{}", err.message());

    // The instance is still usable after a trap.
    sandbox.execute(&["after"], &CallOptions::default())?;
    Ok(())
}

#[test]
fn guest_error_text_is_preferred_over_exit_code() -> Result<()> {
    let (_scratch, mut sandbox) = open_fake()?;
    let none = CallOptions::default();

    let err = sandbox.execute(&["!e"], &none).unwrap_err();
    assert_eq!(err.kind(), CallErrorKind::Guest);
    assert_eq!(err.message(), "guest failure");
    assert_eq!(err.exit_code(), 1);

    let err = sandbox.execute(&["!c"], &none).unwrap_err();
    assert_eq!(err.kind(), CallErrorKind::Exit);
    assert_eq!(err.exit_code(), 2);
    Ok(())
}

#[test]
fn last_error_is_ignored_on_success() -> Result<()> {
    let (_scratch, mut sandbox) = open_fake()?;
    let out = sandbox.execute(&["!s"], &CallOptions::default())?;
    assert_eq!(out.exit_code(), 0);
    Ok(())
}

#[test]
fn reset_failure_fails_only_that_call() -> Result<()> {
    let (_scratch, mut sandbox) = open_fake()?;
    let none = CallOptions::default();

    sandbox.execute(&["!r"], &none)?;
    let err = sandbox.execute(&["a"], &none).unwrap_err();
    assert_eq!(err.kind(), CallErrorKind::Reset);
    assert_eq!(err.exit_code(), 1);

    assert_eq!(live_count(&sandbox.execute(&["a"], &none)?), 3);
    Ok(())
}

#[test]
fn transform_applies_to_successful_reads_only() -> Result<()> {
    let (_scratch, mut sandbox) = open_fake()?;
    let calls = Cell::new(0);
    let upper = |data: &[u8], alloc: &SharedAllocator| {
        calls.set(calls.get() + 1);
        HostBuf::copy_from(alloc, &data.to_ascii_uppercase())
    };

    let options = CallOptions::new().transform(&upper);
    let out = sandbox.read("photo.jpg", &options)?;
    assert!(out.as_str().context("utf-8")?.starts_with("LIVE="));
    assert_eq!(calls.get(), 1);

    let failing = CallOptions::new().args(&["!e"]).transform(&upper);
    let err = sandbox.read("photo.jpg", &failing).unwrap_err();
    assert_eq!(err.message(), "guest failure");
    assert_eq!(calls.get(), 1);

    // Raw execution and writes are never transformed.
    let out = sandbox.execute(&["a"], &options)?;
    assert!(out.as_str().context("utf-8")?.starts_with("live="));
    assert_eq!(calls.get(), 1);
    Ok(())
}

#[test]
fn transform_returning_nothing_yields_empty_output() -> Result<()> {
    let (_scratch, mut sandbox) = open_fake()?;
    let drop_all = |_: &[u8], _: &SharedAllocator| -> Option<HostBuf> { None };
    let out = sandbox.read("photo.jpg", &CallOptions::new().transform(&drop_all))?;
    assert!(out.data().is_empty());
    Ok(())
}

#[test]
fn read_from_buffer_keeps_extension_and_cleans_up() -> Result<()> {
    let (scratch, mut sandbox) = open_fake()?;
    assert_eq!(entries(scratch.path()).len(), 1, "only the program file");

    for _ in 0..3 {
        let out = sandbox.read_from_buffer(
            NamedBuffer::new(b"\xff\xd8\xff\xe0", "holiday.JPG"),
            &CallOptions::default(),
        )?;
        let spilled = Path::new(*lines(&out).last().context("no output")?);
        assert!(spilled.starts_with(scratch.path()));
        let name = spilled.file_name().context("no name")?.to_string_lossy();
        assert!(name.starts_with("exifbox_") && name.ends_with(".JPG"), "{name}");
        assert_eq!(entries(scratch.path()).len(), 1);
    }

    sandbox
        .read_from_buffer(
            NamedBuffer::new(b"data", "x.png"),
            &CallOptions::new().args(&["!t"]),
        )
        .unwrap_err();
    assert_eq!(entries(scratch.path()).len(), 1);
    Ok(())
}

#[test]
fn repeated_buffer_reads_are_identical() -> Result<()> {
    let (_scratch, mut sandbox) = open_fake()?;
    let input = NamedBuffer::new(b"GIF89a", "anim.gif");
    let first = sandbox.read_from_buffer(input, &CallOptions::default())?;
    for _ in 0..5 {
        let next = sandbox.read_from_buffer(input, &CallOptions::default())?;
        assert_eq!(live_count(&next), live_count(&first));
        assert_eq!(lines(&next)[..7], lines(&first)[..7]);
    }
    Ok(())
}

#[test]
fn write_to_buffer_returns_the_produced_file() -> Result<()> {
    let (scratch, mut sandbox) = open_fake()?;
    let tags = ["-Artist=Zo\u{eb}", "-Comment=\u{65e5}\u{672c}\u{8a9e}"];
    let out = sandbox.write_to_buffer(
        NamedBuffer::new(b"\x89PNG\r\n\x1a\n", "image.png"),
        &CallOptions::new().tags(&tags),
    )?;

    assert_eq!(
        out.as_str().context("utf-8")?,
        "-Artist=Zo\u{eb}\n-Comment=\u{65e5}\u{672c}\u{8a9e}\n"
    );
    assert_eq!(entries(scratch.path()).len(), 1);
    Ok(())
}

#[test]
fn write_to_buffer_without_output_file_fails() -> Result<()> {
    let (scratch, mut sandbox) = open_fake()?;
    let input = NamedBuffer::new(b"\xff\xd8", "a.jpg");

    let err = sandbox
        .write_to_buffer(input, &CallOptions::new().args(&["!n"]))
        .unwrap_err();
    assert_eq!(err.kind(), CallErrorKind::Io);
    assert_eq!(err.message(), "output file not produced");
    assert_eq!(err.exit_code(), -1);
    assert_eq!(entries(scratch.path()).len(), 1);

    let err = sandbox
        .write_to_buffer(input, &CallOptions::new().args(&["!e"]))
        .unwrap_err();
    assert_eq!(err.kind(), CallErrorKind::Guest);
    assert_eq!(entries(scratch.path()).len(), 1);
    Ok(())
}

#[test]
fn write_targets_new_file_or_overwrites_in_place() -> Result<()> {
    let (scratch, mut sandbox) = open_fake()?;
    let input = scratch.path().join("in.jpg");
    let output = scratch.path().join("out.jpg");
    std::fs::write(&input, b"\xff\xd8")?;
    let options = CallOptions::new().tags(&["-Title=T"]);

    sandbox.write(&input, Some(output.as_path()), &options)?;
    assert_eq!(std::fs::read(&output)?, b"-Title=T\n");

    let out = sandbox.write(&input, None, &options)?;
    let lines = lines(&out);
    assert_eq!(lines[1..3], ["-Title=T", "-overwrite_original"]);
    assert_eq!(Path::new(lines[3]), input);
    Ok(())
}

#[test]
fn failed_open_releases_everything() {
    init_tracing();
    let scratch = tempfile::tempdir().unwrap();
    let missing = Config::new(&b"(module (memory (export \"memory\") 1))"[..], FAKE_PROGRAM)
        .scratch_dir(scratch.path());
    match Sandbox::open(missing) {
        Err(Error::MissingExport(name)) => assert_eq!(name, "zeroperl_init"),
        other => panic!("unexpected result {other:?}"),
    }
    assert!(entries(scratch.path()).is_empty());

    let garbage = Config::new(&b"not a module"[..], FAKE_PROGRAM).scratch_dir(scratch.path());
    assert!(matches!(Sandbox::open(garbage), Err(Error::Wasm(_))));
    assert!(entries(scratch.path()).is_empty());
}

#[test]
fn close_removes_program_file() -> Result<()> {
    let (scratch, sandbox) = open_fake()?;
    let program = scratch.path().join(&entries(scratch.path())[0]);
    assert_eq!(std::fs::read(&program)?, FAKE_PROGRAM);

    sandbox.close();
    assert!(entries(scratch.path()).is_empty());
    Ok(())
}

#[test]
fn compiled_modules_are_cached() -> Result<()> {
    init_tracing();
    let scratch = tempfile::tempdir()?;
    let cache = tempfile::tempdir()?;
    let config = || fake_config(scratch.path()).cache(Some(cache.path().to_path_buf()));

    let first = Sandbox::open(config())?;
    let artifacts = entries(cache.path());
    assert_eq!(artifacts.len(), 1);
    assert!(artifacts[0].ends_with(".cwasm"));

    let mut second = Sandbox::open(config())?;
    assert_eq!(entries(cache.path()), artifacts);
    second.execute(&["cached"], &CallOptions::default())?;
    drop(first);
    Ok(())
}

#[test]
fn host_buffers_come_from_the_configured_allocator() -> Result<()> {
    init_tracing();
    let scratch = tempfile::tempdir()?;
    let allocator = counting();
    let config = fake_config(scratch.path()).allocator(allocator.clone());

    let mut sandbox = Sandbox::open(config)?;
    // the module image copy
    assert_eq!(allocator.live(), 1);

    let out = sandbox.execute(&["a"], &CallOptions::default())?;
    assert_eq!(allocator.live(), 2);
    drop(out);
    assert_eq!(allocator.live(), 1);

    sandbox.execute(&["!e"], &CallOptions::default()).unwrap_err();
    assert_eq!(allocator.live(), 1);

    drop(sandbox);
    assert_eq!(allocator.live.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn independent_sandboxes_run_concurrently() -> Result<()> {
    init_tracing();
    let handles: Vec<_> = (0..2)
        .map(|worker| {
            thread::spawn(move || -> Result<()> {
                let (_scratch, mut sandbox) = open_fake()?;
                for call in 0..5 {
                    let tag = format!("worker{worker}-call{call}");
                    let out = sandbox.execute(&[tag.as_str()], &CallOptions::default())?;
                    assert_eq!(lines(&out), ["live=03", tag.as_str()]);
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked")?;
    }
    Ok(())
}

#[test]
fn shared_sandbox_serializes_calls() -> Result<()> {
    init_tracing();
    let scratch = tempfile::tempdir()?;
    let shared = Arc::new(SharedSandbox::open(fake_config(scratch.path()))?);

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || -> Result<()> {
                for call in 0..5 {
                    let tag = format!("w{worker}c{call}");
                    let out = shared.with(|s| s.execute(&[tag.as_str()], &CallOptions::default()))?;
                    assert_eq!(lines(&out)[1], tag);
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked")?;
    }

    let out = shared.read_from_buffer(NamedBuffer::new(b"x", "x.tif"), &CallOptions::default())?;
    assert!(lines(&out)[7].ends_with(".tif"));
    Ok(())
}
