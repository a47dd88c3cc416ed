use anyhow::Result;
use sidesync::logger::NoopLogger;
use sidesync::mapping::PathMapping;
use sidesync::orchestrator::{CancelReason, CancelToken};
use sidesync::progress::{ChunkTick, NoopProgress};
use sidesync::reconcile::{DisabledSuffix, Reconciler};
use sidesync::remote::{FsRemote, RetryPolicy};
use sidesync::sync::{Mirror, SyncOptions, SyncReport};
use sidesync::SyncError;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

const MIB: usize = 1024 * 1024;

fn write_file(path: &Path, size: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    let mut buf = vec![0u8; 1024 * 64];
    let mut remaining = size;
    let mut val: u8 = 0;
    while remaining > 0 {
        for b in buf.iter_mut() {
            *b = val;
            val = val.wrapping_add(7);
        }
        let n = remaining.min(buf.len());
        f.write_all(&buf[..n])?;
        remaining -= n;
    }
    Ok(())
}

fn mirror_once(server: &Path, game: &Path, delete: bool, dry_run: bool) -> Result<SyncReport> {
    let connector = FsRemote::new(server);
    let roots = vec![PathMapping::root(game, "/", "mods", "mods", delete)];
    let options = SyncOptions {
        max_connections: 4,
        dry_run,
        policy: RetryPolicy::immediate(),
    };
    let cancel = CancelToken::new();
    let reconciler = Reconciler::new(MIB as u32).with_variant_rule(DisabledSuffix::default());
    let mirror = Mirror::new(&connector, roots, reconciler, options, &cancel, &NoopLogger);
    Ok(mirror.run(&NoopProgress, &())?)
}

#[test]
fn ten_mib_and_empty_file_are_mirrored() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let game = tempfile::tempdir()?;
    write_file(&srv.path().join("mods/f1.bin"), 10 * MIB)?;
    write_file(&srv.path().join("mods/f2.bin"), 0)?;

    let connector = FsRemote::new(srv.path());
    let roots = vec![PathMapping::root(game.path(), "/", "mods", "mods", true)];
    let options = SyncOptions {
        max_connections: 4,
        dry_run: false,
        policy: RetryPolicy::immediate(),
    };
    let cancel = CancelToken::new();
    let mirror = Mirror::new(&connector, roots, Reconciler::new(MIB as u32), options, &cancel, &NoopLogger);

    let ticked = AtomicU64::new(0);
    let sink = |tick: &ChunkTick<'_>| {
        ticked.fetch_add(tick.bytes, Ordering::Relaxed);
    };
    let report = mirror.run(&sink, &())?;

    assert!(report.is_clean());
    assert_eq!(report.scanned_files, 2);
    assert_eq!(report.scanned_directories, 1);
    assert_eq!(report.planned_bytes, (10 * MIB) as u64);
    let outcome = report.download.as_ref().expect("download phase ran");
    assert_eq!(outcome.completed.len(), 2);
    assert_eq!(outcome.bytes, (10 * MIB) as u64);
    assert_eq!(outcome.workers, 4);
    assert_eq!(ticked.load(Ordering::Relaxed), (10 * MIB) as u64);

    let expected = std::fs::read(srv.path().join("mods/f1.bin"))?;
    let actual = std::fs::read(game.path().join("mods/f1.bin"))?;
    assert!(expected == actual, "mirrored bytes differ");
    assert_eq!(std::fs::metadata(game.path().join("mods/f2.bin"))?.len(), 0);
    Ok(())
}

#[test]
fn stale_files_go_only_where_deletion_is_allowed() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let game = tempfile::tempdir()?;
    write_file(&srv.path().join("mods/a/keep.zipmod"), 4096)?;
    write_file(&game.path().join("mods/a/keep.zipmod"), 4096)?;
    write_file(&game.path().join("mods/a/old.zipmod"), 100)?;

    let report = mirror_once(srv.path(), game.path(), false, false)?;
    assert!(report.deleted.is_empty());
    assert!(game.path().join("mods/a/old.zipmod").exists());

    let report = mirror_once(srv.path(), game.path(), true, false)?;
    assert_eq!(report.deleted, vec![game.path().join("mods/a/old.zipmod")]);
    assert_eq!(report.up_to_date, 1);
    assert!(!game.path().join("mods/a/old.zipmod").exists());
    assert!(game.path().join("mods/a/keep.zipmod").exists());
    Ok(())
}

#[test]
fn second_run_has_nothing_to_do() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let game = tempfile::tempdir()?;
    write_file(&srv.path().join("mods/x.zipmod"), 3 * MIB + 17)?;
    write_file(&srv.path().join("mods/sub/y.zipmod"), 1234)?;
    write_file(&srv.path().join("mods/sub/deeper/z.zipmod"), 0)?;

    let first = mirror_once(srv.path(), game.path(), true, false)?;
    assert_eq!(first.planned_downloads.len(), 3);
    assert_eq!(first.scanned_directories, 3);

    let second = mirror_once(srv.path(), game.path(), true, false)?;
    assert!(second.planned_downloads.is_empty());
    assert!(second.deleted.is_empty());
    assert_eq!(second.up_to_date, 3);
    let outcome = second.download.as_ref().expect("download phase ran");
    assert!(outcome.completed.is_empty());
    assert_eq!(outcome.bytes, 0);
    Ok(())
}

#[test]
fn resized_remote_file_is_fetched_again() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let game = tempfile::tempdir()?;
    write_file(&srv.path().join("mods/x.zipmod"), 2 * MIB)?;
    write_file(&game.path().join("mods/x.zipmod"), 10)?;

    let report = mirror_once(srv.path(), game.path(), true, false)?;
    assert_eq!(report.planned_downloads, vec![game.path().join("mods/x.zipmod")]);
    assert_eq!(report.deleted, vec![game.path().join("mods/x.zipmod")]);
    assert_eq!(
        std::fs::metadata(game.path().join("mods/x.zipmod"))?.len(),
        (2 * MIB) as u64
    );
    Ok(())
}

#[test]
fn disabled_copy_satisfies_its_remote_file() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let game = tempfile::tempdir()?;
    write_file(&srv.path().join("mods/hair.zipmod"), 5000)?;
    write_file(&game.path().join("mods/hair.zipmod.disabled"), 12)?;

    let report = mirror_once(srv.path(), game.path(), true, false)?;
    assert!(report.planned_downloads.is_empty());
    assert!(report.deleted.is_empty());
    assert!(!game.path().join("mods/hair.zipmod").exists());
    Ok(())
}

#[test]
fn dry_run_changes_nothing() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let game = tempfile::tempdir()?;
    write_file(&srv.path().join("mods/new.zipmod"), 2048)?;
    write_file(&game.path().join("mods/stale.zipmod"), 10)?;

    let report = mirror_once(srv.path(), game.path(), true, true)?;
    assert!(report.dry_run);
    assert!(report.download.is_none());
    assert_eq!(report.planned_downloads, vec![game.path().join("mods/new.zipmod")]);
    assert_eq!(report.deleted, vec![game.path().join("mods/stale.zipmod")]);
    assert!(game.path().join("mods/stale.zipmod").exists());
    assert!(!game.path().join("mods/new.zipmod").exists());
    Ok(())
}

#[test]
fn report_serializes_to_json() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let game = tempfile::tempdir()?;
    write_file(&srv.path().join("mods/a.zipmod"), 10)?;

    let report = mirror_once(srv.path(), game.path(), true, false)?;
    let json: serde_json::Value = serde_json::to_value(&report)?;
    assert_eq!(json["scanned_files"], 1);
    assert_eq!(json["download"]["bytes"], 10);
    assert!(json["download"].get("faults").is_none());
    Ok(())
}

#[test]
fn canceled_run_names_every_unfinished_file() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let game = tempfile::tempdir()?;
    write_file(&srv.path().join("mods/a.zipmod"), 4 * MIB)?;
    write_file(&srv.path().join("mods/b.zipmod"), 4 * MIB)?;
    write_file(&game.path().join("mods/stale.zipmod"), 10)?;

    let connector = FsRemote::new(srv.path());
    let roots = vec![PathMapping::root(game.path(), "/", "mods", "mods", true)];
    let options = SyncOptions {
        max_connections: 1,
        dry_run: false,
        policy: RetryPolicy::immediate(),
    };
    let cancel = CancelToken::new();
    let mirror = Mirror::new(&connector, roots, Reconciler::new(MIB as u32), options, &cancel, &NoopLogger);
    let sink = |_: &ChunkTick<'_>| cancel.cancel(CancelReason::User);

    let err = mirror.run(&sink, &()).unwrap_err();
    assert!(err.is_canceled());
    assert!(matches!(err, SyncError::Interrupted { .. }));
    assert_eq!(
        err.incomplete(),
        [game.path().join("mods/a.zipmod"), game.path().join("mods/b.zipmod")]
    );
    assert!(err.missed().is_empty());
    // Deletion ran before the downloads started; the torn file is gone.
    assert!(!game.path().join("mods/stale.zipmod").exists());
    assert!(!game.path().join("mods/a.zipmod").exists());
    assert!(!game.path().join("mods/b.zipmod").exists());
    Ok(())
}
