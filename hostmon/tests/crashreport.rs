use hostmon::crashreport::{CrashReporter, WORK_DIR};
use std::fs::{self, File};
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn reporter(state_dir: &Path) -> CrashReporter {
    let reporter = CrashReporter::new();
    reporter.set_options(true, state_dir, None);

    reporter
}

fn seed_panic_stderr(state_dir: &Path) {
    let workdir = state_dir.join(WORK_DIR);
    fs::create_dir_all(&workdir).unwrap();
    fs::write(
        workdir.join("stderr.old.log"),
        "thread 'main' panicked at src/agent.rs:42:13:\nindex out of bounds\n",
    )
    .unwrap();
}

fn archive_entries(path: &Path) -> Vec<String> {
    let mut zip = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();

    (0..zip.len())
        .map(|i| zip.by_index(i).unwrap().name().to_owned())
        .collect()
}

#[tokio::test]
async fn a_panicking_stderr_produces_a_dated_archive() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = reporter(dir.path());

    seed_panic_stderr(dir.path());

    let archive = reporter.bundle_crash_report(5).await.expect("archive");
    let name = archive.file_name().unwrap().to_str().unwrap();

    assert!(name.starts_with("crashreport_"));
    assert!(name.ends_with(".zip"));
    assert!(archive_entries(&archive).contains(&"stderr.log".to_owned()));

    // The in-progress flag must be gone after a successful bundle.
    assert!(!dir.path().join(WORK_DIR).join("crashreport_in_progress").exists());
}

#[tokio::test]
async fn a_clean_stderr_produces_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = reporter(dir.path());

    let workdir = dir.path().join(WORK_DIR);
    fs::create_dir_all(&workdir).unwrap();
    fs::write(workdir.join("stderr.old.log"), "started\nall quiet\n").unwrap();

    assert!(reporter.bundle_crash_report(5).await.is_none());
}

#[tokio::test]
async fn bundle_collects_old_stderr_retained_and_fresh_diagnostics() {
    let dir = tempfile::tempdir().unwrap();

    let workdir = dir.path().join(WORK_DIR);
    seed_panic_stderr(dir.path());
    fs::create_dir_all(workdir.join("crash_diagnostic")).unwrap();
    fs::write(workdir.join("crash_diagnostic/file.txt"), "retained").unwrap();

    let reporter = CrashReporter::new();
    reporter.set_options(
        true,
        dir.path(),
        Some(Arc::new(|dir: &Path| {
            fs::write(dir.join("file.log"), "fresh")?;

            Ok(())
        })),
    );

    let archive = reporter.bundle_crash_report(2).await.expect("archive");
    let entries = archive_entries(&archive);

    assert!(entries.contains(&"stderr.log".to_owned()));
    assert!(entries.contains(&"crash_diagnostic/file.txt".to_owned()));
    assert!(entries.contains(&"diagnostic/file.log".to_owned()));

    // Entry content survives the round trip.
    let mut zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
    let mut content = String::new();
    zip.by_name("crash_diagnostic/file.txt")
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, "retained");

    // The retained diagnostic has been consumed.
    assert!(!workdir.join("crash_diagnostic").exists());

    // The next run rotates a clean stderr over the old one: no new archive.
    fs::write(workdir.join("stderr.old.log"), "clean run\n").unwrap();
    assert!(reporter.bundle_crash_report(2).await.is_none());
}

#[tokio::test]
async fn leftover_diagnostic_alone_triggers_a_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = reporter(dir.path());

    let workdir = dir.path().join(WORK_DIR);
    fs::create_dir_all(workdir.join("crash_diagnostic")).unwrap();
    fs::write(workdir.join("crash_diagnostic/core.txt"), "dump").unwrap();

    let archive = reporter.bundle_crash_report(5).await.expect("archive");
    assert!(archive_entries(&archive).contains(&"crash_diagnostic/core.txt".to_owned()));
}

#[tokio::test]
async fn a_panicking_diagnostic_callback_is_recovered() {
    let dir = tempfile::tempdir().unwrap();
    seed_panic_stderr(dir.path());

    let reporter = CrashReporter::new();
    reporter.set_options(
        true,
        dir.path(),
        Some(Arc::new(|_: &Path| panic!("diagnostic exploded"))),
    );

    // Best effort: the archive still exists, without diagnostic entries.
    let archive = reporter.bundle_crash_report(5).await.expect("archive");
    let entries = archive_entries(&archive);

    assert!(entries.contains(&"stderr.log".to_owned()));
    assert!(!entries.iter().any(|name| name.starts_with("diagnostic/")));
}

#[tokio::test]
async fn disabled_reporter_does_nothing() {
    let dir = tempfile::tempdir().unwrap();
    seed_panic_stderr(dir.path());

    let reporter = CrashReporter::new();
    reporter.set_options(false, dir.path(), None);

    assert!(reporter.bundle_crash_report(5).await.is_none());
}

fn seed_archives(state_dir: &Path, stamps: &[&str]) -> Vec<PathBuf> {
    stamps
        .iter()
        .map(|stamp| {
            let path = state_dir.join(format!("crashreport_{stamp}.zip"));
            fs::write(&path, b"zip").unwrap();

            path
        })
        .collect()
}

#[test]
fn purge_keeps_the_most_recent_archives() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = reporter(dir.path());

    let archives = seed_archives(
        dir.path(),
        &[
            "20260101-000000",
            "20260102-000000",
            "20260103-000000",
            "20260104-000000",
            "20260105-000000",
        ],
    );

    reporter.purge(2, &[]);

    assert!(!archives[0].exists());
    assert!(!archives[1].exists());
    assert!(!archives[2].exists());
    assert!(archives[3].exists());
    assert!(archives[4].exists());
}

#[test]
fn purge_never_touches_preserved_archives() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = reporter(dir.path());

    let archives = seed_archives(
        dir.path(),
        &["20260101-000000", "20260102-000000", "20260103-000000"],
    );

    reporter.purge(1, &[archives[0].clone()]);

    assert!(archives[0].exists(), "preserved regardless of age");
    assert!(!archives[1].exists());
    assert!(archives[2].exists());
}

#[test]
fn purge_ignores_unrelated_files() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = reporter(dir.path());

    let unrelated = dir.path().join("state.json");
    fs::write(&unrelated, b"{}").unwrap();

    seed_archives(dir.path(), &["20260101-000000"]);
    reporter.purge(0, &[]);

    assert!(unrelated.exists());
}
