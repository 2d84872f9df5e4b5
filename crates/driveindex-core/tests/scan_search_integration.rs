//! End-to-end tests: scan real directory trees into a catalog and search it

use driveindex_core::{
    DriveHint, EntryKind, Error, GenerationStatus, IndexConfig, IndexStore, MatchMode, MatchTier,
    ScanReconciler, SearchEngine, SearchQuery,
};
use std::path::Path;
use std::sync::{Arc, Barrier};
use tempfile::TempDir;

fn backup_drive(root: &Path) {
    std::fs::create_dir_all(root.join("docs")).unwrap();
    std::fs::write(root.join("docs/report.pdf"), vec![0u8; 1024]).unwrap();
    std::fs::write(root.join("docs/notes.txt"), b"0123456789").unwrap();
}

fn backup_hint() -> DriveHint {
    DriveHint::with_serial("Backup-2023", "7C1E-92AB")
}

fn catalog(temp_dir: &TempDir) -> (IndexStore, IndexConfig) {
    let config = IndexConfig::with_catalog(temp_dir.path().join("catalog.db"));
    let store = IndexStore::open_with_config(&config).unwrap();
    (store, config)
}

#[test]
fn test_first_scan_then_prefix_search() {
    let mount = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    backup_drive(mount.path());
    let (store, config) = catalog(&home);

    let report = ScanReconciler::new(&store, &config)
        .scan(mount.path(), &backup_hint())
        .unwrap();
    assert_eq!(report.added, 3);
    assert_eq!(report.removed, 0);
    assert_eq!(report.modified, 0);
    assert!(report.errors.is_empty());

    let hits = SearchEngine::new(&store, &config)
        .search(&SearchQuery::new("report", MatchMode::Prefix))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].drive_label, "Backup-2023");
    assert_eq!(hits[0].path, "docs/report.pdf");
    assert_eq!(hits[0].kind, EntryKind::File);
    assert_eq!(hits[0].size, 1024);
}

#[test]
fn test_deleted_file_disappears_after_rescan() {
    let mount = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    backup_drive(mount.path());
    let (store, config) = catalog(&home);
    let reconciler = ScanReconciler::new(&store, &config);

    reconciler.scan(mount.path(), &backup_hint()).unwrap();
    std::fs::remove_file(mount.path().join("docs/notes.txt")).unwrap();
    let report = reconciler.scan(mount.path(), &backup_hint()).unwrap();

    assert_eq!(report.added, 0);
    assert_eq!(report.removed, 1);
    assert_eq!(report.modified, 0);

    let hits = SearchEngine::new(&store, &config)
        .search(&SearchQuery::new("notes", MatchMode::Substring))
        .unwrap();
    assert!(hits.is_empty());
}

#[test]
fn test_unchanged_rescan_reports_nothing() {
    let mount = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    backup_drive(mount.path());
    let (store, config) = catalog(&home);
    let reconciler = ScanReconciler::new(&store, &config);

    let first = reconciler.scan(mount.path(), &backup_hint()).unwrap();
    let before: Vec<_> = store
        .get_current_entries(first.drive.id, None)
        .unwrap()
        .into_iter()
        .map(|e| e.entry)
        .collect();

    let second = reconciler.scan(mount.path(), &backup_hint()).unwrap();
    assert!(!second.has_changes());
    assert_eq!(second.unchanged, 3);
    assert_eq!(second.generation.number, first.generation.number + 1);

    let after: Vec<_> = store
        .get_current_entries(second.drive.id, None)
        .unwrap()
        .into_iter()
        .map(|e| e.entry)
        .collect();
    assert_eq!(before, after);
}

#[test]
fn test_exactly_one_current_generation() {
    let mount = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    backup_drive(mount.path());
    let (store, config) = catalog(&home);
    let reconciler = ScanReconciler::new(&store, &config);

    let mut drive_id = None;
    for _ in 0..3 {
        drive_id = Some(reconciler.scan(mount.path(), &backup_hint()).unwrap().drive.id);
    }

    let generations = store.list_generations(drive_id.unwrap()).unwrap();
    let committed = generations
        .iter()
        .filter(|g| g.status == GenerationStatus::Committed)
        .count();
    assert_eq!(committed, 1);
}

#[test]
fn test_exact_search_is_case_insensitive_and_ranked_first() {
    let mount = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    backup_drive(mount.path());
    std::fs::write(mount.path().join("old-report.pdf"), b"x").unwrap();
    let (store, config) = catalog(&home);

    ScanReconciler::new(&store, &config)
        .scan(mount.path(), &backup_hint())
        .unwrap();
    let engine = SearchEngine::new(&store, &config);

    let exact = engine
        .search(&SearchQuery::new("REPORT.PDF", MatchMode::Exact))
        .unwrap();
    assert_eq!(exact.len(), 1);
    assert_eq!(exact[0].path, "docs/report.pdf");

    let all = engine
        .search(&SearchQuery::new("Report.pdf", MatchMode::Substring))
        .unwrap();
    let ranked: Vec<(&str, MatchTier)> = all.iter().map(|h| (h.path.as_str(), h.tier)).collect();
    assert_eq!(
        ranked,
        vec![
            ("docs/report.pdf", MatchTier::Exact),
            ("old-report.pdf", MatchTier::Substring),
        ]
    );
}

#[test]
fn test_same_drive_at_new_mount_point() {
    let first_mount = TempDir::new().unwrap();
    let second_mount = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    backup_drive(first_mount.path());
    backup_drive(second_mount.path());
    let (store, config) = catalog(&home);
    let reconciler = ScanReconciler::new(&store, &config);

    let first = reconciler.scan(first_mount.path(), &backup_hint()).unwrap();
    let second = reconciler.scan(second_mount.path(), &backup_hint()).unwrap();

    assert_eq!(first.drive.id, second.drive.id);
    assert_eq!(store.count_drives().unwrap(), 1);
    assert_eq!(second.added, 0);
}

#[test]
fn test_disconnected_drive_stays_searchable() {
    let home = TempDir::new().unwrap();
    let (store, config) = catalog(&home);
    let reconciler = ScanReconciler::new(&store, &config);

    {
        let photos = TempDir::new().unwrap();
        std::fs::create_dir_all(photos.path().join("2019/italy")).unwrap();
        std::fs::write(photos.path().join("2019/italy/venice.jpg"), b"jpg").unwrap();
        reconciler
            .scan(photos.path(), &DriveHint::with_alias("PHOTOS", "photos-hdd"))
            .unwrap();
        // Dropping the TempDir "unplugs" the drive
    }

    let work = TempDir::new().unwrap();
    backup_drive(work.path());
    reconciler.scan(work.path(), &backup_hint()).unwrap();

    let hits = SearchEngine::new(&store, &config)
        .search(&SearchQuery::new("venice", MatchMode::Prefix))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].drive_label, "PHOTOS");
    assert_eq!(hits[0].path, "2019/italy/venice.jpg");
}

#[test]
fn test_catalog_is_portable() {
    let mount = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let elsewhere = TempDir::new().unwrap();
    backup_drive(mount.path());

    {
        let (store, config) = catalog(&home);
        ScanReconciler::new(&store, &config)
            .scan(mount.path(), &backup_hint())
            .unwrap();
    }

    // Copying only the main file is enough once the WAL has been checkpointed on close
    let moved = elsewhere.path().join("copied.db");
    std::fs::copy(home.path().join("catalog.db"), &moved).unwrap();

    let config = IndexConfig::with_catalog(&moved);
    let store = IndexStore::open_with_config(&config).unwrap();
    let hits = SearchEngine::new(&store, &config)
        .search(&SearchQuery::new("notes.txt", MatchMode::Exact))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, "docs/notes.txt");
}

#[test]
fn test_scan_blocked_while_same_drive_scanning() {
    let mount = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    backup_drive(mount.path());
    let (store, config) = catalog(&home);

    // First scan is mid-flight: its generation is open but not committed
    let drive = driveindex_core::DriveRegistry::new(&store)
        .resolve(&backup_hint())
        .unwrap();
    let running = store.begin_generation(&drive).unwrap();

    let err = ScanReconciler::new(&store, &config)
        .scan(mount.path(), &backup_hint())
        .unwrap_err();
    assert!(matches!(err, Error::ScanInProgress { .. }));

    let walked: Vec<_> = driveindex_core::TreeWalker::new(mount.path(), &config.walk_options())
        .map(|r| r.unwrap())
        .collect();
    store.put_entries(&running, &walked).unwrap();
    let committed = store.commit_generation(&running).unwrap();
    assert_eq!(committed.status, GenerationStatus::Committed);
    assert_eq!(store.get_current_entries(drive.id, None).unwrap().len(), 3);
}

#[test]
fn test_concurrent_scans_of_same_drive_never_race() {
    let mount = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    backup_drive(mount.path());
    let (store, config) = catalog(&home);
    let store = Arc::new(store);
    let config = Arc::new(config);
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let store = Arc::clone(&store);
            let config = Arc::clone(&config);
            let barrier = Arc::clone(&barrier);
            let root = mount.path().to_path_buf();
            std::thread::spawn(move || {
                barrier.wait();
                ScanReconciler::new(&store, &config).scan(&root, &backup_hint())
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(results.iter().any(|r| r.is_ok()));
    for result in &results {
        if let Err(err) = result {
            assert!(matches!(err, Error::ScanInProgress { .. }), "{}", err);
        }
    }

    let drive_id = results.iter().find_map(|r| r.as_ref().ok()).unwrap().drive.id;
    let committed = store
        .list_generations(drive_id)
        .unwrap()
        .into_iter()
        .filter(|g| g.status == GenerationStatus::Committed)
        .count();
    assert_eq!(committed, 1);
    assert_eq!(store.get_current_entries(drive_id, None).unwrap().len(), 3);
}

#[test]
fn test_ambiguous_drive_is_not_scanned() {
    let mount = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    backup_drive(mount.path());
    let (store, config) = catalog(&home);

    let hint = DriveHint {
        label: "NO NAME".to_string(),
        ..Default::default()
    };
    let err = ScanReconciler::new(&store, &config)
        .scan(mount.path(), &hint)
        .unwrap_err();
    assert!(matches!(err, Error::AmbiguousDrive { .. }));
    assert_eq!(store.count_drives().unwrap(), 0);
}

#[test]
fn test_default_ignores_apply_to_scans() {
    let mount = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    backup_drive(mount.path());
    std::fs::write(mount.path().join(".DS_Store"), b"junk").unwrap();
    std::fs::write(mount.path().join("docs/.DS_Store"), b"junk").unwrap();
    std::fs::create_dir_all(mount.path().join(".fseventsd")).unwrap();
    std::fs::write(mount.path().join(".fseventsd/0000"), b"log").unwrap();
    let (store, config) = catalog(&home);

    let report = ScanReconciler::new(&store, &config)
        .scan(mount.path(), &backup_hint())
        .unwrap();
    assert_eq!(report.added, 3);
}

#[cfg(unix)]
#[test]
fn test_unreadable_mount_keeps_last_snapshot() {
    use std::os::unix::fs::PermissionsExt;

    let mount = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    backup_drive(mount.path());
    let (store, config) = catalog(&home);
    let reconciler = ScanReconciler::new(&store, &config);
    let first = reconciler.scan(mount.path(), &backup_hint()).unwrap();

    std::fs::set_permissions(mount.path(), std::fs::Permissions::from_mode(0o000)).unwrap();
    if std::fs::read_dir(mount.path()).is_ok() {
        // Permission bits do not bind this user
        std::fs::set_permissions(mount.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        return;
    }
    let result = reconciler.scan(mount.path(), &backup_hint());
    std::fs::set_permissions(mount.path(), std::fs::Permissions::from_mode(0o755)).unwrap();

    let err = result.unwrap_err();
    assert!(matches!(err, Error::RootUnreadable { .. }), "{}", err);
    let current = store.current_generation(first.drive.id).unwrap().unwrap();
    assert_eq!(current.id, first.generation.id);
    let hits = SearchEngine::new(&store, &config)
        .search(&SearchQuery::new("report", MatchMode::Prefix))
        .unwrap();
    assert_eq!(hits.len(), 1);
}

#[cfg(target_os = "linux")]
#[test]
fn test_non_utf8_names_are_skipped_visibly() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let mount = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    std::fs::write(mount.path().join("clip.mov"), b"mov").unwrap();
    std::fs::write(mount.path().join(OsStr::from_bytes(b"clip\xff.mov")), b"a").unwrap();
    std::fs::write(mount.path().join(OsStr::from_bytes(b"clip\xfe.mov")), b"b").unwrap();
    let (store, config) = catalog(&home);

    let report = ScanReconciler::new(&store, &config)
        .scan(mount.path(), &backup_hint())
        .unwrap();

    assert_eq!(report.added, 1);
    assert_eq!(report.entries_indexed, 1);
    assert_eq!(report.drive.entry_count, 1);
    assert_eq!(report.errors.len(), 2);
    assert!(report.errors.iter().all(|e| e.cause.contains("UTF-8")));
}

#[test]
fn test_decomposed_name_found_by_composed_query() {
    let mount = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    std::fs::write(mount.path().join("cafe\u{301}.txt"), b"menu").unwrap();
    let (store, config) = catalog(&home);

    ScanReconciler::new(&store, &config)
        .scan(mount.path(), &backup_hint())
        .unwrap();

    let hits = SearchEngine::new(&store, &config)
        .search(&SearchQuery::new("café", MatchMode::Prefix))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, "cafe\u{301}.txt");
}
