//! End-to-end filesystem scenarios over temp-file device images.

use std::path::PathBuf;
use std::sync::Arc;

use ledgerfs::{FileSystem, FsError, Geometry};

struct Harness {
    _dir: tempfile::TempDir,
    fs: FileSystem,
    img: PathBuf,
    wal: PathBuf,
}

fn setup(total_blocks: u32) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let img = dir.path().join("disk.img");
    let wal = dir.path().join("disk.wal");
    let fs = FileSystem::new();
    fs.format(&img, &wal, total_blocks, 4096).unwrap();
    fs.mount(&img, &wal).unwrap();
    Harness { _dir: dir, fs, img, wal }
}

#[test]
fn test_format_reports_expected_geometry() {
    let h = setup(256);
    let info = h.fs.filesystem_info().unwrap();
    assert_eq!(info.total_blocks, 256);
    assert_eq!(info.block_size, 4096);
    // Only block 0 is charged on a fresh image; the root directory's data
    // block is allocated lazily on first insert.
    assert_eq!(info.free_blocks, 255);
    assert_eq!(info.total_inodes, 64);
    assert_eq!(info.free_inodes, 62);
}

#[test]
fn test_create_write_read_roundtrip() {
    let h = setup(256);
    h.fs.create_file("/a.txt", 0o644).unwrap();
    h.fs.write_file("/a.txt", b"hello").unwrap();
    assert_eq!(h.fs.read_file("/a.txt").unwrap(), b"hello");
    assert_eq!(h.fs.get_file_size("/a.txt").unwrap(), 5);
    assert!(h.fs.file_exists("/a.txt").unwrap());
    assert!(!h.fs.file_exists("/missing").unwrap());
}

#[test]
fn test_directory_listing_keeps_insertion_order() {
    let h = setup(256);
    h.fs.create_file("/x", 0o644).unwrap();
    h.fs.create_file("/y", 0o644).unwrap();
    h.fs.create_file("/z", 0o644).unwrap();
    assert_eq!(h.fs.list_directory("/").unwrap(), vec!["x", "y", "z"]);
}

#[test]
fn test_nested_directories() {
    let h = setup(256);
    h.fs.create_directory("/a", 0o755).unwrap();
    h.fs.create_directory("/a/b", 0o755).unwrap();
    h.fs.create_file("/a/b/c.txt", 0o644).unwrap();
    h.fs.write_file("/a/b/c.txt", b"deep").unwrap();
    assert_eq!(h.fs.read_file("/a/b/c.txt").unwrap(), b"deep");
    assert!(h.fs.directory_exists("/a/b").unwrap());
    assert!(!h.fs.directory_exists("/a/b/c.txt").unwrap());
    assert_eq!(h.fs.list_directory("/a").unwrap(), vec!["b"]);
}

#[test]
fn test_rename_across_directories_is_atomic() {
    let h = setup(256);
    h.fs.create_directory("/d1", 0o755).unwrap();
    h.fs.create_directory("/d2", 0o755).unwrap();
    h.fs.create_file("/d1/f", 0o644).unwrap();
    let inodes_before = h.fs.filesystem_info().unwrap().free_inodes;

    h.fs.rename("/d1/f", "/d2/f").unwrap();

    assert!(h.fs.list_directory("/d1").unwrap().is_empty());
    assert_eq!(h.fs.list_directory("/d2").unwrap(), vec!["f"]);
    // The move reuses the inode; none were consumed or leaked.
    assert_eq!(h.fs.filesystem_info().unwrap().free_inodes, inodes_before);
}

#[test]
fn test_rename_to_existing_name_fails() {
    let h = setup(256);
    h.fs.create_file("/a", 0o644).unwrap();
    h.fs.create_file("/b", 0o644).unwrap();
    assert!(matches!(
        h.fs.rename("/a", "/b"),
        Err(FsError::AlreadyExists { .. })
    ));
}

#[test]
fn test_rename_back_restores_layout() {
    let h = setup(256);
    h.fs.create_file("/a", 0o644).unwrap();
    h.fs.write_file("/a", b"payload").unwrap();
    let free_before = h.fs.filesystem_info().unwrap();

    h.fs.rename("/a", "/b").unwrap();
    h.fs.rename("/b", "/a").unwrap();

    assert_eq!(h.fs.list_directory("/").unwrap(), vec!["a"]);
    assert_eq!(h.fs.read_file("/a").unwrap(), b"payload");
    let free_after = h.fs.filesystem_info().unwrap();
    assert_eq!(free_after.free_blocks, free_before.free_blocks);
    assert_eq!(free_after.free_inodes, free_before.free_inodes);
}

#[test]
fn test_create_then_delete_restores_counters() {
    let h = setup(256);
    let before = h.fs.filesystem_info().unwrap();

    h.fs.create_file("/tmp.bin", 0o644).unwrap();
    h.fs.write_file("/tmp.bin", &vec![0xA5u8; 3 * 4096 + 17]).unwrap();
    h.fs.delete_file("/tmp.bin").unwrap();

    let after = h.fs.filesystem_info().unwrap();
    assert_eq!(after.free_blocks, before.free_blocks);
    assert_eq!(after.free_inodes, before.free_inodes);
    assert!(!h.fs.file_exists("/tmp.bin").unwrap());
}

#[test]
fn test_delete_nonempty_directory_fails() {
    let h = setup(256);
    h.fs.create_directory("/d", 0o755).unwrap();
    h.fs.create_file("/d/f", 0o644).unwrap();
    assert!(matches!(
        h.fs.delete_directory("/d"),
        Err(FsError::DirectoryNotEmpty { .. })
    ));
    h.fs.delete_file("/d/f").unwrap();
    h.fs.delete_directory("/d").unwrap();
    assert!(!h.fs.directory_exists("/d").unwrap());
}

#[test]
fn test_append_extends_content() {
    let h = setup(256);
    h.fs.create_file("/log", 0o644).unwrap();
    h.fs.write_file("/log", b"hello").unwrap();
    h.fs.append_file("/log", b" world").unwrap();
    assert_eq!(h.fs.read_file("/log").unwrap(), b"hello world");
    assert_eq!(h.fs.get_file_size("/log").unwrap(), 11);
}

#[test]
fn test_overwrite_shrinks_file() {
    let h = setup(256);
    h.fs.create_file("/f", 0o644).unwrap();
    h.fs.write_file("/f", &vec![1u8; 5 * 4096]).unwrap();
    let free_large = h.fs.filesystem_info().unwrap().free_blocks;
    h.fs.write_file("/f", b"small").unwrap();
    assert_eq!(h.fs.read_file("/f").unwrap(), b"small");
    // Shrinking released the extra data blocks.
    assert_eq!(h.fs.filesystem_info().unwrap().free_blocks, free_large + 4);
}

#[test]
fn test_exact_block_write_uses_one_block() {
    let h = setup(256);
    h.fs.create_file("/one", 0o644).unwrap();
    h.fs.write_file("/one", &vec![7u8; 4096]).unwrap();
    let inode = h.fs.stat("/one").unwrap();
    assert_eq!(inode.blocks, 1);
    assert_ne!(inode.direct[0], 0);
    assert_eq!(inode.single_indirect, 0);
}

#[test]
fn test_indirection_boundary() {
    let h = setup(256);
    h.fs.create_file("/big", 0o644).unwrap();
    h.fs.write_file("/big", &vec![0u8; 13 * 4096]).unwrap();
    let inode = h.fs.stat("/big").unwrap();
    // 13 data blocks plus the single indirect block itself.
    assert_eq!(inode.blocks, 14);
    assert_ne!(inode.single_indirect, 0);
    assert_eq!(inode.double_indirect, 0);
    assert_eq!(inode.triple_indirect, 0);
    assert_eq!(h.fs.read_file("/big").unwrap().len(), 13 * 4096);
}

#[test]
fn test_large_write_round_trips() {
    let h = setup(1024);
    let payload: Vec<u8> = (0..40 * 4096 + 123).map(|i| (i % 251) as u8).collect();
    h.fs.create_file("/blob", 0o644).unwrap();
    h.fs.write_file("/blob", &payload).unwrap();
    assert_eq!(h.fs.read_file("/blob").unwrap(), payload);
    h.fs.unmount().unwrap();
    h.fs.mount(&h.img, &h.wal).unwrap();
    assert_eq!(h.fs.read_file("/blob").unwrap(), payload);
}

#[test]
fn test_remount_preserves_superblock_fields() {
    let h = setup(512);
    h.fs.create_file("/keep", 0o644).unwrap();
    h.fs.write_file("/keep", b"keep me").unwrap();
    let before = h.fs.filesystem_info().unwrap();
    let stat_before = h.fs.stat("/keep").unwrap();

    h.fs.unmount().unwrap();
    assert!(!h.fs.is_mounted());
    h.fs.mount(&h.img, &h.wal).unwrap();

    let after = h.fs.filesystem_info().unwrap();
    assert_eq!(after.total_blocks, before.total_blocks);
    assert_eq!(after.free_blocks, before.free_blocks);
    assert_eq!(after.total_inodes, before.total_inodes);
    assert_eq!(after.free_inodes, before.free_inodes);
    assert_eq!(after.block_size, before.block_size);
    assert_eq!(h.fs.read_file("/keep").unwrap(), b"keep me");
    assert_eq!(h.fs.stat("/keep").unwrap().mtime, stat_before.mtime);
}

#[test]
fn test_uncommitted_work_is_lost_on_crash() {
    let h = setup(256);
    let before = h.fs.filesystem_info().unwrap();
    let wal_len = std::fs::metadata(&h.wal).unwrap().len();

    h.fs.create_file("/a", 0o644).unwrap();
    h.fs.create_file("/b", 0o644).unwrap();

    // Crash: the process dies before commit reaches the log. Truncating
    // the log to its pre-transaction length and dropping the instance
    // without an unmount models exactly that.
    drop(h.fs);
    let wal_file = std::fs::OpenOptions::new().write(true).open(&h.wal).unwrap();
    wal_file.set_len(wal_len).unwrap();

    let fs = FileSystem::new();
    fs.mount(&h.img, &h.wal).unwrap();
    assert!(!fs.file_exists("/a").unwrap());
    assert!(!fs.file_exists("/b").unwrap());
    let after = fs.filesystem_info().unwrap();
    assert_eq!(after.free_blocks, before.free_blocks);
    assert_eq!(after.free_inodes, before.free_inodes);
}

#[test]
fn test_committed_work_survives_crash() {
    let h = setup(256);
    h.fs.create_file("/a", 0o644).unwrap();
    h.fs.write_file("/a", b"durable").unwrap();

    // No unmount: the metadata regions on disk are stale and recovery
    // must rebuild everything from the log.
    drop(h.fs);

    let fs = FileSystem::new();
    fs.mount(&h.img, &h.wal).unwrap();
    assert!(fs.file_exists("/a").unwrap());
    assert_eq!(fs.read_file("/a").unwrap(), b"durable");
    fs.check().unwrap();
}

#[test]
fn test_corrupted_superblock_fails_mount() {
    let h = setup(256);
    h.fs.unmount().unwrap();

    // Flip a counter byte without fixing the checksum.
    let mut image = std::fs::read(&h.img).unwrap();
    image[20] ^= 0xFF;
    std::fs::write(&h.img, &image).unwrap();

    let fs = FileSystem::new();
    assert!(matches!(
        fs.mount(&h.img, &h.wal),
        Err(FsError::CorruptedFilesystem { .. })
    ));
}

#[test]
fn test_check_detects_bitmap_corruption_and_repair_fixes_it() {
    let h = setup(256);
    h.fs.create_file("/f", 0o644).unwrap();
    h.fs.write_file("/f", b"some content").unwrap();
    h.fs.check().unwrap();
    h.fs.unmount().unwrap();

    // Mark the file's data block free in the on-disk bitmap.
    let data_block = {
        let fs = FileSystem::new();
        fs.mount(&h.img, &h.wal).unwrap();
        let block = fs.stat("/f").unwrap().direct[0];
        fs.unmount().unwrap();
        block
    };
    let geo = Geometry { block_size: 4096, total_blocks: 256, inode_count: 64 };
    let mut image = std::fs::read(&h.img).unwrap();
    let bit = geo.block_bitmap_offset() as usize + data_block as usize / 8;
    image[bit] |= 1 << (data_block % 8);
    std::fs::write(&h.img, &image).unwrap();

    // Mount with a fresh log: replaying the full history would repair the
    // bitmap on its own, and this test is about check() and repair().
    let lost_wal = h.wal.with_extension("lost");
    let fs = FileSystem::new();
    fs.mount(&h.img, &lost_wal).unwrap();
    assert!(fs.check().is_err());
    // Corruption latches: writes are refused until repair.
    assert!(matches!(
        fs.write_file("/f", b"nope"),
        Err(FsError::CorruptedFilesystem { .. })
    ));
    // Reads still work on the degraded filesystem.
    assert_eq!(fs.read_file("/f").unwrap(), b"some content");

    fs.repair().unwrap();
    fs.check().unwrap();
    fs.write_file("/f", b"writable again").unwrap();
    assert_eq!(fs.read_file("/f").unwrap(), b"writable again");
}

#[test]
fn test_permissions_and_ownership() {
    let h = setup(256);
    h.fs.create_file("/f", 0o644).unwrap();
    assert_eq!(h.fs.stat("/f").unwrap().permissions_string(), "-rw-r--r--");

    h.fs.set_permissions("/f", 0o600).unwrap();
    let inode = h.fs.stat("/f").unwrap();
    assert_eq!(inode.permissions_string(), "-rw-------");
    assert!(inode.is_file());

    h.fs.set_ownership("/f", 1000, 100).unwrap();
    let inode = h.fs.stat("/f").unwrap();
    assert_eq!(inode.uid, 1000);
    assert_eq!(inode.gid, 100);
}

#[test]
fn test_transaction_surface_semantics() {
    let h = setup(256);
    let tx = h.fs.begin_transaction().unwrap();
    h.fs.commit_transaction(tx).unwrap();
    // A second commit is a no-op; rollback after commit is unknown.
    h.fs.commit_transaction(tx).unwrap();
    assert!(matches!(
        h.fs.rollback_transaction(tx),
        Err(FsError::TransactionNotFound { .. })
    ));

    let tx = h.fs.begin_transaction().unwrap();
    h.fs.rollback_transaction(tx).unwrap();
    assert!(matches!(
        h.fs.commit_transaction(tx),
        Err(FsError::TransactionNotFound { .. })
    ));
}

#[test]
fn test_filesystem_stats_counts_namespace() {
    let h = setup(256);
    h.fs.create_directory("/docs", 0o755).unwrap();
    h.fs.create_file("/docs/a", 0o644).unwrap();
    h.fs.create_file("/docs/b", 0o644).unwrap();
    h.fs.write_file("/docs/a", b"12345").unwrap();
    h.fs.write_file("/docs/b", b"678").unwrap();

    let stats = h.fs.filesystem_stats().unwrap();
    assert_eq!(stats.total_files, 2);
    // The root directory plus /docs.
    assert_eq!(stats.total_directories, 2);
    assert_eq!(stats.total_data_size, 8);
    assert_eq!(stats.active_transactions, 0);
}

#[test]
fn test_no_space_is_surfaced() {
    let h = setup(16);
    h.fs.create_file("/big", 0o644).unwrap();
    // 16 blocks minus the superblock leaves 15; ask for far more.
    let err = h.fs.write_file("/big", &vec![1u8; 64 * 4096]).unwrap_err();
    assert!(matches!(err, FsError::NoSpace { .. }));
    // The failed write released everything it had taken.
    let info = h.fs.filesystem_info().unwrap();
    h.fs.check().unwrap();
    assert_eq!(info.free_blocks, 14); // block 0 and the root dir block
}

#[test]
fn test_path_normalization() {
    let h = setup(256);
    h.fs.create_directory("/a", 0o755).unwrap();
    h.fs.create_file("/a/f", 0o644).unwrap();
    h.fs.write_file("//a/./f", b"via messy path").unwrap();
    assert_eq!(h.fs.read_file("/a/../a/f").unwrap(), b"via messy path");
    assert!(matches!(
        h.fs.read_file("relative"),
        Err(FsError::InvalidPath { .. })
    ));
}

#[test]
fn test_operations_require_mount() {
    let fs = FileSystem::new();
    assert!(matches!(fs.read_file("/x"), Err(FsError::NotMounted)));
    assert!(matches!(fs.create_file("/x", 0o644), Err(FsError::NotMounted)));
    assert!(matches!(fs.unmount(), Err(FsError::NotMounted)));
}

#[test]
fn test_concurrent_creates_in_one_directory() {
    let h = setup(1024);
    let fs = Arc::new(h.fs);
    let mut handles = Vec::new();
    for t in 0..8 {
        let fs = Arc::clone(&fs);
        handles.push(std::thread::spawn(move || {
            for i in 0..8 {
                let path = format!("/t{t}_{i}");
                fs.create_file(&path, 0o644).unwrap();
                fs.write_file(&path, path.as_bytes()).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    let names = fs.list_directory("/").unwrap();
    assert_eq!(names.len(), 64);
    for t in 0..8 {
        for i in 0..8 {
            let path = format!("/t{t}_{i}");
            assert_eq!(fs.read_file(&path).unwrap(), path.as_bytes());
        }
    }
    fs.check().unwrap();
}

#[test]
fn test_concurrent_readers_and_writer() {
    let h = setup(1024);
    let fs = Arc::new(h.fs);
    fs.create_file("/shared", 0o644).unwrap();
    fs.write_file("/shared", &vec![b'a'; 4096]).unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let fs = Arc::clone(&fs);
        handles.push(std::thread::spawn(move || {
            for _ in 0..16 {
                let content = fs.read_file("/shared").unwrap();
                // A reader sees one of the writer's full states, never a mix.
                assert!(content.iter().all(|b| *b == content[0]));
            }
        }));
    }
    {
        let fs = Arc::clone(&fs);
        handles.push(std::thread::spawn(move || {
            for i in 0..16u8 {
                fs.write_file("/shared", &vec![b'a' + (i % 4); 4096]).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    fs.check().unwrap();
}
