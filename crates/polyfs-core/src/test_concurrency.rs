// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;
use std::thread;

use crate::{ErrorKind, Features, FsConfig, MemFs};

const USERS: usize = 100;

fn create_test_fs() -> MemFs {
    let fs = MemFs::new(FsConfig::default().with_features(Features::all() - Features::READ_ONLY - Features::REAL_FS))
        .expect("create filesystem");
    fs.mkdir("/a", 0o777).expect("mkdir /a");
    fs.chmod("/a", 0o777).expect("chmod /a");
    fs
}

fn add_users(fs: &MemFs, count: usize) -> Vec<String> {
    let idm = fs.idm();
    idm.add_group("users").expect("add_group");
    (0..count)
        .map(|i| {
            let name = format!("user{i}");
            idm.add_user(&name, "users").expect("add_user");
            name
        })
        .collect()
}

#[test]
fn test_concurrent_directory_creation() {
    let fs = create_test_fs();
    let names = add_users(&fs, USERS);
    let barrier = Barrier::new(USERS);

    thread::scope(|s| {
        for (i, name) in names.iter().enumerate() {
            let view = fs.with_user(name).expect("with_user");
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                let dir = format!("/a/user_{i:08}");
                view.mkdir(&dir, 0o755).expect("mkdir");
                let owner = view.user().name().to_string();
                view.write_file(&format!("{dir}/owner"), owner.as_bytes(), 0o644)
                    .expect("write_file");
            });
        }
    });

    let entries = fs.read_dir("/a").expect("read_dir");
    assert_eq!(entries.len(), USERS);
    let distinct: HashSet<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(distinct.len(), USERS);
    for i in 0..USERS {
        let dir = format!("/a/user_{i:08}");
        assert!(distinct.contains(&dir[3..]));
        let info = fs.stat(&dir).expect("stat");
        assert_eq!(info.sys().uid, fs.idm().lookup_user(&format!("user{i}")).expect("lookup").uid());
        assert_eq!(fs.read_file(&format!("{dir}/owner")).expect("read_file"), format!("user{i}").as_bytes());
    }
}

#[test]
fn test_racing_on_the_same_name() {
    let fs = create_test_fs();
    let threads = 32;
    let barrier = Barrier::new(threads);
    let created = AtomicUsize::new(0);
    let exists = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..threads {
            s.spawn(|| {
                barrier.wait();
                match fs.mkdir("/a/contested", 0o755) {
                    Ok(()) => created.fetch_add(1, Ordering::SeqCst),
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => exists.fetch_add(1, Ordering::SeqCst),
                    Err(e) => panic!("unexpected error: {e}"),
                };
            });
        }
    });

    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(exists.load(Ordering::SeqCst), threads - 1);
    assert_eq!(fs.read_dir("/a").expect("read_dir").len(), 1);
}

#[test]
fn test_cross_directory_renames_do_not_deadlock() {
    let fs = create_test_fs();
    fs.mkdir("/a/left", 0o777).expect("mkdir");
    fs.mkdir("/a/right", 0o777).expect("mkdir");
    let per_side = 50;
    for i in 0..per_side {
        fs.write_file(&format!("/a/left/l{i}"), b"l", 0o644).expect("write_file");
        fs.write_file(&format!("/a/right/r{i}"), b"r", 0o644).expect("write_file");
    }

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..per_side {
                fs.rename(&format!("/a/left/l{i}"), &format!("/a/right/l{i}")).expect("rename left");
            }
        });
        s.spawn(|| {
            for i in 0..per_side {
                fs.rename(&format!("/a/right/r{i}"), &format!("/a/left/r{i}")).expect("rename right");
            }
        });
    });

    let left = fs.read_dir("/a/left").expect("read_dir");
    let right = fs.read_dir("/a/right").expect("read_dir");
    assert_eq!(left.len(), per_side);
    assert_eq!(right.len(), per_side);
    assert!(left.iter().all(|e| e.name.starts_with('r')));
    assert!(right.iter().all(|e| e.name.starts_with('l')));
}

#[test]
fn test_concurrent_handles_on_distinct_files() {
    let fs = create_test_fs();
    let workers = 16;
    let chunk = [7u8; 512];

    thread::scope(|s| {
        for w in 0..workers {
            let fs = &fs;
            s.spawn(move || {
                let path = format!("/a/w{w}");
                let h = fs.create(&path).expect("create");
                for _ in 0..8 {
                    fs.write(h, &chunk).expect("write");
                }
                fs.close(h).expect("close");
            });
        }
    });

    for w in 0..workers {
        assert_eq!(fs.stat(&format!("/a/w{w}")).expect("stat").size(), 8 * 512);
    }
}
