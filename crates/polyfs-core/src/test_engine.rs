// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::sync::Arc;

use crate::identity::MockIdentityMgr;
use crate::{ErrorKind, Features, FsConfig, FsError, Group, MemFs, OsType, User};

fn create_test_fs() -> MemFs {
    MemFs::new(FsConfig::default()).expect("create filesystem")
}

fn ino(fs: &MemFs, path: &str) -> u64 {
    fs.stat(path).expect("stat").ino()
}

#[test]
fn test_path_round_trip() {
    let fs = create_test_fs();
    fs.mkdir_all("/a/b", 0o755).expect("mkdir_all");
    fs.write_file("/a/b/f", b"x", 0o644).expect("write_file");
    fs.symlink("/a/b", "/lnk").expect("symlink");

    let os = fs.os_type();
    for path in ["/a", "/a/b", "/a/b/f", "/a/./b/f", "/a/b/../b/f", "a/b/f", "/lnk/f"] {
        let rebuilt = os.join(&[os.dir(path), os.base(path)]);
        assert_eq!(ino(&fs, path), ino(&fs, &rebuilt), "{path} vs {rebuilt}");
    }
}

#[test]
fn test_hard_link_aliasing() {
    let fs = create_test_fs();
    let baseline = fs.node_count();

    fs.write_file("/f", b"hello", 0o644).expect("write_file");
    fs.link("/f", "/g").expect("link");
    assert_eq!(fs.node_count(), baseline + 1);

    for path in ["/f", "/g"] {
        assert_eq!(fs.stat(path).expect("stat").sys().nlink, 2);
        assert_eq!(fs.read_file(path).expect("read_file"), b"hello");
    }

    fs.unlink("/f").expect("unlink /f");
    assert_eq!(fs.read_file("/g").expect("read_file"), b"hello");
    assert_eq!(fs.stat("/g").expect("stat").sys().nlink, 1);
    assert_eq!(fs.stat("/f").unwrap_err().kind(), ErrorKind::NoSuchFileOrDir);

    fs.unlink("/g").expect("unlink /g");
    assert_eq!(fs.node_count(), baseline);
}

#[test]
fn test_hard_link_writes_are_shared() {
    let fs = create_test_fs();
    fs.write_file("/f", b"before", 0o644).expect("write_file");
    fs.link("/f", "/g").expect("link");
    fs.write_file("/g", b"after", 0o644).expect("write_file");
    assert_eq!(fs.read_file("/f").expect("read_file"), b"after");
    assert!(fs.same_file(&fs.stat("/f").expect("stat"), &fs.stat("/g").expect("stat")));
}

#[test]
fn test_symlink_loop() {
    let fs = create_test_fs();
    fs.symlink("/l2", "/l2").expect("symlink");

    let err = fs.open("/l2").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TooManySymlinks);
    assert_eq!(err.to_string(), "open /l2: too many levels of symbolic links");
    assert!(fs.lstat("/l2").expect("lstat").mode().is_symlink());
    assert_eq!(fs.read_link("/l2").expect("read_link"), "/l2");
}

#[test]
fn test_mutual_symlink_loop() {
    let fs = create_test_fs();
    fs.symlink("/b", "/a").expect("symlink a");
    fs.symlink("/a", "/b").expect("symlink b");
    assert_eq!(fs.stat("/a/x").unwrap_err().kind(), ErrorKind::TooManySymlinks);
}

#[test]
fn test_chroot_confinement() {
    let fs = create_test_fs();
    fs.mkdir_all("/etc", 0o755).expect("mkdir_all");
    fs.write_file("/etc/passwd", b"host", 0o644).expect("write_file");
    fs.mkdir_all("/jail/home", 0o755).expect("mkdir_all");

    let jailed = fs.with_user("root").expect("view");
    jailed.chroot("/jail").expect("chroot");
    jailed.chdir("/home").expect("chdir");

    for path in ["../../etc/passwd", "/../../etc/passwd", "/home/../../../etc/passwd"] {
        assert_eq!(jailed.stat(path).unwrap_err().kind(), ErrorKind::NoSuchFileOrDir, "{path}");
    }

    fs.mkdir("/jail/etc", 0o755).expect("mkdir");
    fs.write_file("/jail/etc/passwd", b"jail", 0o644).expect("write_file");
    assert_eq!(jailed.read_file("../../etc/passwd").expect("read_file"), b"jail");
    assert_eq!(jailed.stat("/etc/passwd").expect("stat").ino(), ino(&fs, "/jail/etc/passwd"));

    // Absolute symlink targets are resolved from the view root.
    fs.symlink("/etc/passwd", "/jail/home/p").expect("symlink");
    assert_eq!(jailed.read_file("/home/p").expect("read_file"), b"jail");
    assert_eq!(fs.read_file("/jail/home/p").expect("read_file"), b"host");
    assert_eq!(jailed.getwd().expect("getwd"), "/home");
}

#[test]
fn test_chroot_requires_admin_and_feature() {
    let fs = create_test_fs();
    fs.mkdir("/jail", 0o755).expect("mkdir");
    let idm = fs.idm();
    idm.add_group("users").expect("add_group");
    idm.add_user("mallory", "users").expect("add_user");
    let mallory = fs.with_user("mallory").expect("view");
    assert_eq!(mallory.chroot("/jail").unwrap_err().kind(), ErrorKind::OperationNotPermitted);

    let plain = MemFs::new(FsConfig::default().with_features(Features::IDENTITY_MGR)).expect("create filesystem");
    plain.mkdir("/jail", 0o755).expect("mkdir");
    assert_eq!(plain.chroot("/jail").unwrap_err().kind(), ErrorKind::UnsupportedFeature);
}

#[test]
fn test_non_empty_directory_removal() {
    let fs = create_test_fs();
    fs.mkdir("/d", 0o755).expect("mkdir");
    fs.write_file("/d/x", b"", 0o644).expect("write_file");

    let err = fs.rmdir("/d").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DirectoryNotEmpty);
    assert_eq!(err.to_string(), "rmdir /d: directory not empty");

    fs.unlink("/d/x").expect("unlink");
    fs.rmdir("/d").expect("rmdir");
    assert_eq!(fs.stat("/d").unwrap_err().kind(), ErrorKind::NoSuchFileOrDir);
}

#[test]
fn test_umask_application() {
    let fs = create_test_fs();
    assert_eq!(fs.umask(), 0o022);
    fs.write_file("/f", b"", 0o666).expect("write_file");
    assert_eq!(fs.stat("/f").expect("stat").mode().perm(), 0o644);

    fs.set_umask(0o077);
    let h = fs.create("/g").expect("create");
    fs.close(h).expect("close");
    assert_eq!(fs.stat("/g").expect("stat").mode().perm(), 0o600);
}

#[test]
fn test_umask_is_per_filesystem() {
    let a = create_test_fs();
    let b = create_test_fs();
    a.set_umask(0o077);
    assert_eq!(b.umask(), 0o022);
}

#[test]
fn test_capability_gating_leaves_tree_unchanged() {
    let fs = MemFs::new(FsConfig::default().with_features(Features::IDENTITY_MGR)).expect("create filesystem");
    fs.mkdir("/d", 0o755).expect("mkdir");
    fs.write_file("/d/f", b"x", 0o644).expect("write_file");
    let snapshot = fs.read_dir("/d").expect("read_dir");
    let nodes = fs.node_count();

    let err = fs.symlink("/d/f", "/d/l").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedFeature);
    assert_eq!(err.to_string(), "symlink /d/f /d/l: operation not supported");
    assert_eq!(fs.link("/d/f", "/d/h").unwrap_err().kind(), ErrorKind::UnsupportedFeature);
    assert_eq!(fs.read_link("/d/f").unwrap_err().kind(), ErrorKind::UnsupportedFeature);

    assert_eq!(fs.read_dir("/d").expect("read_dir"), snapshot);
    assert_eq!(fs.node_count(), nodes);
}

#[test]
fn test_identity_calls_need_identity_manager() {
    let fs = MemFs::new(FsConfig::default().with_features(Features::SYMLINK)).expect("create filesystem");
    fs.write_file("/f", b"", 0o644).expect("write_file");
    assert_eq!(fs.chown("/f", 1, 1).unwrap_err().kind(), ErrorKind::UnsupportedFeature);
    assert_eq!(fs.with_user("root").unwrap_err().kind(), ErrorKind::UnsupportedFeature);
    assert!(fs.idm().add_user("bob", "root").is_err());
}

#[test]
fn test_deleted_while_open() {
    let fs = create_test_fs();
    let baseline = fs.node_count();
    fs.write_file("/f", b"still here", 0o644).expect("write_file");
    let h = fs.open("/f").expect("open");

    fs.unlink("/f").expect("unlink");
    assert_eq!(fs.stat("/f").unwrap_err().kind(), ErrorKind::NoSuchFileOrDir);
    assert_eq!(fs.node_count(), baseline + 1);
    assert_eq!(fs.handle_stat(h).expect("handle_stat").sys().nlink, 0);

    let mut buf = [0u8; 32];
    let n = fs.read(h, &mut buf).expect("read");
    assert_eq!(&buf[..n], b"still here");

    fs.write_file("/f", b"new", 0o644).expect("recreate");
    fs.close(h).expect("close");
    assert_eq!(fs.node_count(), baseline + 1);
    assert_eq!(fs.read_file("/f").expect("read_file"), b"new");
}

#[test]
fn test_removed_chroot_root_rejects_new_entries() {
    let fs = create_test_fs();
    let baseline = fs.node_count();
    fs.mkdir("/jail", 0o755).expect("mkdir");
    let jailed = fs.with_user("root").expect("view");
    jailed.chroot("/jail").expect("chroot");
    let h = jailed.open("/").expect("open view root");

    fs.rmdir("/jail").expect("rmdir");
    let err = jailed.write_file("/x", b"orphan", 0o644).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSuchFileOrDir);
    assert_eq!(jailed.mkdir("/d", 0o755).unwrap_err().kind(), ErrorKind::NoSuchFileOrDir);
    assert!(jailed.read_dir("/").expect("read_dir").is_empty());
    assert_eq!(fs.node_count(), baseline + 1);

    jailed.close(h).expect("close");
    assert_eq!(fs.node_count(), baseline);
}

#[test]
fn test_windows_emulation() {
    let fs = MemFs::new(
        FsConfig::default()
            .with_os_type(OsType::Windows)
            .with_features(Features::all() - Features::READ_ONLY - Features::REAL_FS),
    )
    .expect("create filesystem");

    assert_eq!(fs.user().name(), "ContainerAdministrator");
    assert_eq!(fs.getwd().expect("getwd"), "C:\\");
    assert_eq!(fs.tmp_dir(), "C:\\Windows\\Temp");
    assert_eq!(fs.home_dir_user("alice"), "C:\\Users\\alice");

    fs.mkdir("C:\\Users\\Alice", 0o755).expect("mkdir");
    assert!(fs.stat("c:/users/ALICE").expect("stat").is_dir());
    let names: Vec<String> = fs.read_dir("C:\\Users").expect("read_dir").into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["Alice"]);

    let err = fs.mkdir("C:\\USERS\\alice", 0o755).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(err.to_string(), "mkdir C:\\USERS\\alice: The file exists.");

    let err = fs.stat("C:\\Missing").unwrap_err();
    assert_eq!(err.to_string(), "stat C:\\Missing: The system cannot find the file specified.");
    assert_eq!(err.code(), 2);

    assert_eq!(fs.stat("D:\\Users").unwrap_err().kind(), ErrorKind::NoSuchFileOrDir);
    assert_eq!(fs.mkdir("C:\\bad|name", 0o755).unwrap_err().kind(), ErrorKind::InvalidArgument);

    fs.chdir("C:\\Users\\alice").expect("chdir");
    fs.write_file("notes.txt", b"hi", 0o644).expect("write_file");
    assert_eq!(fs.read_file("C:\\USERS\\ALICE\\NOTES.TXT").expect("read_file"), b"hi");
    fs.rename("notes.txt", "Notes.txt").expect("case-only rename");
    let names: Vec<String> = fs.read_dir(".").expect("read_dir").into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["Notes.txt"]);
}

#[test]
fn test_linux_is_case_sensitive() {
    let fs = create_test_fs();
    fs.write_file("/File", b"upper", 0o644).expect("write_file");
    fs.write_file("/file", b"lower", 0o644).expect("write_file");
    assert_eq!(fs.read_file("/File").expect("read_file"), b"upper");
    assert_eq!(fs.read_dir("/").expect("read_dir").len(), 2);
}

fn mock_idm() -> MockIdentityMgr {
    let mut idm = MockIdentityMgr::new();
    idm.expect_os_type().returning(|| OsType::Linux);
    idm.expect_admin_user().returning(|| User::new("root", 0, 0));
    idm.expect_admin_group().returning(|| Group::new("root", 0));
    idm.expect_current_user().returning(|| User::new("svc", 1500, 1500));
    idm.expect_lookup_user().returning(|name| match name {
        "root" => Ok(User::new("root", 0, 0)),
        "svc" => Ok(User::new("svc", 1500, 1500)),
        other => Err(FsError::UnknownUser(other.to_string())),
    });
    idm.expect_is_member().returning(|uid, gid| uid == 1500 && gid == 2000);
    idm
}

#[test]
fn test_external_identity_manager() {
    let fs = MemFs::with_identity_mgr(FsConfig::default(), Arc::new(mock_idm())).expect("create filesystem");
    assert_eq!(fs.user().name(), "svc");
    assert_eq!(fs.mkdir("/x", 0o755).unwrap_err().kind(), ErrorKind::PermissionDenied);

    let root = fs.with_user("root").expect("root view");
    root.mkdir("/shared", 0o777).expect("mkdir");
    root.chown("/shared", 0, 2000).expect("chown");
    root.chmod("/shared", 0o770).expect("chmod");

    fs.write_file("/shared/f", b"member", 0o644).expect("group member writes");
    assert_eq!(fs.stat("/shared/f").expect("stat").sys().uid, 1500);

    let err = fs.with_user("ghost").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownUser);
    assert_eq!(err.to_string(), "user: unknown user ghost");
}

#[test]
fn test_initial_user_from_config() {
    let fs = MemFs::with_identity_mgr(
        FsConfig::default().with_initial_user("root"),
        Arc::new(mock_idm()),
    )
    .expect("create filesystem");
    assert_eq!(fs.user().uid(), 0);

    let err = MemFs::with_identity_mgr(FsConfig::default().with_initial_user("nobody"), Arc::new(mock_idm()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownUser);
}
