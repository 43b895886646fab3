use crate::fs_mount::*;
use fuser::FileType;
use hub_lib::{CommitRef, MemHub, Shard};
use libc::{EBADF, EINVAL, EPERM};
use std::io::Write;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn new_mount(hub: &MemHub, config: MountConfig) -> FsMount {
    let runtime = Runtime::new().expect("create runtime");
    FsMount::new(runtime, Arc::new(hub.clone()), config)
}

fn pinned_config(repo: &str, commit: &str) -> MountConfig {
    MountConfig::new(None, vec![CommitMount::new(CommitRef::new(repo, commit))])
}

fn names(entries: &[(u64, FileType, String, i64)]) -> Vec<String> {
    entries
        .iter()
        .map(|e| e.2.clone())
        .filter(|n| n != "." && n != "..")
        .collect()
}

fn open_commit_mount() -> (MemHub, FsMount, u64) {
    let hub = MemHub::new();
    hub.add_repo("models");
    hub.add_commit("models", "c9", true);
    let fs = new_mount(&hub, pinned_config("models", "c9"));
    let (dir_ino, _) = fs.lookup_entry(ROOT_INODE, "models").expect("lookup dir");
    (hub, fs, dir_ino)
}

#[test]
fn browse_unmounted_hub() {
    let hub = MemHub::new();
    hub.add_repo("alpha");
    hub.add_commit("alpha", "c1", false);
    hub.put_file("alpha", "c1", "/a.txt", b"data");
    hub.add_repo("beta");

    let fs = new_mount(&hub, MountConfig::empty());
    let entries = fs.readdir_entries(ROOT_INODE, 0).expect("readdir root");
    assert_eq!(names(&entries), vec!["alpha", "beta"]);

    let (repo_ino, attr) = fs.lookup_entry(ROOT_INODE, "alpha").expect("lookup alpha");
    assert_eq!(attr.kind, FileType::Directory);
    assert_eq!(attr.perm, 0o555);

    let commits = fs.readdir_entries(repo_ino, 0).expect("readdir repo");
    assert_eq!(names(&commits), vec!["c1"]);

    let (commit_ino, _) = fs.lookup_entry(repo_ino, "c1").expect("lookup commit");
    let files = fs.readdir_entries(commit_ino, 0).expect("readdir commit");
    assert_eq!(names(&files), vec!["a.txt"]);
}

#[test]
fn unknown_root_name_is_eperm_not_enoent() {
    let hub = MemHub::new();
    hub.add_repo("alpha");

    // Browsing config: the repo genuinely does not exist on the hub.
    let fs = new_mount(&hub, MountConfig::empty());
    assert_eq!(fs.lookup_entry(ROOT_INODE, "missing").unwrap_err(), EPERM);

    // Mounted config: the name matches no mount.
    let fs = new_mount(&hub, pinned_config("alpha", "c1"));
    assert_eq!(fs.lookup_entry(ROOT_INODE, "zzz").unwrap_err(), EPERM);
}

#[test]
fn read_pinned_finished_commit() {
    let hub = MemHub::new();
    hub.add_repo("models");
    hub.add_commit("models", "c1", false);
    hub.put_file("models", "c1", "/a.txt", b"the quick brown fox");

    let fs = new_mount(&hub, pinned_config("models", "c1"));
    let entries = fs.readdir_entries(ROOT_INODE, 0).expect("readdir root");
    assert_eq!(names(&entries), vec!["models"]);

    let (dir_ino, dir_attr) = fs.lookup_entry(ROOT_INODE, "models").expect("lookup dir");
    assert_eq!(dir_attr.kind, FileType::Directory);
    assert_eq!(dir_attr.perm, 0o555);

    let (file_ino, file_attr) = fs.lookup_entry(dir_ino, "a.txt").expect("lookup file");
    assert_eq!(file_attr.kind, FileType::RegularFile);
    assert_eq!(file_attr.perm, 0o666);
    assert_eq!(file_attr.size, 19);

    let fh = fs.open_entry(file_ino).expect("open");
    assert!(fh > 0);
    assert_eq!(
        fs.read_entry(file_ino, 0, 1024).expect("read"),
        b"the quick brown fox"
    );
    assert_eq!(fs.read_entry(file_ino, 4, 5).expect("read slice"), b"quick");
}

#[test]
fn alias_wins_over_repo_name() {
    let hub = MemHub::new();
    hub.add_repo("models");
    hub.add_commit("models", "c2", false);
    hub.put_file("models", "c2", "/from_models.txt", b"m");
    hub.add_repo("out");
    hub.add_commit("out", "c3", false);
    hub.put_file("out", "c3", "/from_out.txt", b"o");

    let config = MountConfig::new(
        None,
        vec![
            CommitMount::new(CommitRef::new("models", "c2")).with_alias("out"),
            CommitMount::new(CommitRef::new("out", "c3")),
        ],
    );
    let fs = new_mount(&hub, config);

    let entries = fs.readdir_entries(ROOT_INODE, 0).expect("readdir root");
    assert_eq!(names(&entries), vec!["out", "out"]);

    // "out" hits the aliased mount, not the repo of the same name.
    let (alias_ino, _) = fs.lookup_entry(ROOT_INODE, "out").expect("lookup alias");
    let files = fs.readdir_entries(alias_ino, 0).expect("readdir alias");
    assert_eq!(names(&files), vec!["from_models.txt"]);

    // The bare repo name falls back to the first mount with that repo.
    let (repo_ino, _) = fs.lookup_entry(ROOT_INODE, "models").expect("lookup repo");
    assert_eq!(repo_ino, alias_ino);
}

#[test]
fn inodes_are_stable_and_unique() {
    let hub = MemHub::new();
    hub.add_repo("models");
    hub.add_commit("models", "c1", false);
    hub.put_file("models", "c1", "/a.txt", b"a");
    hub.put_file("models", "c1", "/b.txt", b"b");

    let fs = new_mount(&hub, pinned_config("models", "c1"));
    let (dir_ino, _) = fs.lookup_entry(ROOT_INODE, "models").expect("lookup dir");
    let (a1, _) = fs.lookup_entry(dir_ino, "a.txt").expect("lookup a");
    let (a2, _) = fs.lookup_entry(dir_ino, "a.txt").expect("lookup a again");
    let (b1, _) = fs.lookup_entry(dir_ino, "b.txt").expect("lookup b");
    assert_eq!(a1, a2);
    assert_ne!(a1, b1);
    assert_ne!(a1, dir_ino);

    // Readdir agrees with lookup on the inode of each entry.
    let entries = fs.readdir_entries(dir_ino, 0).expect("readdir");
    let from_readdir: Vec<(u64, String)> = entries
        .iter()
        .filter(|e| e.2 != "." && e.2 != "..")
        .map(|e| (e.0, e.2.clone()))
        .collect();
    assert!(from_readdir.contains(&(a1, "a.txt".to_string())));
    assert!(from_readdir.contains(&(b1, "b.txt".to_string())));
}

#[test]
fn open_commit_dir_is_writable_mode() {
    let (_hub, fs, dir_ino) = open_commit_mount();
    let attr = fs.getattr_entry(dir_ino).expect("getattr");
    assert_eq!(attr.kind, FileType::Directory);
    assert_eq!(attr.perm, 0o775);
}

#[test]
fn writable_dir_synthesizes_lookup() {
    let (_hub, fs, dir_ino) = open_commit_mount();
    // No such file anywhere, yet the lookup answers with an empty file so
    // a following remove can proceed.
    let (ino, attr) = fs.lookup_entry(dir_ino, "ghost").expect("lookup ghost");
    assert_eq!(attr.kind, FileType::RegularFile);
    assert_eq!(attr.size, 0);
    assert!(ino > ROOT_INODE);
}

#[test]
fn remove_succeeds_regardless_of_hub_state() {
    let (hub, fs, dir_ino) = open_commit_mount();
    hub.put_file("models", "c9", "/x", b"data");

    let (_ino, _) = fs.lookup_entry(dir_ino, "x").expect("lookup x");
    fs.remove_entry(dir_ino, "x").expect("remove existing");
    assert!(!hub.has_file("models", "c9", "/x"));

    let (_ino, _) = fs.lookup_entry(dir_ino, "ghost").expect("lookup ghost");
    fs.remove_entry(dir_ino, "ghost").expect("remove absent");
}

#[test]
fn create_then_remove_leaves_no_server_file() {
    let (hub, fs, dir_ino) = open_commit_mount();
    let (_ino, attr, _fh) = fs.create_entry(dir_ino, "f").expect("create");
    assert_eq!(attr.size, 0);
    // Create is purely local.
    assert!(!hub.has_file("models", "c9", "/f"));
    fs.remove_entry(dir_ino, "f").expect("remove");
    assert!(!hub.has_file("models", "c9", "/f"));
}

#[test]
fn duplicate_window_writes_stream_once() {
    let (hub, fs, dir_ino) = open_commit_mount();
    let (file_ino, _, fh) = fs.create_entry(dir_ino, "log").expect("create");

    // The kernel credits 5 bytes, then re-sends them with 5 more appended.
    assert_eq!(fs.write_handle(fh, 0, b"hello").expect("write"), 5);
    assert_eq!(
        fs.write_handle(fh, 0, b"helloworld").expect("write dup"),
        10
    );
    fs.flush_handle(fh).expect("flush");
    assert_eq!(
        hub.file_contents("models", "c9", "/log").expect("contents"),
        b"helloworld"
    );

    // A writable file always reports size 0 no matter what was streamed.
    let attr = fs.getattr_entry(file_ino).expect("getattr");
    assert_eq!(attr.size, 0);
}

#[test]
fn fully_repeated_write_is_credited_without_resend() {
    let (hub, fs, dir_ino) = open_commit_mount();
    let (_ino, _, fh) = fs.create_entry(dir_ino, "log").expect("create");
    assert_eq!(fs.write_handle(fh, 0, b"abc").expect("write"), 3);
    assert_eq!(fs.write_handle(fh, 0, b"abc").expect("resend"), 3);
    fs.flush_handle(fh).expect("flush");
    assert_eq!(
        hub.file_contents("models", "c9", "/log").expect("contents"),
        b"abc"
    );
}

#[test]
fn write_gap_is_invalid_argument() {
    let (_hub, fs, dir_ino) = open_commit_mount();
    let (_ino, _, fh) = fs.create_entry(dir_ino, "log").expect("create");
    assert_eq!(fs.write_handle(fh, 10, b"x").unwrap_err(), EINVAL);
}

#[test]
fn flush_preserves_written_and_write_reopens() {
    let (hub, fs, dir_ino) = open_commit_mount();
    let (_ino, _, fh) = fs.create_entry(dir_ino, "log").expect("create");
    assert_eq!(fs.write_handle(fh, 0, b"hello").expect("write"), 5);
    fs.flush_handle(fh).expect("flush");
    // The stream reopens transparently; the offset bookkeeping survives.
    assert_eq!(fs.write_handle(fh, 5, b"world").expect("write"), 5);
    fs.flush_handle(fh).expect("flush again");
    assert_eq!(
        hub.file_contents("models", "c9", "/log").expect("contents"),
        b"helloworld"
    );
}

#[test]
fn release_drops_the_handle() {
    let (_hub, fs, dir_ino) = open_commit_mount();
    let (_ino, _, fh) = fs.create_entry(dir_ino, "log").expect("create");
    fs.write_handle(fh, 0, b"x").expect("write");
    fs.flush_handle(fh).expect("flush");
    fs.release_handle(fh);
    assert_eq!(fs.write_handle(fh, 1, b"y").unwrap_err(), EBADF);
}

#[test]
fn write_to_finished_commit_is_eperm() {
    let hub = MemHub::new();
    hub.add_repo("models");
    hub.add_commit("models", "c1", false);
    hub.put_file("models", "c1", "/a.txt", b"data");

    let fs = new_mount(&hub, pinned_config("models", "c1"));
    let (dir_ino, _) = fs.lookup_entry(ROOT_INODE, "models").expect("lookup dir");
    let (file_ino, _) = fs.lookup_entry(dir_ino, "a.txt").expect("lookup file");
    let fh = fs.open_entry(file_ino).expect("open");
    assert_eq!(fs.write_handle(fh, 0, b"nope").unwrap_err(), EPERM);

    assert_eq!(fs.create_entry(dir_ino, "new").unwrap_err(), EPERM);
    assert_eq!(fs.mkdir_entry(dir_ino, "sub").unwrap_err(), EPERM);
    assert_eq!(fs.remove_entry(dir_ino, "a.txt").unwrap_err(), EPERM);
}

#[test]
fn create_and_mkdir_need_a_pinned_commit() {
    let hub = MemHub::new();
    hub.add_repo("models");
    hub.add_commit("models", "c1", true);

    let fs = new_mount(&hub, MountConfig::empty());
    let (repo_ino, _) = fs.lookup_entry(ROOT_INODE, "models").expect("lookup repo");
    assert_eq!(fs.create_entry(repo_ino, "f").unwrap_err(), EPERM);
    assert_eq!(fs.mkdir_entry(repo_ino, "d").unwrap_err(), EPERM);
    assert_eq!(fs.remove_entry(repo_ino, "f").unwrap_err(), EPERM);
}

#[test]
fn mkdir_shows_up_in_readdir() {
    let (_hub, fs, dir_ino) = open_commit_mount();
    let (_ino, attr) = fs.mkdir_entry(dir_ino, "sub").expect("mkdir");
    assert_eq!(attr.kind, FileType::Directory);
    assert_eq!(attr.perm, 0o775);

    let entries = fs.readdir_entries(dir_ino, 0).expect("readdir");
    let sub = entries
        .iter()
        .find(|e| e.2 == "sub")
        .expect("sub listed");
    assert_eq!(sub.1, FileType::Directory);
}

#[test]
fn read_of_missing_open_commit_file_is_einval() {
    let (_hub, fs, dir_ino) = open_commit_mount();
    let (file_ino, _) = fs.lookup_entry(dir_ino, "nofile").expect("lookup");
    assert_eq!(fs.read_entry(file_ino, 0, 16).unwrap_err(), EINVAL);
}

#[test]
fn pinned_mount_lists_files_diffed_against_from_commit() {
    let hub = MemHub::new();
    hub.add_repo("models");
    hub.add_commit("models", "c6", false);
    hub.put_file("models", "c6", "/a.txt", b"one");
    hub.put_file("models", "c6", "/same.txt", b"keep");
    hub.add_commit("models", "c7", false);
    hub.put_file("models", "c7", "/a.txt", b"onetwo");
    hub.put_file("models", "c7", "/b.txt", b"two");
    hub.put_file("models", "c7", "/same.txt", b"keep");

    let config = MountConfig::new(
        None,
        vec![CommitMount::new(CommitRef::new("models", "c7"))
            .with_from_commit(CommitRef::new("models", "c6"))],
    );
    let fs = new_mount(&hub, config);

    // The repo directory serves commit c7 as a delta over c6: unchanged
    // files disappear, appended files shrink to their delta.
    let (dir_ino, _) = fs.lookup_entry(ROOT_INODE, "models").expect("lookup dir");
    let entries = fs.readdir_entries(dir_ino, 0).expect("readdir");
    assert_eq!(names(&entries), vec!["a.txt", "b.txt"]);

    let (a_ino, a_attr) = fs.lookup_entry(dir_ino, "a.txt").expect("lookup a");
    assert_eq!(a_attr.size, 3);
    assert_eq!(fs.read_entry(a_ino, 0, 64).expect("read delta"), b"two");

    let (b_ino, _) = fs.lookup_entry(dir_ino, "b.txt").expect("lookup b");
    assert_eq!(fs.read_entry(b_ino, 0, 64).expect("read new"), b"two");
}

#[test]
fn sharded_mount_restricts_the_listing() {
    let hub = MemHub::new();
    hub.add_repo("models");
    hub.add_commit("models", "c1", false);
    for i in 0..8 {
        hub.put_file("models", "c1", &format!("/f{}.txt", i), b"x");
    }

    let all = new_mount(&hub, pinned_config("models", "c1"));
    let (dir_ino, _) = all.lookup_entry(ROOT_INODE, "models").expect("lookup");
    let total = names(&all.readdir_entries(dir_ino, 0).expect("readdir")).len();
    assert_eq!(total, 8);

    // The two shards of modulus 2 partition the files exactly.
    let mut sharded_total = 0;
    for shard_type in 0..2 {
        let shard = Shard {
            shard_type,
            modulus: 2,
        };
        let config = MountConfig::new(
            Some(shard),
            vec![CommitMount::new(CommitRef::new("models", "c1")).with_shard(shard)],
        );
        let sharded = new_mount(&hub, config);
        let (dir_ino, _) = sharded.lookup_entry(ROOT_INODE, "models").expect("lookup");
        sharded_total += names(&sharded.readdir_entries(dir_ino, 0).expect("readdir")).len();
    }
    assert_eq!(sharded_total, total);
}

#[test]
fn readdir_resumes_from_offset() {
    let hub = MemHub::new();
    hub.add_repo("models");
    hub.add_commit("models", "c1", false);
    hub.put_file("models", "c1", "/a.txt", b"a");
    hub.put_file("models", "c1", "/b.txt", b"b");

    let fs = new_mount(&hub, pinned_config("models", "c1"));
    let (dir_ino, _) = fs.lookup_entry(ROOT_INODE, "models").expect("lookup");
    let all = fs.readdir_entries(dir_ino, 0).expect("readdir");
    assert_eq!(all.len(), 4); // ".", "..", "a.txt", "b.txt"

    let resume_at = all[2].3;
    let rest = fs.readdir_entries(dir_ino, resume_at).expect("resume");
    assert_eq!(names(&rest), vec!["b.txt"]);
}

#[test]
fn root_attr_is_read_only_directory() {
    let hub = MemHub::new();
    let fs = new_mount(&hub, MountConfig::empty());
    let attr = fs.getattr_entry(ROOT_INODE).expect("getattr root");
    assert_eq!(attr.ino, ROOT_INODE);
    assert_eq!(attr.kind, FileType::Directory);
    assert_eq!(attr.perm, 0o555);
}

#[test]
fn mount_config_file_parses_aliases_and_defaults() {
    let json = r#"{
        "shard": {"type": 1, "modulus": 4},
        "commit_mounts": [
            {"repo": "models", "id": "c1", "from": "c0", "alias": "out"},
            {"repo": "models", "commit": ""}
        ]
    }"#;
    let file: MountConfigFile = serde_json::from_str(json).expect("parse");
    let config = file.into_config().expect("into config");
    assert_eq!(config.shard.map(|s| s.modulus), Some(4));

    let out = config.resolve("out").expect("resolve alias");
    assert_eq!(out.commit.id, "c1");
    assert_eq!(out.from_commit.as_ref().map(|c| c.id.as_str()), Some("c0"));
    // Per-mount shard falls back to the top-level shard.
    assert_eq!(out.shard.map(|s| s.shard_type), Some(1));

    // The bare repo name falls back to the first mount with that repo.
    let fallback = config.resolve("models").expect("resolve repo");
    assert_eq!(fallback.commit.id, "c1");
}

#[test]
fn duplicate_aliases_are_rejected() {
    let json = r#"{"commit_mounts": [
        {"repo": "a", "id": "c1", "alias": "out"},
        {"repo": "b", "id": "c2", "alias": "out"}
    ]}"#;
    let file: MountConfigFile = serde_json::from_str(json).expect("parse");
    assert!(file.into_config().is_err());
}

#[test]
fn load_mount_config_reads_json_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("mounts.json");
    let mut file = std::fs::File::create(&path).expect("create");
    file.write_all(br#"{"commit_mounts": [{"repo": "models", "id": "c1"}]}"#)
        .expect("write");

    let config = load_mount_config(Some(path.as_path())).expect("load");
    assert_eq!(config.resolve("models").map(|m| m.commit.id), Some("c1".to_string()));

    let empty = load_mount_config(None).expect("load default");
    assert!(empty.resolve("anything").map(|m| m.commit.id) == Some(String::new()));

    let missing = dir.path().join("missing.json");
    assert!(load_mount_config(Some(missing.as_path())).is_err());
}
