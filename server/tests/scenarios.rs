// SPDX-License-Identifier: MPL-2.0

//! End-to-end scenarios driven through the public record interface.

use std::{
    sync::{mpsc, Arc},
    time::{Duration, Instant},
};

use metadir_server::{
    meta::types::{mode, DentryStat, RenameFlags, SetStatFlags},
    record::{DentryRouteType, Record, RecordOperation},
    replication::push_result::RpcWaiter,
    Errno, MetaServer, RecordOutcome, ServerConfig, StorageConfig,
};

const NS: &str = "fs";

fn run(server: &MetaServer, record: Box<Record>) -> (Box<Record>, RecordOutcome) {
    let (tx, rx) = mpsc::channel();
    let record = record.with_notify(move |record, outcome| {
        tx.send((record, outcome)).unwrap();
    });
    server.submit(record);
    rx.recv_timeout(Duration::from_secs(10))
        .expect("record completion")
}

fn create(server: &MetaServer, path: &str, file_mode: u32, size: i64) -> Box<Record> {
    let stat = DentryStat {
        mode: file_mode,
        size,
        ..Default::default()
    };
    let (record, outcome) = run(
        server,
        Record::new(RecordOperation::Create, NS)
            .with_path(path)
            .with_stat(stat),
    );
    assert!(outcome.is_ok(), "create {path} failed: {outcome:?}");
    record
}

fn stat(server: &MetaServer, path: &str) -> (Box<Record>, RecordOutcome) {
    run(
        server,
        Record::new(RecordOperation::Stat, NS).with_path(path),
    )
}

fn storage_server() -> (Arc<MetaServer>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        data_threads: 2,
        storage: Some(StorageConfig::new(dir.path())),
        ..Default::default()
    };
    (MetaServer::start(config).unwrap(), dir)
}

#[test]
fn create_stat_list() {
    let (server, _dir) = storage_server();

    create(&server, "/", mode::IFDIR | 0o755, 0);
    create(&server, "/a", mode::IFDIR | 0o755, 0);
    create(&server, "/a/b", mode::IFREG | 0o644, 17);

    let (record, outcome) = stat(&server, "/a/b");
    assert!(outcome.is_ok());
    let dentry = record.me.dentry.as_ref().unwrap();
    assert_eq!(dentry.stat().size, 17);
    assert_eq!(dentry.stat().nlink, 1);

    let (record, outcome) = run(
        &server,
        Record::new(RecordOperation::List, NS).with_path("/a"),
    );
    assert!(outcome.is_ok());
    let names: Vec<String> = record.output.dentries.iter().map(|d| d.name()).collect();
    assert_eq!(names, vec!["b".to_string()]);

    // The same child through the parent-inode route.
    let parent_inode = stat(&server, "/a").0.inode;
    let (record, outcome) = run(
        &server,
        Record::new(RecordOperation::LookupInode, NS).with_pname(parent_inode, "b"),
    );
    assert!(outcome.is_ok());
    assert_eq!(record.inode, stat(&server, "/a/b").0.inode);

    // The root directory is an entry like any other.
    let (ns, dir, file) = server.pool().sum_counters();
    assert_eq!((ns, dir, file), (1, 2, 1));
    let entry = server.pool().registry().get(NS, false).unwrap();
    assert_eq!(entry.counts(), (2, 1));

    server.stop();
}

#[test]
fn replayed_versions_advance_the_counter() {
    let server = MetaServer::start(ServerConfig::default()).unwrap();
    create(&server, "/", mode::IFDIR | 0o755, 0);

    // A replayed mutation carries its version and inode.
    let (record, outcome) = run(
        &server,
        Record::new(RecordOperation::Create, NS)
            .with_path("/replayed")
            .with_stat(DentryStat {
                mode: mode::IFREG | 0o644,
                ..Default::default()
            })
            .with_data_version(100),
    );
    assert!(outcome.is_ok());
    assert_eq!(record.data_version, 100);
    assert_eq!(server.pool().versions().current_data(), 100);

    // Fresh mutations continue past the replayed high-water mark.
    let fresh = create(&server, "/fresh", mode::IFREG | 0o644, 0);
    assert_eq!(fresh.data_version, 101);

    server.stop();
}

#[test]
fn hard_links_share_their_source() {
    let (server, _dir) = storage_server();

    create(&server, "/", mode::IFDIR | 0o755, 0);
    create(&server, "/a", mode::IFDIR | 0o755, 0);
    let src = create(&server, "/a/b", mode::IFREG | 0o644, 17);
    let src_inode = src.inode;

    let (_, outcome) = run(
        &server,
        Record::new(RecordOperation::Create, NS)
            .with_path("/a/c")
            .with_stat(DentryStat {
                mode: mode::HARD_LINK,
                ..Default::default()
            })
            .with_hdlink_path("/a/b"),
    );
    assert!(outcome.is_ok());

    let (record, _) = stat(&server, "/a/b");
    assert_eq!(record.me.dentry.as_ref().unwrap().stat().nlink, 2);

    // Removing the original leaves the link usable.
    let (_, outcome) = run(
        &server,
        Record::new(RecordOperation::Remove, NS).with_path("/a/b"),
    );
    assert!(outcome.is_ok());

    let (record, outcome) = stat(&server, "/a/c");
    assert!(outcome.is_ok());
    let via_link = record.me.dentry.as_ref().unwrap();
    assert_eq!(via_link.stat().size, 17);
    assert_eq!(via_link.stat().nlink, 1);
    // The link resolves to the source inode.
    assert_eq!(record.inode, src_inode);

    server.stop();
}

#[test]
fn rename_noreplace_keeps_the_tree() {
    let (server, _dir) = storage_server();

    create(&server, "/", mode::IFDIR | 0o755, 0);
    create(&server, "/a", mode::IFDIR | 0o755, 0);
    create(&server, "/a/b", mode::IFREG | 0o644, 1);
    create(&server, "/a/c", mode::IFREG | 0o644, 2);

    let (_, outcome) = run(
        &server,
        Record::new(RecordOperation::Rename, NS)
            .with_rename_paths("/a/b", "/a/c")
            .with_rename_flags(RenameFlags::NOREPLACE),
    );
    assert_eq!(outcome.errno, Some(Errno::EEXIST));
    assert!(outcome.is_error);

    let (record, outcome) = stat(&server, "/a/b");
    assert!(outcome.is_ok());
    assert_eq!(record.me.dentry.as_ref().unwrap().stat().size, 1);
    let (record, _) = stat(&server, "/a/c");
    assert_eq!(record.me.dentry.as_ref().unwrap().stat().size, 2);

    server.stop();
}

#[test]
fn rename_exchange_swaps_parents_and_versions_stay_consecutive() {
    let (server, _dir) = storage_server();

    create(&server, "/", mode::IFDIR | 0o755, 0);
    create(&server, "/a", mode::IFDIR | 0o755, 0);
    create(&server, "/b", mode::IFDIR | 0o755, 0);
    let x = create(&server, "/a/x", mode::IFREG | 0o644, 1);
    let y = create(&server, "/b/y", mode::IFREG | 0o644, 2);
    assert_eq!(x.data_version + 1, y.data_version);

    let a_inode = stat(&server, "/a").0.inode;
    let b_inode = stat(&server, "/b").0.inode;

    let (record, outcome) = run(
        &server,
        Record::new(RecordOperation::Rename, NS)
            .with_rename_paths("/a/x", "/b/y")
            .with_rename_flags(RenameFlags::EXCHANGE),
    );
    assert!(outcome.is_ok());
    assert_eq!(record.data_version, y.data_version + 1);

    let (swapped, _) = stat(&server, "/b/y");
    assert_eq!(swapped.inode, x.inode);
    let (swapped, _) = stat(&server, "/a/x");
    assert_eq!(swapped.inode, y.inode);

    // Both parents' children fields reached the persistence pipeline.
    let write = server.binlog_write().unwrap().clone();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let logged = write.fields_logged();
        let children_of = |inode: u64| {
            logged
                .iter()
                .any(|(i, field, version)| {
                    *i == inode && *field == 1 && *version == record.data_version
                })
        };
        if children_of(a_inode) && children_of(b_inode) {
            break;
        }
        assert!(Instant::now() < deadline, "children events never persisted");
        std::thread::sleep(Duration::from_millis(10));
    }

    server.stop();
}

#[test]
fn xattr_set_get_remove() {
    let (server, _dir) = storage_server();

    create(&server, "/", mode::IFDIR | 0o755, 0);
    create(&server, "/a", mode::IFDIR | 0o755, 0);
    create(&server, "/a/b", mode::IFREG | 0o644, 17);

    let (_, outcome) = run(
        &server,
        Record::new(RecordOperation::SetXattr, NS)
            .with_path("/a/b")
            .with_xattr("user.k1", "v1"),
    );
    assert!(outcome.is_ok());

    let (record, outcome) = run(
        &server,
        Record::new(RecordOperation::GetXattr, NS)
            .with_path("/a/b")
            .with_xattr("user.k1", ""),
    );
    assert!(outcome.is_ok());
    assert_eq!(record.output.xattr_value.as_deref(), Some("v1"));

    let (record, outcome) = run(
        &server,
        Record::new(RecordOperation::ListXattr, NS).with_path("/a/b"),
    );
    assert!(outcome.is_ok());
    assert_eq!(
        record.output.xattr_names.as_deref(),
        Some(&["user.k1".to_string()][..])
    );

    let (_, outcome) = run(
        &server,
        Record::new(RecordOperation::RemoveXattr, NS)
            .with_path("/a/b")
            .with_xattr("user.k1", ""),
    );
    assert!(outcome.is_ok());

    let (_, outcome) = run(
        &server,
        Record::new(RecordOperation::GetXattr, NS)
            .with_path("/a/b")
            .with_xattr("user.k1", ""),
    );
    assert_eq!(outcome.errno, Some(Errno::ENODATA));

    // Loose mode: removing it again reports the code without counting
    // as a failure.
    let (_, outcome) = run(
        &server,
        Record::new(RecordOperation::RemoveXattr, NS)
            .with_path("/a/b")
            .with_xattr("user.k1", ""),
    );
    assert_eq!(outcome.errno, Some(Errno::ENODATA));
    assert!(!outcome.is_error);

    server.stop();
}

#[test]
fn set_dentry_size_is_idempotent_under_loose_mode() {
    let server = MetaServer::start(ServerConfig::default()).unwrap();
    create(&server, "/", mode::IFDIR | 0o755, 0);
    let file = create(&server, "/f", mode::IFREG | 0o644, 0);

    let grow = || {
        Record::new(RecordOperation::SetDentrySize, NS)
            .with_inode(file.inode)
            .with_stat(DentryStat {
                size: 4096,
                ..Default::default()
            })
            .with_options(SetStatFlags::FILE_SIZE)
    };

    let (record, outcome) = run(&server, grow());
    assert!(outcome.is_ok());
    assert_eq!(record.me.dentry.as_ref().unwrap().stat().size, 4096);
    let grown_version = record.data_version;

    // The same size again is reported but not counted as a failure,
    // and no new version is burned.
    let (record, outcome) = run(&server, grow());
    assert_eq!(outcome.errno, Some(Errno::EEXIST));
    assert!(!outcome.is_error);
    assert_eq!(record.data_version, 0);
    assert_eq!(server.pool().versions().current_data(), grown_version);

    server.stop();
}

#[test]
fn symlink_readlink() {
    let server = MetaServer::start(ServerConfig::default()).unwrap();
    create(&server, "/", mode::IFDIR | 0o755, 0);

    let (_, outcome) = run(
        &server,
        Record::new(RecordOperation::Create, NS)
            .with_path("/l")
            .with_stat(DentryStat {
                mode: mode::IFLNK | 0o777,
                ..Default::default()
            })
            .with_link("/target/file"),
    );
    assert!(outcome.is_ok());

    let (record, outcome) = run(
        &server,
        Record::new(RecordOperation::ReadLink, NS).with_path("/l"),
    );
    assert!(outcome.is_ok());
    assert_eq!(record.output.link.as_deref(), Some("/target/file"));

    // read-link on a regular file is invalid.
    create(&server, "/f", mode::IFREG | 0o644, 0);
    let (_, outcome) = run(
        &server,
        Record::new(RecordOperation::ReadLink, NS).with_path("/f"),
    );
    assert_eq!(outcome.errno, Some(Errno::EINVAL));

    server.stop();
}

#[test]
fn replication_acknowledgements_balance() {
    let server = MetaServer::start(ServerConfig {
        data_threads: 1,
        ..Default::default()
    })
    .unwrap();
    create(&server, "/", mode::IFDIR | 0o755, 0);
    let follower_a = server.producer().register_follower("a");
    let follower_b = server.producer().register_follower("b");

    let mut waiters = Vec::new();
    let mut versions = Vec::new();
    for i in 0..5 {
        let waiter = RpcWaiter::new();
        let (record, outcome) = run(
            &server,
            Record::new(RecordOperation::Create, NS)
                .with_path(&format!("/f{i}"))
                .with_stat(DentryStat {
                    mode: mode::IFREG | 0o644,
                    ..Default::default()
                })
                .with_waiter(waiter.clone()),
        );
        assert!(outcome.is_ok());
        versions.push(record.data_version);
        waiters.push(waiter);
    }

    assert_eq!(follower_a.take_pending().len(), 5);
    assert_eq!(follower_a.waiting_count(), 5);

    // Acks arrive out of order on one follower, in order on the other.
    follower_a.ack(versions[2]).unwrap();
    for &v in &[versions[1], versions[0], versions[3], versions[4]] {
        follower_a.ack(v).unwrap();
    }
    for &v in &versions {
        follower_b.ack(v).unwrap();
    }

    for waiter in &waiters {
        assert!(waiter.wait_ready(Duration::from_secs(1)));
        assert_eq!(waiter.waiting_count(), 0);
    }
    assert_eq!(follower_a.waiting_count(), 0);
    assert_eq!(follower_b.waiting_count(), 0);

    server.stop();
}

#[test]
fn remove_by_inode_route_is_rejected() {
    let server = MetaServer::start(ServerConfig::default()).unwrap();
    create(&server, "/", mode::IFDIR | 0o755, 0);
    let file = create(&server, "/f", mode::IFREG | 0o644, 0);

    let record = Record::new(RecordOperation::Remove, NS).with_inode(file.inode);
    assert_eq!(record.dentry_type, DentryRouteType::Inode);
    let (_, outcome) = run(&server, record);
    assert_eq!(outcome.errno, Some(Errno::EINVAL));

    server.stop();
}
