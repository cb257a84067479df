// SPDX-License-Identifier: MPL-2.0

//! Change notification.
//!
//! Every successful mutation fans out into at most
//! [`MAX_MSGS_PER_EVENT`] field-level messages describing which
//! piece-fields of which dentries changed. A collector thread merges the
//! messages of each event per inode and feeds the data-sync dispatcher.

pub mod serializer;

use std::{thread, time::Duration};

use crate::{
    meta::{
        dentry::Dentry,
        types::{NotifyField, OpType, PieceField, RenameFlags, SetStatFlags},
    },
    prelude::*,
    record::{Record, RecordOperation},
    shard::{queue::BatchQueue, ServerVersions, Shutdown},
    storage::{data_sync::DataSyncPool, types::DbUpdateDentry},
};

use self::serializer::BufferPool;

/// Hard bound of messages per event; the merge path preallocates on it.
/// A cross-parent exchange emits six messages and an overwriting
/// cross-parent move of a hard link seven, so eight covers the worst
/// case with room for the terminating invariant checks.
pub const MAX_MSGS_PER_EVENT: usize = 8;

/// Child reference carried by children-field messages. A `None` name
/// reports a removal from the parent.
pub struct ChildRef {
    pub id: u64,
    pub name: Option<String>,
}

pub struct ChangeNotifyMessage {
    /// Globally monotonic event id, assigned when the event is sealed.
    pub id: u64,
    /// The dentry whose piece-field changed; held until persistence is
    /// done with it.
    pub dentry: Arc<Dentry>,
    pub op: OpType,
    pub field: NotifyField,
    /// Allocated-space delta this message carries downstream.
    pub alloc_delta: i64,
    pub child: Option<ChildRef>,
    pub buffer: Option<Vec<u8>>,
}

impl ChangeNotifyMessage {
    fn new(dentry: Arc<Dentry>, op: OpType, field: NotifyField, alloc_delta: i64) -> Self {
        Self {
            id: 0,
            dentry,
            op,
            field,
            alloc_delta,
            child: None,
            buffer: None,
        }
    }
}

/// One mutation's worth of messages. The message array is inline and
/// never grows.
pub struct ChangeNotifyEvent {
    pub version: u64,
    messages: [Option<ChangeNotifyMessage>; MAX_MSGS_PER_EVENT],
    count: usize,
}

impl ChangeNotifyEvent {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            messages: Default::default(),
            count: 0,
        }
    }

    fn push(&mut self, message: ChangeNotifyMessage) {
        assert!(self.count < MAX_MSGS_PER_EVENT, "notify event overflow");
        self.messages[self.count] = Some(message);
        self.count += 1;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeNotifyMessage> {
        self.messages.iter().filter_map(|m| m.as_ref())
    }

    pub fn drain(&mut self) -> impl Iterator<Item = ChangeNotifyMessage> + '_ {
        self.count = 0;
        self.messages.iter_mut().filter_map(|m| m.take())
    }
}

fn add_to_parent_message(event: &mut ChangeNotifyEvent, dentry: &Arc<Dentry>, op: OpType) {
    let Some(parent) = dentry.parent() else {
        return;
    };
    let mut msg =
        ChangeNotifyMessage::new(parent, op, NotifyField::Piece(PieceField::Children), 0);
    msg.child = Some(ChildRef {
        id: dentry.inode(),
        name: Some(dentry.name()),
    });
    event.push(msg);
}

fn remove_from_parent_message(
    event: &mut ChangeNotifyEvent,
    parent: Option<Arc<Dentry>>,
    inode: u64,
) {
    let Some(parent) = parent else {
        return;
    };
    let mut msg = ChangeNotifyMessage::new(
        parent,
        OpType::Remove,
        NotifyField::Piece(PieceField::Children),
        0,
    );
    msg.child = Some(ChildRef { id: inode, name: None });
    event.push(msg);
}

/// Removal group: drop from the parent's children, then a virtual
/// remove that carries the negative alloc so space accounting
/// self-corrects.
fn remove_dentry_messages(event: &mut ChangeNotifyEvent, dentry: &Arc<Dentry>) {
    remove_from_parent_message(event, dentry.parent(), dentry.inode());
    let alloc = dentry.stat().alloc;
    event.push(ChangeNotifyMessage::new(
        dentry.clone(),
        OpType::Remove,
        NotifyField::ForRemove,
        if alloc > 0 { -alloc } else { 0 },
    ));
}

fn dentry_messages(event: &mut ChangeNotifyEvent, dentry: &Arc<Dentry>, op: OpType) {
    add_to_parent_message(event, dentry, OpType::Create);
    event.push(ChangeNotifyMessage::new(
        dentry.clone(),
        op,
        NotifyField::Piece(PieceField::Basic),
        0,
    ));
}

fn move_dentry_messages(
    event: &mut ChangeNotifyEvent,
    old_parent: Option<Arc<Dentry>>,
    dentry: &Arc<Dentry>,
) {
    remove_from_parent_message(event, old_parent, dentry.inode());
    dentry_messages(event, dentry, OpType::Update);
}

fn affected_messages(event: &mut ChangeNotifyEvent, record: &Record) {
    for affected in record.affected.iter() {
        match affected.op {
            OpType::Remove => remove_dentry_messages(event, &affected.dentry),
            _ => event.push(ChangeNotifyMessage::new(
                affected.dentry.clone(),
                OpType::Update,
                NotifyField::Piece(PieceField::Basic),
                0,
            )),
        }
    }
}

fn remove_messages(event: &mut ChangeNotifyEvent, record: &Record) {
    let me = record.me.dentry.as_ref();
    let mut removed = false;
    for affected in record.affected.iter() {
        match affected.op {
            OpType::Remove => {
                if me.is_some_and(|d| Arc::ptr_eq(d, &affected.dentry)) {
                    removed = true;
                }
                remove_dentry_messages(event, &affected.dentry);
            }
            _ => event.push(ChangeNotifyMessage::new(
                affected.dentry.clone(),
                OpType::Update,
                NotifyField::Piece(PieceField::Basic),
                0,
            )),
        }
    }

    if !removed {
        if let Some(me) = me {
            remove_from_parent_message(event, me.parent(), me.inode());
        }
    }
}

fn rename_messages(event: &mut ChangeNotifyEvent, record: &Record) {
    let src = record.rename.src.dentry.as_ref().unwrap();
    let src_parent = record.rename.src.parent.clone();

    if record.flags.contains(RenameFlags::EXCHANGE) {
        let dest = record.rename.dest.dentry.as_ref().unwrap();
        let dest_parent = record.rename.dest.parent.clone();
        let same_parent = match (&src_parent, &dest_parent) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        if same_parent {
            add_to_parent_message(event, src, OpType::Update);
            add_to_parent_message(event, dest, OpType::Update);
            event.push(ChangeNotifyMessage::new(
                src.clone(),
                OpType::Update,
                NotifyField::Piece(PieceField::Basic),
                0,
            ));
            event.push(ChangeNotifyMessage::new(
                dest.clone(),
                OpType::Update,
                NotifyField::Piece(PieceField::Basic),
                0,
            ));
        } else {
            move_dentry_messages(event, src_parent, src);
            move_dentry_messages(event, dest_parent, dest);
        }
        return;
    }

    if !record.affected.is_empty() {
        affected_messages(event, record);
    }
    let still_in_src_parent = match (&src.parent(), &src_parent) {
        (Some(now), Some(was)) => Arc::ptr_eq(now, was),
        _ => false,
    };
    if still_in_src_parent {
        add_to_parent_message(event, src, OpType::Update);
        event.push(ChangeNotifyMessage::new(
            src.clone(),
            OpType::Update,
            NotifyField::Piece(PieceField::Basic),
            0,
        ));
    } else {
        move_dentry_messages(event, src_parent, src);
    }
}

/// Builds the change-notify event for a completed mutation record and
/// seals it: every message gets an event id and, unless it is a removal
/// or a children-field message, a packed buffer.
pub fn build_event(
    record: &Record,
    versions: &ServerVersions,
    pool: &BufferPool,
) -> Result<ChangeNotifyEvent> {
    let mut event = ChangeNotifyEvent::new(record.data_version);

    match record.operation {
        RecordOperation::Create => {
            if !record.affected.is_empty() {
                affected_messages(&mut event, record);
            }
            let me = record.me.dentry.as_ref().unwrap();
            dentry_messages(&mut event, me, OpType::Create);
        }
        RecordOperation::Update | RecordOperation::SetDentrySize => {
            let me = record.me.dentry.as_ref().unwrap();
            let alloc_delta = if record.options.contains(SetStatFlags::INC_ALLOC) {
                record.stat.alloc
            } else {
                0
            };
            event.push(ChangeNotifyMessage::new(
                me.clone(),
                OpType::Update,
                NotifyField::Piece(PieceField::Basic),
                alloc_delta,
            ));
        }
        RecordOperation::SetXattr | RecordOperation::RemoveXattr => {
            let me = record.me.dentry.as_ref().unwrap().follow();
            event.push(ChangeNotifyMessage::new(
                me,
                OpType::Update,
                NotifyField::Piece(PieceField::Xattr),
                0,
            ));
        }
        RecordOperation::Remove => remove_messages(&mut event, record),
        RecordOperation::Rename => rename_messages(&mut event, record),
        _ => {}
    }

    // Seal: assign event ids and pack the payloads.
    for i in 0..event.count {
        let msg = event.messages[i].as_mut().unwrap();
        msg.id = versions.next_event();
        let packable = msg.op != OpType::Remove
            && !matches!(msg.field, NotifyField::Piece(PieceField::Children));
        if packable {
            if let NotifyField::Piece(field) = msg.field {
                msg.buffer = serializer::pack(&msg.dentry, field, pool)?;
            }
        }
    }
    Ok(event)
}

/// The change-notify collector: receives sealed events, merges each
/// event's messages per inode and hands the result to data sync.
pub struct ChangeNotify {
    queue: Arc<BatchQueue<ChangeNotifyEvent>>,
    pool: Arc<BufferPool>,
    handle: std::sync::Mutex<Option<thread::JoinHandle<()>>>,
}

impl ChangeNotify {
    pub fn start(
        sync: Arc<DataSyncPool>,
        pool: Arc<BufferPool>,
        shutdown: Shutdown,
    ) -> Arc<Self> {
        let queue = Arc::new(BatchQueue::new());
        let worker_queue = queue.clone();
        let merge_pool = pool.clone();
        let handle = thread::Builder::new()
            .name("chg-notify".to_string())
            .spawn(move || {
                while shutdown.should_continue() {
                    let (events, terminated) = worker_queue.pop_all(Duration::from_secs(1));
                    for mut event in events {
                        for dentry in Self::merge_event(&mut event, &merge_pool) {
                            sync.dispatch(dentry);
                        }
                    }
                    if terminated {
                        break;
                    }
                }
            })
            .expect("spawn change-notify thread");

        Arc::new(Self {
            queue,
            pool,
            handle: std::sync::Mutex::new(Some(handle)),
        })
    }

    /// Enqueues one sealed event. The error-on-exhaustion contract is
    /// kept for callers even though this queue cannot fill today.
    pub fn push(&self, event: ChangeNotifyEvent) -> Result<()> {
        self.queue.push(event);
        Ok(())
    }

    /// Terminates the collector and waits for its final drain, so every
    /// event submitted before this call reaches data sync.
    pub fn terminate(&self) {
        self.queue.terminate();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Groups an event's messages by inode into per-dentry updates.
    /// Within one inode the last message per piece-field wins; a removal
    /// dominates everything else.
    fn merge_event(event: &mut ChangeNotifyEvent, pool: &BufferPool) -> Vec<DbUpdateDentry> {
        let version = event.version;
        let mut merged: Vec<DbUpdateDentry> = Vec::with_capacity(event.len());

        for msg in event.drain() {
            let inode = msg.dentry.inode();
            let index = match merged.iter().position(|e| e.inode == inode) {
                Some(index) => {
                    merged[index].merge_count += 1;
                    index
                }
                None => {
                    merged.push(DbUpdateDentry::new(version, inode, msg.id));
                    merged.len() - 1
                }
            };
            let entry = &mut merged[index];

            entry.msg_count += 1;
            entry.event_id = entry.event_id.max(msg.id);
            entry.alloc_delta += msg.alloc_delta;

            match msg.field {
                NotifyField::ForRemove => {
                    entry.op = OpType::Remove;
                    for field in entry.fields.iter_mut() {
                        if let Some(buffer) = field.take() {
                            pool.release(buffer);
                        }
                    }
                }
                NotifyField::Piece(field) => {
                    if entry.op != OpType::Remove {
                        if msg.op == OpType::Create && entry.op != OpType::Create {
                            entry.op = OpType::Create;
                        }
                        let buffer = match (field, msg.buffer) {
                            // Children messages carry deltas; the stored
                            // form is the live children list, packed here.
                            (PieceField::Children, None) => {
                                serializer::pack(&msg.dentry, PieceField::Children, pool)
                                    .unwrap_or(None)
                            }
                            (_, buffer) => buffer,
                        };
                        if let Some(old) = core::mem::replace(
                            &mut entry.fields[field.index()],
                            buffer,
                        ) {
                            pool.release(old);
                        }
                    }
                }
            }

            entry.holds.push(msg.dentry);
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{shard::free_queue::DelayFreeQueue, testkit};

    fn versions() -> ServerVersions {
        ServerVersions::default()
    }

    fn count_children_msgs(event: &ChangeNotifyEvent) -> usize {
        event
            .iter()
            .filter(|m| matches!(m.field, NotifyField::Piece(PieceField::Children)))
            .count()
    }

    #[test]
    fn create_emits_parent_and_basic() {
        let env = testkit::TestTree::new();
        env.mkdir("/");
        env.mkdir("/a");

        let mut record = env.create_record("/a/b", crate::meta::types::mode::IFREG | 0o644, 5);
        env.resolve_parent_for_create(&mut record).unwrap();
        env.mgr.create(&mut record).unwrap();
        record.data_version = 7;

        let versions = versions();
        let pool = BufferPool::default();
        let event = build_event(&record, &versions, &pool).unwrap();

        assert_eq!(event.version, 7);
        assert_eq!(event.len(), 2);
        let msgs: Vec<_> = event.iter().collect();
        // add-to-parent first, then the new dentry's basic field.
        assert!(matches!(msgs[0].field, NotifyField::Piece(PieceField::Children)));
        assert_eq!(msgs[0].op, OpType::Create);
        let child = msgs[0].child.as_ref().unwrap();
        assert_eq!(child.name.as_deref(), Some("b"));
        assert!(msgs[0].buffer.is_none());

        assert!(matches!(msgs[1].field, NotifyField::Piece(PieceField::Basic)));
        assert!(msgs[1].buffer.is_some());
        // Event ids are monotonic.
        assert!(msgs[0].id < msgs[1].id);
    }

    #[test]
    fn remove_emits_remove_group() {
        let env = testkit::TestTree::new();
        env.mkdir("/");
        let file = env.mkfile("/f", 4);
        file.update_stat(|s| s.alloc = 4096);

        let mut record = env.remove_record("/f");
        let mut free = DelayFreeQueue::new(0);
        env.mgr.remove(&mut record, &mut free).unwrap();
        record.data_version = 9;

        let versions = versions();
        let pool = BufferPool::default();
        let event = build_event(&record, &versions, &pool).unwrap();

        // remove-from-parent + virtual remove.
        assert_eq!(event.len(), 2);
        let msgs: Vec<_> = event.iter().collect();
        let child = msgs[0].child.as_ref().unwrap();
        assert_eq!(child.id, file.inode());
        assert!(child.name.is_none());
        assert!(matches!(msgs[1].field, NotifyField::ForRemove));
        assert_eq!(msgs[1].alloc_delta, -4096);
        assert!(msgs[1].buffer.is_none());
    }

    #[test]
    fn exchange_across_parents_emits_two_moves() {
        let env = testkit::TestTree::new();
        env.mkdir("/");
        env.mkdir("/a");
        env.mkdir("/b");
        env.mkfile("/a/x", 1);
        env.mkfile("/b/y", 2);

        let mut record = env.rename_record("/a/x", "/b/y", RenameFlags::EXCHANGE);
        let mut free = DelayFreeQueue::new(0);
        env.mgr.rename(&mut record, &mut free).unwrap();
        record.data_version = 11;

        let versions = versions();
        let pool = BufferPool::default();
        let event = build_event(&record, &versions, &pool).unwrap();

        // Two full move sequences: worst case short of an overwrite.
        assert_eq!(event.len(), 6);
        assert_eq!(count_children_msgs(&event), 4);
    }

    #[test]
    fn overwriting_hardlink_move_fits_the_bound() {
        let env = testkit::TestTree::new();
        env.mkdir("/");
        env.mkdir("/a");
        env.mkdir("/b");
        env.mkfile("/a/x", 1);
        let src = env.mkfile("/b/src", 2);
        env.hardlink("/b/y", &src);
        // Make the hard link the last holder so its removal also kills
        // the source.
        let mut record = env.remove_record("/b/src");
        let mut free = DelayFreeQueue::new(0);
        env.mgr.remove(&mut record, &mut free).unwrap();

        let mut record = env.rename_record("/a/x", "/b/y", RenameFlags::empty());
        env.mgr.rename(&mut record, &mut free).unwrap();
        record.data_version = 12;

        let versions = versions();
        let pool = BufferPool::default();
        let event = build_event(&record, &versions, &pool).unwrap();
        // Affected remove groups (2 + 2) plus the cross-parent move (3).
        assert_eq!(event.len(), 7);
    }

    #[test]
    fn merge_groups_by_inode() {
        let env = testkit::TestTree::new();
        env.mkdir("/");
        env.mkdir("/a");

        let mut record = env.create_record("/a/b", crate::meta::types::mode::IFREG | 0o644, 5);
        env.resolve_parent_for_create(&mut record).unwrap();
        env.mgr.create(&mut record).unwrap();
        record.data_version = 13;

        let versions = versions();
        let pool = BufferPool::default();
        let mut event = build_event(&record, &versions, &pool).unwrap();
        let merged = ChangeNotify::merge_event(&mut event, &pool);

        // Parent (children) and the new dentry (basic).
        assert_eq!(merged.len(), 2);
        let parent = env.mgr.find_by_path("fs", "/a", true).unwrap();
        let by_inode = |inode| merged.iter().find(|m| m.inode == inode).unwrap();

        let parent_update = by_inode(parent.inode());
        assert!(parent_update.fields[PieceField::Children.index()].is_some());
        let child_create = by_inode(record.inode);
        assert_eq!(child_create.op, OpType::Create);
        assert!(child_create.fields[PieceField::Basic.index()].is_some());
    }
}
