//! The replication queue: ordered, reference-counted change records shared
//! by the log ingestor (single producer) and every replica worker.
//!
//! Records live in an arena addressed by absolute position. A position is
//! assigned once at append time and never reused, so a worker's cursor stays
//! valid while other records are appended or freed. Records are freed
//! strictly from the head, and only once every replica has released them.

use crate::error::ParseError;
use crate::record::{ChangeRecord, ReplicaId, Stamp};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// When the private log should be compacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrimPolicy {
    /// Minimum seconds between two trims.
    pub interval_secs: u64,
    /// Minimum number of records freed since the last trim.
    pub min_deleted: usize,
}

impl Default for TrimPolicy {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            min_deleted: 50,
        }
    }
}

/// Which records [`ReplicationQueue::count`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountFilter {
    /// Every record still held by the queue.
    All,
    /// Records some replica has not released yet.
    Pending,
}

/// A record together with its queue position and outstanding references.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Absolute position of the record.
    pub position: u64,
    /// The record.
    pub record: Arc<ChangeRecord>,
    /// Number of replicas that have not released it yet.
    pub refcnt: usize,
}

struct Slot {
    record: Arc<ChangeRecord>,
    refcnt: usize,
}

struct QueueState {
    slots: VecDeque<Slot>,
    /// Absolute position of `slots[0]`.
    base: u64,
    /// Stamp of the most recently appended record, kept after it is freed.
    last: Option<Stamp>,
    deleted_since_trim: usize,
    last_trim: u64,
    /// No further appends will happen (one-shot runs).
    closed: bool,
    warned: HashSet<ReplicaId>,
}

impl QueueState {
    fn end(&self) -> u64 {
        self.base + self.slots.len() as u64
    }

    fn slot(&self, position: u64) -> Option<&Slot> {
        let index = position.checked_sub(self.base)?;
        self.slots.get(usize::try_from(index).ok()?)
    }

    fn entry(&self, position: u64) -> Option<QueueEntry> {
        self.slot(position).map(|slot| QueueEntry {
            position,
            record: Arc::clone(&slot.record),
            refcnt: slot.refcnt,
        })
    }

    fn free_head(&mut self) -> bool {
        match self.slots.front() {
            Some(slot) if slot.refcnt == 0 => {
                self.slots.pop_front();
                self.base += 1;
                self.deleted_since_trim += 1;
                true
            }
            _ => false,
        }
    }
}

/// Queue of change records shared by the ingestor and the replica workers.
pub struct ReplicationQueue {
    state: Mutex<QueueState>,
    more: Condvar,
    shutdown: AtomicBool,
    replicas: Vec<ReplicaId>,
    policy: TrimPolicy,
}

/// A locked view of the queue for multi-step traversals.
///
/// Appends and frees are blocked while the view is alive.
pub struct QueueView<'a> {
    state: MutexGuard<'a, QueueState>,
}

impl QueueView<'_> {
    /// The oldest record still held.
    pub fn peek_head(&self) -> Option<QueueEntry> {
        self.state.entry(self.state.base)
    }

    /// The record following `position`.
    pub fn advance(&self, position: u64) -> Option<QueueEntry> {
        self.state.entry(position.max(self.state.base.saturating_sub(1)) + 1)
    }

    /// The record at `position`, if it is still held.
    pub fn get(&self, position: u64) -> Option<QueueEntry> {
        self.state.entry(position)
    }

    /// Iterate over every held record, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = QueueEntry> + '_ {
        let base = self.state.base;
        self.state
            .slots
            .iter()
            .enumerate()
            .map(move |(i, slot)| QueueEntry {
                position: base + i as u64,
                record: Arc::clone(&slot.record),
                refcnt: slot.refcnt,
            })
    }
}

impl ReplicationQueue {
    /// Create an empty queue for the given configured replicas.
    pub fn new(replicas: Vec<ReplicaId>, policy: TrimPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                slots: VecDeque::new(),
                base: 0,
                last: None,
                deleted_since_trim: 0,
                last_trim: now_secs(),
                closed: false,
                warned: HashSet::new(),
            }),
            more: Condvar::new(),
            shutdown: AtomicBool::new(false),
            replicas,
            policy,
        }
    }

    /// The configured replicas; each new record starts with one reference per replica.
    pub fn replicas(&self) -> &[ReplicaId] {
        &self.replicas
    }

    /// The trim policy in force.
    pub fn policy(&self) -> TrimPolicy {
        self.policy
    }

    /// Parse `raw` and append it at the tail.
    ///
    /// The queue is left untouched when parsing fails. Returns the stamp the
    /// record was queued with.
    pub fn append(&self, raw: &str) -> Result<Stamp, ParseError> {
        let record = ChangeRecord::parse(raw)?;
        Ok(self.append_record(record))
    }

    /// Append an already parsed record at the tail.
    ///
    /// Targets that are not configured replicas are dropped with a one-time
    /// warning. The sequence number is adjusted so that stamps stay strictly
    /// increasing along the queue.
    pub fn append_record(&self, mut record: ChangeRecord) -> Stamp {
        let mut state = self.state.lock();

        let mut targets = Vec::with_capacity(record.targets.len());
        for target in record.targets.drain(..) {
            if self.replicas.contains(&target) {
                targets.push(target);
            } else if state.warned.insert(target.clone()) {
                warn!(
                    "replica {} named in the replication log is not configured, ignoring it",
                    target
                );
            }
        }
        record.targets = targets;

        if let Some(last) = state.last {
            let parsed = record.stamp;
            if parsed.timestamp == last.timestamp {
                record.stamp.sequence = parsed.sequence.max(last.sequence.saturating_add(1));
            } else if parsed.timestamp < last.timestamp {
                record.stamp = last.next_in_second();
                warn!(
                    "record for {} has time {} before previous record {}, queued as {}",
                    record.dn, parsed, last, record.stamp
                );
            }
        }
        let stamp = record.stamp;
        state.last = Some(stamp);
        state.slots.push_back(Slot {
            record: Arc::new(record),
            refcnt: self.replicas.len(),
        });
        drop(state);
        self.more.notify_all();
        stamp
    }

    /// Lock the queue for a traversal.
    pub fn view(&self) -> QueueView<'_> {
        QueueView {
            state: self.state.lock(),
        }
    }

    /// Absolute position of the head record (or of the next append when empty).
    pub fn head_position(&self) -> u64 {
        self.state.lock().base
    }

    /// Position the next appended record will get.
    pub fn end_position(&self) -> u64 {
        self.state.lock().end()
    }

    /// Block until the record at `position` exists and return it.
    ///
    /// Returns `None` on shutdown, or when the queue has been closed and no
    /// record will ever appear at `position`.
    pub fn wait_for(&self, position: u64) -> Option<Arc<ChangeRecord>> {
        let mut state = self.state.lock();
        loop {
            if self.is_shut_down() {
                return None;
            }
            if let Some(slot) = state.slot(position) {
                return Some(Arc::clone(&slot.record));
            }
            if state.closed && position >= state.end() {
                return None;
            }
            self.more.wait(&mut state);
        }
    }

    /// Drop one replica's reference on the record at `position`.
    ///
    /// The record is freed right away when this was the last reference and
    /// it is the head; otherwise it stays until [`garbage_collect`](Self::garbage_collect).
    pub fn release(&self, position: u64) {
        let mut state = self.state.lock();
        let base = state.base;
        let Some(index) = position
            .checked_sub(base)
            .and_then(|i| usize::try_from(i).ok())
        else {
            return;
        };
        let Some(slot) = state.slots.get_mut(index) else {
            return;
        };
        slot.refcnt = slot.refcnt.saturating_sub(1);
        if slot.refcnt == 0 && index == 0 {
            state.free_head();
        }
    }

    /// Free head records while nobody references them. Returns how many were freed.
    pub fn garbage_collect(&self) -> usize {
        let mut state = self.state.lock();
        let mut freed = 0;
        while state.free_head() {
            freed += 1;
        }
        freed
    }

    /// Whether the private log is due for compaction at time `now`.
    pub fn needs_trim(&self, now: u64) -> bool {
        let state = self.state.lock();
        now.saturating_sub(state.last_trim) > self.policy.interval_secs
            && state.deleted_since_trim >= self.policy.min_deleted
    }

    /// Serialize every record some replica still needs, oldest first.
    ///
    /// Queue membership is not changed. Resets the trim bookkeeping and
    /// returns the number of bytes written.
    pub fn rewrite_to<W: Write>(&self, out: &mut W, now: u64) -> io::Result<u64> {
        let live: Vec<Arc<ChangeRecord>> = {
            let mut view = self.view();
            let live = view
                .iter()
                .filter(|entry| entry.refcnt > 0)
                .map(|entry| entry.record)
                .collect();
            view.state.deleted_since_trim = 0;
            view.state.last_trim = now;
            live
        };
        let mut written = 0u64;
        for record in &live {
            let text = record.to_ldif();
            out.write_all(text.as_bytes())?;
            written += text.len() as u64;
        }
        out.flush()?;
        debug!("rewrote {} live records ({} bytes)", live.len(), written);
        Ok(written)
    }

    /// Write a human-readable listing of every queued record, oldest first.
    ///
    /// The queue stays locked for the whole listing, so the positions and
    /// reference counts form one consistent snapshot. Returns the number of
    /// records listed.
    pub fn dump<W: Write>(&self, out: &mut W) -> io::Result<usize> {
        let view = self.view();
        let state = &view.state;
        writeln!(
            out,
            "queue: head {} end {} records {}{}",
            state.base,
            state.end(),
            state.slots.len(),
            if state.closed { " (closed)" } else { "" }
        )?;
        for (offset, slot) in state.slots.iter().enumerate() {
            let record = &slot.record;
            writeln!(out, "entry {}", state.base + offset as u64)?;
            writeln!(out, "  refcnt: {}", slot.refcnt)?;
            writeln!(out, "  stamp: {}", record.stamp)?;
            writeln!(out, "  changetype: {}", record.kind().as_str())?;
            writeln!(out, "  dn: {}", record.dn)?;
            for target in &record.targets {
                writeln!(out, "  replica: {}", target)?;
            }
        }
        out.flush()?;
        Ok(state.slots.len())
    }

    /// Number of records matching `filter`.
    pub fn count(&self, filter: CountFilter) -> usize {
        let state = self.state.lock();
        match filter {
            CountFilter::All => state.slots.len(),
            CountFilter::Pending => state.slots.iter().filter(|s| s.refcnt > 0).count(),
        }
    }

    /// Number of records freed since the last trim.
    pub fn deleted_since_trim(&self) -> usize {
        self.state.lock().deleted_since_trim
    }

    /// Declare that nothing more will be appended; idle workers then stop.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.more.notify_all();
    }

    /// Set the shutdown flag and wake every waiting thread.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _state = self.state.lock();
        self.more.notify_all();
    }

    /// Whether shutdown has been requested.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless shutdown interrupts it.
    ///
    /// Returns `true` if the sleep ended because of shutdown.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut state = self.state.lock();
        while !self.is_shut_down() {
            if self.more.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        self.is_shut_down()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Change;

    fn host(name: &str) -> ReplicaId {
        ReplicaId::new(name, 389)
    }

    fn raw(replicas: &[&str], time: &str, dn: &str) -> String {
        let mut text = String::new();
        for r in replicas {
            text.push_str(&format!("replica: {}\n", r));
        }
        text.push_str(&format!("time: {}\ndn: {}\nchangetype: delete\n", time, dn));
        text
    }

    fn queue(replicas: &[&str]) -> ReplicationQueue {
        ReplicationQueue::new(
            replicas.iter().map(|r| ReplicaId::parse(r).unwrap()).collect(),
            TrimPolicy::default(),
        )
    }

    mod append {
        use super::*;

        #[test]
        fn test_append_sets_refcount_to_replica_count() {
            let q = queue(&["host1", "host2"]);
            q.append(&raw(&["host1"], "1000", "cn=a")).unwrap();
            let head = q.view().peek_head().unwrap();
            assert_eq!(head.refcnt, 2);
            assert_eq!(head.record.targets, vec![host("host1")]);
        }

        #[test]
        fn test_malformed_record_leaves_queue_untouched() {
            let q = queue(&["host1"]);
            assert!(q.append("time: 1\nchangetype: delete\n").is_err());
            assert_eq!(q.count(CountFilter::All), 0);
            assert_eq!(q.end_position(), 0);
        }

        #[test]
        fn test_multibyte_garbage_is_rejected_not_fatal() {
            let q = queue(&["host1"]);
            assert!(q.append("abcdefé: x\ntime: 1\n").is_err());
            // the queue keeps accepting records afterwards
            q.append(&raw(&["host1"], "1000", "cn=a")).unwrap();
            assert_eq!(q.count(CountFilter::All), 1);
        }

        #[test]
        fn test_same_timestamp_gets_next_sequence() {
            let q = queue(&["host1"]);
            let first = q.append(&raw(&["host1"], "2000", "cn=a")).unwrap();
            let second = q.append(&raw(&["host1"], "2000", "cn=b")).unwrap();
            assert_eq!(first, Stamp::new(2000, 0));
            assert_eq!(second, Stamp::new(2000, first.sequence + 1));

            let view = q.view();
            let head = view.peek_head().unwrap();
            let next = view.advance(head.position).unwrap();
            assert_eq!(head.record.dn, "cn=a");
            assert_eq!(next.record.dn, "cn=b");
            assert!(view.advance(next.position).is_none());
        }

        #[test]
        fn test_parsed_sequence_kept_when_newer() {
            let q = queue(&["host1"]);
            q.append(&raw(&["host1"], "2000.4", "cn=a")).unwrap();
            let stamp = q.append(&raw(&["host1"], "2000.9", "cn=b")).unwrap();
            assert_eq!(stamp, Stamp::new(2000, 9));
            let stamp = q.append(&raw(&["host1"], "2001.3", "cn=c")).unwrap();
            assert_eq!(stamp, Stamp::new(2001, 3));
        }

        #[test]
        fn test_clock_going_backwards_is_restamped() {
            let q = queue(&["host1"]);
            q.append(&raw(&["host1"], "3000", "cn=a")).unwrap();
            let stamp = q.append(&raw(&["host1"], "2500", "cn=b")).unwrap();
            assert_eq!(stamp, Stamp::new(3000, 1));
        }

        #[test]
        fn test_last_stamp_survives_free() {
            let q = queue(&["host1"]);
            q.append(&raw(&["host1"], "2000", "cn=a")).unwrap();
            q.release(0);
            assert_eq!(q.count(CountFilter::All), 0);
            let stamp = q.append(&raw(&["host1"], "2000", "cn=b")).unwrap();
            assert_eq!(stamp, Stamp::new(2000, 1));
        }

        #[test]
        fn test_unknown_replica_is_dropped() {
            let q = queue(&["host1"]);
            q.append(&raw(&["host1", "stranger:1389"], "1", "cn=a")).unwrap();
            q.append(&raw(&["stranger:1389"], "2", "cn=b")).unwrap();
            let view = q.view();
            let records: Vec<_> = view.iter().collect();
            assert_eq!(records[0].record.targets, vec![host("host1")]);
            assert!(records[1].record.targets.is_empty());
        }
    }

    mod refcount {
        use super::*;

        #[test]
        fn test_only_head_is_freed() {
            let q = queue(&["host1"]);
            q.append(&raw(&["host1"], "1", "cn=a")).unwrap();
            q.append(&raw(&["host1"], "2", "cn=b")).unwrap();

            // second record finished first: stays in place behind the head
            q.release(1);
            assert_eq!(q.count(CountFilter::All), 2);
            assert_eq!(q.count(CountFilter::Pending), 1);

            q.release(0);
            assert_eq!(q.head_position(), 1);
            assert_eq!(q.count(CountFilter::All), 1);

            assert_eq!(q.garbage_collect(), 1);
            assert_eq!(q.count(CountFilter::All), 0);
            assert_eq!(q.deleted_since_trim(), 2);
        }

        #[test]
        fn test_record_waits_for_every_replica() {
            let q = queue(&["host1", "host2"]);
            q.append(&raw(&["host1"], "1", "cn=a")).unwrap();
            q.release(0);
            assert_eq!(q.garbage_collect(), 0);
            assert_eq!(q.view().peek_head().unwrap().refcnt, 1);
            q.release(0);
            assert_eq!(q.count(CountFilter::All), 0);
        }

        #[test]
        fn test_zero_replicas_record_is_collectable() {
            let q = queue(&[]);
            q.append(&raw(&["host1"], "1", "cn=a")).unwrap();
            assert_eq!(q.count(CountFilter::Pending), 0);
            assert_eq!(q.garbage_collect(), 1);
        }

        #[test]
        fn test_release_of_freed_position_is_ignored() {
            let q = queue(&["host1"]);
            q.append(&raw(&["host1"], "1", "cn=a")).unwrap();
            q.release(0);
            q.release(0);
            q.release(42);
            assert_eq!(q.deleted_since_trim(), 1);
        }
    }

    mod trim {
        use super::*;

        fn small_policy() -> TrimPolicy {
            TrimPolicy {
                interval_secs: 10,
                min_deleted: 2,
            }
        }

        #[test]
        fn test_needs_trim_requires_time_and_deletions() {
            let q = ReplicationQueue::new(vec![host("host1")], small_policy());
            let start = now_secs();
            for i in 0..3 {
                q.append(&raw(&["host1"], &format!("{}", i + 1), "cn=a")).unwrap();
            }
            assert!(!q.needs_trim(start + 100));
            q.release(0);
            q.release(1);
            assert!(!q.needs_trim(start + 5));
            assert!(q.needs_trim(start + 100));
        }

        #[test]
        fn test_rewrite_keeps_every_referenced_record() {
            let q = ReplicationQueue::new(vec![host("host1"), host("host2")], small_policy());
            for i in 0..4 {
                q.append(&raw(&["host1"], &format!("{}", i + 1), &format!("cn={}", i)))
                    .unwrap();
            }
            // cn=0 done by both, cn=2 done by both but stuck behind cn=1
            q.release(0);
            q.release(0);
            q.release(2);
            q.release(2);
            q.release(1);

            let mut out = Vec::new();
            let written = q.rewrite_to(&mut out, 1234).unwrap();
            assert_eq!(written, out.len() as u64);
            let text = String::from_utf8(out).unwrap();
            let dns: Vec<String> = text
                .split("\n\n")
                .filter(|p| !p.trim().is_empty())
                .map(|p| ChangeRecord::parse(p).unwrap().dn)
                .collect();
            assert_eq!(dns, vec!["cn=1".to_string(), "cn=3".to_string()]);
            assert_eq!(q.deleted_since_trim(), 0);
            assert!(!q.needs_trim(1234 + 5));

            // every record with an outstanding reference is still queued
            let view = q.view();
            assert!(view.iter().filter(|e| e.refcnt > 0).all(|e| {
                dns.contains(&e.record.dn)
            }));
            assert_eq!(view.peek_head().unwrap().record.dn, "cn=1");
        }

        #[test]
        fn test_rewritten_log_rereads_with_same_stamps() {
            let q = queue(&["host1"]);
            q.append(&raw(&["host1"], "2000", "cn=a")).unwrap();
            q.append(&raw(&["host1"], "2000", "cn=b")).unwrap();
            let mut out = Vec::new();
            q.rewrite_to(&mut out, now_secs()).unwrap();

            let text = String::from_utf8(out).unwrap();
            let reread = queue(&["host1"]);
            for paragraph in text.split("\n\n").filter(|p| !p.trim().is_empty()) {
                reread.append(paragraph).unwrap();
            }
            let stamps: Vec<Stamp> = reread.view().iter().map(|e| e.record.stamp).collect();
            assert_eq!(stamps, vec![Stamp::new(2000, 0), Stamp::new(2000, 1)]);
            assert!(matches!(reread.view().peek_head().unwrap().record.change, Change::Delete));
        }
    }

    mod dump {
        use super::*;

        #[test]
        fn test_dump_lists_positions_and_refcounts() {
            let q = queue(&["host1", "host2"]);
            q.append(&raw(&["host1"], "100", "cn=a")).unwrap();
            q.append(&raw(&["host1", "host2"], "100", "cn=é")).unwrap();
            q.append(&raw(&["host2"], "101", "cn=c")).unwrap();
            q.release(0);
            q.release(0);
            q.release(1);

            let mut out = Vec::new();
            let listed = q.dump(&mut out).unwrap();
            assert_eq!(listed, 2);
            let text = String::from_utf8(out).unwrap();
            assert_eq!(
                text,
                "queue: head 1 end 3 records 2\n\
                 entry 1\n  refcnt: 1\n  stamp: 100.1\n  changetype: delete\n  dn: cn=é\n\
                 \x20 replica: host1:389\n  replica: host2:389\n\
                 entry 2\n  refcnt: 2\n  stamp: 101.0\n  changetype: delete\n  dn: cn=c\n\
                 \x20 replica: host2:389\n"
            );
            // listing does not change membership
            assert_eq!(q.count(CountFilter::All), 2);
        }

        #[test]
        fn test_dump_of_empty_closed_queue() {
            let q = queue(&["host1"]);
            q.close();
            let mut out = Vec::new();
            assert_eq!(q.dump(&mut out).unwrap(), 0);
            assert_eq!(
                String::from_utf8(out).unwrap(),
                "queue: head 0 end 0 records 0 (closed)\n"
            );
        }
    }

    mod waiting {
        use super::*;
        use std::thread;

        #[test]
        fn test_wait_for_wakes_on_append() {
            let q = Arc::new(queue(&["host1"]));
            let waiter = {
                let q = Arc::clone(&q);
                thread::spawn(move || q.wait_for(0).map(|r| r.dn.clone()))
            };
            thread::sleep(Duration::from_millis(20));
            q.append(&raw(&["host1"], "1", "cn=a")).unwrap();
            assert_eq!(waiter.join().unwrap(), Some("cn=a".to_string()));
        }

        #[test]
        fn test_wait_for_returns_none_on_shutdown() {
            let q = Arc::new(queue(&["host1"]));
            let waiter = {
                let q = Arc::clone(&q);
                thread::spawn(move || q.wait_for(0).is_none())
            };
            thread::sleep(Duration::from_millis(20));
            q.shutdown();
            assert!(waiter.join().unwrap());
        }

        #[test]
        fn test_wait_for_returns_none_when_closed_and_drained() {
            let q = queue(&["host1"]);
            q.append(&raw(&["host1"], "1", "cn=a")).unwrap();
            q.close();
            assert!(q.wait_for(0).is_some());
            assert!(q.wait_for(1).is_none());
        }

        #[test]
        fn test_sleep_interrupted_by_shutdown() {
            let q = Arc::new(queue(&["host1"]));
            let sleeper = {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let start = Instant::now();
                    let interrupted = q.sleep(Duration::from_secs(30));
                    (interrupted, start.elapsed())
                })
            };
            thread::sleep(Duration::from_millis(20));
            q.shutdown();
            let (interrupted, elapsed) = sleeper.join().unwrap();
            assert!(interrupted);
            assert!(elapsed < Duration::from_secs(5));
        }

        #[test]
        fn test_sleep_times_out() {
            let q = queue(&["host1"]);
            assert!(!q.sleep(Duration::from_millis(10)));
        }
    }
}
