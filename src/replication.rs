//! # Replication Observers
//!
//! Fan-out of the WAL stream to subscribers. Each subscriber carries an
//! allow-list filter (namespaces, record kinds) and a bounded buffer;
//! delivery is at-least-once and in LSN order per namespace. When a slow
//! subscriber overflows its buffer the oldest records are dropped and the
//! next poll returns a resync marker instead of data, telling the follower
//! to re-sync from storage before resuming the stream.
//!
//! A terminal error (namespace invalidated, engine shutdown) closes every
//! subscription; observers must resubscribe.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, ErrorKind, Result};
use crate::wal::WalEntry;

/// Allow-list filter; `None` admits everything.
#[derive(Debug, Clone, Default)]
pub struct UpdatesFilter {
    pub namespaces: Option<Vec<String>>,
    pub kinds: Option<Vec<String>>,
}

impl UpdatesFilter {
    pub fn matches(&self, namespace: &str, entry: &WalEntry) -> bool {
        if let Some(ns) = &self.namespaces {
            if !ns.iter().any(|n| n == namespace) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.iter().any(|k| k == entry.record.kind_name()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRecord {
    pub namespace: String,
    pub entry: WalEntry,
}

/// One poll outcome: records in order, or a demand to resync.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdatesPoll {
    Records(Vec<UpdateRecord>),
    /// Buffer overflowed since the last poll; the follower must resync
    /// from storage before trusting the stream again.
    ResyncRequired,
}

struct Subscriber {
    filter: UpdatesFilter,
    buffer: Mutex<VecDeque<UpdateRecord>>,
    capacity: usize,
    overflowed: AtomicBool,
    closed: AtomicBool,
}

pub struct UpdatesHub {
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    capacity: usize,
}

impl UpdatesHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, filter: UpdatesFilter) -> UpdatesSubscription {
        let sub = Arc::new(Subscriber {
            filter,
            buffer: Mutex::new(VecDeque::new()),
            capacity: self.capacity,
            overflowed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.subscribers.write().push(sub.clone());
        UpdatesSubscription { sub }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver one WAL entry to every matching subscriber; drop-oldest on
    /// overflow. Dead subscriptions are pruned in passing.
    pub fn publish(&self, namespace: &str, entry: &WalEntry) {
        let mut dead = false;
        {
            let subs = self.subscribers.read();
            for sub in subs.iter() {
                if sub.closed.load(Ordering::Acquire) {
                    dead = true;
                    continue;
                }
                if !sub.filter.matches(namespace, entry) {
                    continue;
                }
                let mut buffer = sub.buffer.lock();
                if buffer.len() >= sub.capacity {
                    buffer.pop_front();
                    sub.overflowed.store(true, Ordering::Release);
                }
                buffer.push_back(UpdateRecord {
                    namespace: namespace.to_string(),
                    entry: entry.clone(),
                });
            }
        }
        if dead {
            self.subscribers
                .write()
                .retain(|s| !s.closed.load(Ordering::Acquire));
        }
    }

    /// Terminal close: every subscriber's next poll fails and must
    /// resubscribe.
    pub fn close_all(&self) {
        let mut subs = self.subscribers.write();
        for sub in subs.iter() {
            sub.closed.store(true, Ordering::Release);
        }
        subs.clear();
    }
}

pub struct UpdatesSubscription {
    sub: Arc<Subscriber>,
}

impl UpdatesSubscription {
    /// Drain buffered records. Overflow since the previous poll surfaces
    /// as a single resync marker (the dropped records are gone).
    pub fn poll(&self) -> Result<UpdatesPoll> {
        if self.sub.closed.load(Ordering::Acquire) {
            return Err(Error::new(
                ErrorKind::Replication,
                "updates stream closed, resubscribe",
            ));
        }
        if self.sub.overflowed.swap(false, Ordering::AcqRel) {
            self.sub.buffer.lock().clear();
            return Ok(UpdatesPoll::ResyncRequired);
        }
        let records = self.sub.buffer.lock().drain(..).collect();
        Ok(UpdatesPoll::Records(records))
    }

    pub fn unsubscribe(self) {
        self.sub.closed.store(true, Ordering::Release);
    }
}

impl Drop for UpdatesSubscription {
    fn drop(&mut self) {
        self.sub.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Lsn;
    use crate::wal::WalRecord;

    fn entry(counter: i64) -> WalEntry {
        WalEntry {
            lsn: Lsn::new(0, counter),
            record: WalRecord::TxBegin,
        }
    }

    #[test]
    fn records_arrive_in_lsn_order() {
        let hub = UpdatesHub::new(16);
        let sub = hub.subscribe(UpdatesFilter::default());
        hub.publish("books", &entry(1));
        hub.publish("books", &entry(2));
        match sub.poll().unwrap() {
            UpdatesPoll::Records(records) => {
                let counters: Vec<i64> =
                    records.iter().map(|r| r.entry.lsn.counter()).collect();
                assert_eq!(counters, vec![1, 2]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn filters_restrict_delivery() {
        let hub = UpdatesHub::new(16);
        let sub = hub.subscribe(UpdatesFilter {
            namespaces: Some(vec!["books".to_string()]),
            kinds: Some(vec!["tx_begin".to_string()]),
        });
        hub.publish("books", &entry(1));
        hub.publish("orders", &entry(2));
        hub.publish(
            "books",
            &WalEntry {
                lsn: Lsn::new(0, 3),
                record: WalRecord::TxCommit,
            },
        );
        match sub.poll().unwrap() {
            UpdatesPoll::Records(records) => assert_eq!(records.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn overflow_demands_resync() {
        let hub = UpdatesHub::new(2);
        let sub = hub.subscribe(UpdatesFilter::default());
        for i in 0..5 {
            hub.publish("books", &entry(i));
        }
        assert_eq!(sub.poll().unwrap(), UpdatesPoll::ResyncRequired);
        // After the marker the stream is usable again.
        hub.publish("books", &entry(9));
        match sub.poll().unwrap() {
            UpdatesPoll::Records(records) => assert_eq!(records.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn close_is_terminal() {
        let hub = UpdatesHub::new(4);
        let sub = hub.subscribe(UpdatesFilter::default());
        hub.close_all();
        let err = sub.poll().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Replication);
    }
}
