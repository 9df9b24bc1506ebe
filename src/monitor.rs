//! The monitoring history: an append-ordered log of memory samples,
//! shared by every supervisor and queried by the dispatcher.

use std::sync::Mutex;

/// One sampled instant of one child, recorded once per monitored
/// second while the child runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub pid: libc::pid_t,
    pub when: String,
    pub argv: String,
    pub bytes: u64,
}

/// Per-pid summary returned by an all-pids query.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub pid: libc::pid_t,
    /// Bytes of the most recent sample for this pid.
    pub bytes: u64,
    /// Command line of the earliest still-present sample. The latest
    /// bytes next to the earliest argv is inherited behavior; the two
    /// only differ if samples were partially purged.
    pub argv: String,
}

/// Thread-safe FIFO of samples. Supervisors append while their child
/// lives and purge when it dies; queries read a consistent snapshot
/// under the same mutex. There is no eviction besides purge-by-pid, so
/// the store's size tracks the set of live children.
#[derive(Debug, Default)]
pub struct MonitorStore {
    entries: Mutex<Vec<Sample>>,
}

impl MonitorStore {
    pub fn new() -> MonitorStore {
        MonitorStore::default()
    }

    pub fn append(&self, sample: Sample) {
        self.entries.lock().expect("monitor store poisoned").push(sample);
    }

    /// Every `(when, bytes)` pair recorded for `pid`, in append order.
    pub fn samples_for(&self, pid: libc::pid_t) -> Vec<(String, u64)> {
        self.entries
            .lock()
            .expect("monitor store poisoned")
            .iter()
            .filter(|sample| sample.pid == pid)
            .map(|sample| (sample.when.clone(), sample.bytes))
            .collect()
    }

    /// One [`Aggregate`] per pid with at least one sample, in order of
    /// first appearance.
    pub fn aggregates(&self) -> Vec<Aggregate> {
        let entries = self.entries.lock().expect("monitor store poisoned");
        let mut aggregates: Vec<Aggregate> = Vec::new();
        for sample in entries.iter() {
            match aggregates.iter_mut().find(|agg| agg.pid == sample.pid) {
                Some(agg) => agg.bytes = sample.bytes,
                None => aggregates.push(Aggregate {
                    pid: sample.pid,
                    bytes: sample.bytes,
                    argv: sample.argv.clone(),
                }),
            }
        }
        aggregates
    }

    /// Drop every sample recorded for `pid`. Called exactly once per
    /// child, by its own supervisor, on the transition to terminal.
    pub fn purge(&self, pid: libc::pid_t) {
        self.entries
            .lock()
            .expect("monitor store poisoned")
            .retain(|sample| sample.pid != pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pid: libc::pid_t, when: &str, argv: &str, bytes: u64) -> Sample {
        Sample {
            pid,
            when: when.to_string(),
            argv: argv.to_string(),
            bytes,
        }
    }

    #[test]
    fn samples_for_preserves_append_order() {
        let store = MonitorStore::new();
        store.append(sample(10, "t0", "/bin/a", 100));
        store.append(sample(20, "t1", "/bin/b", 900));
        store.append(sample(10, "t2", "/bin/a", 200));
        assert_eq!(
            store.samples_for(10),
            vec![("t0".to_string(), 100), ("t2".to_string(), 200)]
        );
        assert_eq!(store.samples_for(99), vec![]);
    }

    #[test]
    fn aggregates_take_last_bytes_and_first_argv() {
        let store = MonitorStore::new();
        store.append(sample(10, "t0", "/bin/a one", 100));
        store.append(sample(10, "t1", "/bin/a one", 300));
        store.append(sample(20, "t1", "/bin/b", 50));
        let aggs = store.aggregates();
        assert_eq!(aggs.len(), 2);
        assert_eq!(aggs[0].pid, 10);
        assert_eq!(aggs[0].bytes, 300);
        assert_eq!(aggs[0].argv, "/bin/a one");
        assert_eq!(aggs[1].pid, 20);
        assert_eq!(aggs[1].bytes, 50);
    }

    #[test]
    fn aggregates_cover_more_pids_than_the_worker_pool() {
        let store = MonitorStore::new();
        for pid in 1..=8 {
            store.append(sample(pid, "t0", "/bin/x", pid as u64));
            store.append(sample(pid, "t1", "/bin/x", pid as u64 * 10));
        }
        let aggs = store.aggregates();
        assert_eq!(aggs.len(), 8);
        for (i, agg) in aggs.iter().enumerate() {
            assert_eq!(agg.pid, (i + 1) as libc::pid_t);
            assert_eq!(agg.bytes, (i + 1) as u64 * 10);
        }
    }

    #[test]
    fn purge_removes_only_the_target_pid() {
        let store = MonitorStore::new();
        store.append(sample(10, "t0", "/bin/a", 1));
        store.append(sample(20, "t0", "/bin/b", 2));
        store.append(sample(10, "t1", "/bin/a", 3));
        store.purge(10);
        assert!(store.samples_for(10).is_empty());
        assert_eq!(store.samples_for(20).len(), 1);
        assert_eq!(store.aggregates().len(), 1);
    }
}
