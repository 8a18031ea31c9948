//! Sequencing of a bounded number of cooperative redo tasks.
//!
//! Redo bodies are `!Send` futures spawned onto a current-thread tokio
//! runtime.  They only make progress while synchronous code drives the
//! executor: when a new submission waits for a free slot, when a result is
//! awaited, or when a context completes its pending redos on exit.  This
//! gives the engine well-defined suspension points without any locking.

use std::future::Future;
use std::pin::Pin;
use std::task::Poll;

use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;

/// Owns the executor: a current-thread runtime plus the local task set.
pub struct Driver {
    runtime: tokio::runtime::Runtime,
    local: tokio::task::LocalSet,
}

impl Driver {
    pub fn new() -> std::io::Result<Driver> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Driver {
            runtime,
            local: tokio::task::LocalSet::new(),
        })
    }

    /// Run a future to completion, letting spawned tasks progress.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.local.block_on(&self.runtime, fut)
    }

    fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.local.spawn_local(fut)
    }
}

/// Schedules tasks with a pending-count bound and keeps their results until
/// they are consumed.  Task ids (`tid`) are unique per sequencer; a task
/// may additionally be indexed by a caller-supplied `uid` while pending.
pub struct Sequencer<T> {
    next_tid: u64,
    pending: Vec<(u64, JoinHandle<T>)>,
    results: FxHashMap<u64, T>,
    uid_by_tid: FxHashMap<u64, i64>,
    tid_by_uid: FxHashMap<i64, u64>,
}

impl<T> Default for Sequencer<T> {
    fn default() -> Self {
        Sequencer {
            next_tid: 0,
            pending: Vec::new(),
            results: FxHashMap::default(),
            uid_by_tid: FxHashMap::default(),
            tid_by_uid: FxHashMap::default(),
        }
    }
}

impl<T: 'static> Sequencer<T> {
    /// Wait until no more than `max_count - 1` submitted tasks are pending,
    /// then spawn `fut`.  Does not wait for `fut` itself.
    pub fn submit(
        &mut self,
        driver: &Driver,
        max_count: usize,
        uid: Option<i64>,
        fut: impl Future<Output = T> + 'static,
    ) -> u64 {
        self.wait_until(driver, max_count.max(1) - 1, None);

        let tid = self.next_tid;
        self.next_tid += 1;
        let handle = driver.spawn(fut);
        self.pending.push((tid, handle));
        if let Some(uid) = uid {
            self.uid_by_tid.insert(tid, uid);
            self.tid_by_uid.insert(uid, tid);
        }
        tid
    }

    /// The pending task registered under `uid`, if any.
    pub fn pending_tid_for_uid(&self, uid: i64) -> Option<u64> {
        self.tid_by_uid.get(&uid).copied()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn is_pending(&self, tid: u64) -> bool {
        self.pending.iter().any(|(t, _)| *t == tid)
    }

    /// Wait until the task with id `tid` is no longer pending.
    pub fn complete(&mut self, driver: &Driver, tid: u64) {
        self.wait_until(driver, 0, Some(tid));
    }

    /// Wait until no task is pending.
    pub fn complete_all(&mut self, driver: &Driver) {
        self.wait_until(driver, 0, None);
    }

    /// Abort all pending tasks without driving them (used when unwinding).
    pub fn abort_all(&mut self) {
        for (tid, handle) in self.pending.drain(..) {
            handle.abort();
            if let Some(uid) = self.uid_by_tid.remove(&tid) {
                self.tid_by_uid.remove(&uid);
            }
        }
    }

    /// Take the result of a completed task.
    pub fn consume(&mut self, tid: u64) -> Option<T> {
        self.results.remove(&tid)
    }

    /// Take all unconsumed results, ordered by task id (= submission
    /// order).
    pub fn consume_all(&mut self) -> Vec<(u64, T)> {
        let mut all: Vec<(u64, T)> = self.results.drain().collect();
        all.sort_by_key(|(tid, _)| *tid);
        all
    }

    /// Take the result of task `tid` only when it matches `pred`.
    pub fn take_if(&mut self, tid: u64, pred: impl FnOnce(&T) -> bool) -> Option<T> {
        if self.results.get(&tid).map(pred) == Some(true) {
            self.results.remove(&tid)
        } else {
            None
        }
    }

    /// Take the earliest unconsumed result matching `pred`, leaving the
    /// others in place.
    pub fn take_first(&mut self, pred: impl Fn(&T) -> bool) -> Option<(u64, T)> {
        let tid = self
            .results
            .iter()
            .filter(|(_, v)| pred(v))
            .map(|(tid, _)| *tid)
            .min()?;
        let value = self.results.remove(&tid)?;
        Some((tid, value))
    }

    /// Drive the executor until the filtered task is done (when `tid_filter`
    /// is set) or at most `max_pending` tasks remain pending.
    fn wait_until(&mut self, driver: &Driver, max_pending: usize, tid_filter: Option<u64>) {
        let satisfied = |pending: &[(u64, JoinHandle<T>)]| match tid_filter {
            Some(tid) => !pending.iter().any(|(t, _)| *t == tid),
            None => pending.len() <= max_pending,
        };
        if satisfied(&self.pending) {
            return;
        }

        let pending = &mut self.pending;
        let results = &mut self.results;
        let uid_by_tid = &mut self.uid_by_tid;
        let tid_by_uid = &mut self.tid_by_uid;
        driver.block_on(futures::future::poll_fn(move |cx| {
            let mut i = 0;
            while i < pending.len() {
                match Pin::new(&mut pending[i].1).poll(cx) {
                    Poll::Ready(joined) => {
                        let (tid, _) = pending.remove(i);
                        if let Some(uid) = uid_by_tid.remove(&tid) {
                            tid_by_uid.remove(&uid);
                        }
                        match joined {
                            Ok(value) => {
                                results.insert(tid, value);
                            }
                            Err(err) if err.is_panic() => {
                                std::panic::resume_unwind(err.into_panic())
                            }
                            Err(_) => {} // cancelled
                        }
                    }
                    Poll::Pending => i += 1,
                }
            }
            if satisfied(pending) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn submit_and_consume() {
        let driver = Driver::new().unwrap();
        let mut seq: Sequencer<u32> = Sequencer::default();

        let a = seq.submit(&driver, 4, None, async { 1 });
        let b = seq.submit(&driver, 4, None, async { 2 });
        seq.complete_all(&driver);
        assert!(!seq.has_pending());
        assert_eq!(seq.consume(a), Some(1));
        assert_eq!(seq.consume(b), Some(2));
        assert_eq!(seq.consume(b), None);
    }

    #[test]
    fn bounded_submission_completes_oldest() {
        let driver = Driver::new().unwrap();
        let mut seq: Sequencer<u32> = Sequencer::default();
        let finished = Rc::new(Cell::new(0));

        for i in 0..8u32 {
            let finished = finished.clone();
            seq.submit(&driver, 2, None, async move {
                finished.set(finished.get() + 1);
                i
            });
            // The bound holds after every submission.
            assert!(seq.pending.len() <= 2);
        }
        seq.complete_all(&driver);
        assert_eq!(finished.get(), 8);
        assert_eq!(seq.consume_all().len(), 8);
    }

    #[test]
    fn uid_tracks_pending_task() {
        let driver = Driver::new().unwrap();
        let mut seq: Sequencer<u32> = Sequencer::default();

        let tid = seq.submit(&driver, 4, Some(7), async { 42 });
        assert_eq!(seq.pending_tid_for_uid(7), Some(tid));
        seq.complete(&driver, tid);
        assert_eq!(seq.pending_tid_for_uid(7), None);
        assert_eq!(seq.consume(tid), Some(42));
    }

    #[test]
    fn consume_all_is_ordered() {
        let driver = Driver::new().unwrap();
        let mut seq: Sequencer<u32> = Sequencer::default();
        for i in 0..5u32 {
            seq.submit(&driver, 8, None, async move { i });
        }
        seq.complete_all(&driver);
        let all = seq.consume_all();
        let values: Vec<u32> = all.into_iter().map(|(_, v)| v).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }
}
