//! Per-segment bookkeeping

use tokio::sync::oneshot;

/// One segment of the sliding window.
///
/// `done` is monotonic: once the transcoder has produced the segment file it
/// stays true until the chunk is pruned together with its file. Requests
/// blocked on the segment register a waiter; waiters registered after
/// completion never block because the serving path checks `done` first.
pub struct Chunk {
    pub id: i64,
    pub done: bool,
    waiters: Vec<(u64, oneshot::Sender<()>)>,
}

impl Chunk {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            done: false,
            waiters: Vec::new(),
        }
    }

    /// Register a request waiting on this chunk. The caller keeps the
    /// receiver and removes itself by id on wakeup.
    pub fn add_waiter(&mut self, waiter_id: u64) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push((waiter_id, tx));
        rx
    }

    /// Remove a waiter by identity. A waiter that was already woken is
    /// gone from the set, so this is a no-op then.
    pub fn remove_waiter(&mut self, waiter_id: u64) {
        self.waiters.retain(|(id, _)| *id != waiter_id);
    }

    /// Wake every registered waiter exactly once.
    pub fn wake_waiters(&mut self) {
        for (_, tx) in self.waiters.drain(..) {
            // a waiter that timed out already dropped its receiver
            let _ = tx.send(());
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}
