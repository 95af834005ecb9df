//! Shared timer for read deadlines
//!
//! A single background task owns a min-heap of deadlines and fires a callback
//! for each entry once its instant has passed. Scheduling is a channel send,
//! so callers never wait on the timer.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

struct Entry<T> {
    at: Instant,
    seq: u64,
    item: T,
}

// Reversed so the heap pops the earliest deadline first; `seq` keeps equal
// deadlines in scheduling order.
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

/// Handle to the deadline task. Dropping every handle stops the task and
/// discards deadlines that have not fired yet.
#[derive(Clone)]
pub struct DeadlineQueue<T> {
    tx: mpsc::UnboundedSender<(Instant, T)>,
}

impl<T: Send + 'static> DeadlineQueue<T> {
    /// Spawn the timer task on the current runtime.
    pub fn spawn<F>(on_expire: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, on_expire));
        Self { tx }
    }

    pub fn schedule(&self, at: Instant, item: T) {
        if self.tx.send((at, item)).is_err() {
            tracing::warn!("Deadline task stopped, deadline dropped");
        }
    }
}

async fn run<T, F>(mut rx: mpsc::UnboundedReceiver<(Instant, T)>, mut on_expire: F)
where
    F: FnMut(T),
{
    let mut heap: BinaryHeap<Entry<T>> = BinaryHeap::new();
    let mut seq = 0u64;

    loop {
        let next = heap.peek().map(|entry| entry.at);
        // Idle wake-up when nothing is scheduled; the branch is disabled anyway.
        let wake = next.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            scheduled = rx.recv() => match scheduled {
                Some((at, item)) => {
                    seq += 1;
                    heap.push(Entry { at, seq, item });
                }
                None => break,
            },
            _ = sleep_until(wake), if next.is_some() => {
                let now = Instant::now();
                while heap.peek().is_some_and(|entry| entry.at <= now) {
                    if let Some(entry) = heap.pop() {
                        on_expire(entry.item);
                    }
                }
            }
        }
    }

    tracing::debug!("Deadline task exiting with {} pending", heap.len());
}
