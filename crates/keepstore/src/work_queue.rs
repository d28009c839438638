//! Replaceable work list shared by a pool of workers.
//!
//! A single coordinator task owns the queue. Callers replace the whole list
//! at once; workers ask for the next item and report completion through a
//! [`WorkTicket`]. Progress is published on a `watch` channel.
//!
//! [`WorkQueue::next`] is cancel-safe: an item handed to a worker whose
//! `next()` future is dropped before it resolves goes back to the front of
//! the queue, unless the list was replaced in the meantime.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::error::{KeepError, KeepResult};

const COMMAND_CAPACITY: usize = 64;

/// Snapshot of a queue's progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkQueueStatus {
    /// Items handed to workers and not yet reported done.
    pub in_progress: usize,
    /// Items waiting for a worker.
    pub queued: usize,
}

enum Command<T> {
    Replace(Vec<T>, oneshot::Sender<()>),
    Next(oneshot::Sender<(T, u64)>),
    Close,
}

/// Handle to a work queue. Cheap to clone; all clones share one queue.
pub struct WorkQueue<T> {
    commands: mpsc::Sender<Command<T>>,
    done: mpsc::UnboundedSender<()>,
    requeue: mpsc::UnboundedSender<(T, u64)>,
    status: watch::Receiver<WorkQueueStatus>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            done: self.done.clone(),
            requeue: self.requeue.clone(),
            status: self.status.clone(),
        }
    }
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Start a queue coordinator on the current tokio runtime.
    pub fn new() -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (requeue_tx, requeue_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(WorkQueueStatus::default());

        let coordinator = Coordinator {
            queue: VecDeque::new(),
            waiters: VecDeque::new(),
            in_progress: 0,
            closed: false,
            generation: 0,
            status: status_tx,
        };
        tokio::spawn(coordinator.run(cmd_rx, done_rx, requeue_rx));

        Self {
            commands: cmd_tx,
            done: done_tx,
            requeue: requeue_tx,
            status: status_rx,
        }
    }

    /// Discard queued items and queue `items` in their place.
    /// Items already handed to workers are unaffected. Returns once the new
    /// list is reflected in [`WorkQueue::status`].
    pub async fn replace(&self, items: Vec<T>) -> KeepResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::Replace(items, ack_tx))
            .await
            .map_err(|_| KeepError::QueueClosed)?;
        ack_rx.await.map_err(|_| KeepError::QueueClosed)
    }

    /// Wait for the next item. Returns `None` once the queue is closed.
    pub async fn next(&self) -> Option<(T, WorkTicket)> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Next(tx)).await.ok()?;
        let mut pending = PendingItem {
            rx,
            requeue: self.requeue.clone(),
            received: false,
        };
        let (item, _) = (&mut pending.rx).await.ok()?;
        pending.received = true;
        Some((
            item,
            WorkTicket {
                done: self.done.clone(),
                reported: false,
            },
        ))
    }

    /// Drop queued items and wake waiting workers with `None`.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close).await;
    }

    /// Current progress.
    pub fn status(&self) -> WorkQueueStatus {
        *self.status.borrow()
    }

    /// Receiver for progress updates.
    pub fn subscribe(&self) -> watch::Receiver<WorkQueueStatus> {
        self.status.clone()
    }

    /// Wait until nothing is queued or in progress.
    pub async fn wait_idle(&self) {
        let mut rx = self.status.clone();
        let _ = rx
            .wait_for(|s| s.in_progress == 0 && s.queued == 0)
            .await;
    }

    /// True while the coordinator accepts commands.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

impl<T: Send + 'static> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that a worker holds an item. Reports completion exactly once,
/// either through [`WorkTicket::done`] or when dropped.
#[derive(Debug)]
pub struct WorkTicket {
    done: mpsc::UnboundedSender<()>,
    reported: bool,
}

impl WorkTicket {
    /// Report the item as finished.
    pub fn done(mut self) {
        self.report();
    }

    fn report(&mut self) {
        if !self.reported {
            self.reported = true;
            let _ = self.done.send(());
        }
    }
}

impl Drop for WorkTicket {
    fn drop(&mut self) {
        self.report();
    }
}

/// Receiving end of a `next()` call. If the call is abandoned after the
/// coordinator already sent an item, the item is handed back.
struct PendingItem<T> {
    rx: oneshot::Receiver<(T, u64)>,
    requeue: mpsc::UnboundedSender<(T, u64)>,
    received: bool,
}

impl<T> Drop for PendingItem<T> {
    fn drop(&mut self) {
        if self.received {
            return;
        }
        self.rx.close();
        if let Ok(item) = self.rx.try_recv() {
            let _ = self.requeue.send(item);
        }
    }
}

struct Coordinator<T> {
    queue: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<(T, u64)>>,
    in_progress: usize,
    closed: bool,
    /// Bumped by every replace and close; stale requeued items are dropped.
    generation: u64,
    status: watch::Sender<WorkQueueStatus>,
}

impl<T: Send + 'static> Coordinator<T> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command<T>>,
        mut done: mpsc::UnboundedReceiver<()>,
        mut requeue: mpsc::UnboundedReceiver<(T, u64)>,
    ) {
        loop {
            let mut ack = None;
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Replace(items, tx)) => {
                        if !self.closed {
                            debug!(items = items.len(), "work list replaced");
                            self.queue = items.into();
                            self.generation += 1;
                            ack = Some(tx);
                        }
                    }
                    Some(Command::Next(tx)) => {
                        // dropping tx answers the worker with None
                        if !self.closed {
                            self.waiters.push_back(tx);
                        }
                    }
                    Some(Command::Close) => self.close(),
                    None => {
                        self.close();
                        break;
                    }
                },
                Some(()) = done.recv() => {
                    self.in_progress = self.in_progress.saturating_sub(1);
                }
                Some((item, generation)) = requeue.recv() => self.requeue(item, generation),
            }
            self.dispatch();
            self.publish();
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
        }
        // every handle is gone; only outstanding tickets remain
        while self.in_progress > 0 {
            tokio::select! {
                Some(()) = done.recv() => self.in_progress -= 1,
                Some((item, generation)) = requeue.recv() => self.requeue(item, generation),
                else => break,
            }
            self.publish();
        }
        self.publish();
    }

    fn requeue(&mut self, item: T, generation: u64) {
        self.in_progress = self.in_progress.saturating_sub(1);
        if !self.closed && generation == self.generation {
            debug!("abandoned item returned to queue");
            self.queue.push_front(item);
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.generation += 1;
        self.queue.clear();
        self.waiters.clear();
    }

    fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            let Some(item) = self.queue.pop_front() else {
                break;
            };
            match waiter.send((item, self.generation)) {
                Ok(()) => self.in_progress += 1,
                // worker gave up waiting
                Err((item, _)) => self.queue.push_front(item),
            }
        }
    }

    fn publish(&self) {
        let next = WorkQueueStatus {
            in_progress: self.in_progress,
            queued: self.queue.len(),
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_replace_then_next_in_order() {
        let q = WorkQueue::new();
        q.replace(vec![1, 2, 3]).await.unwrap();
        let (a, ta) = q.next().await.unwrap();
        let (b, tb) = q.next().await.unwrap();
        assert_eq!((a, b), (1, 2));
        ta.done();
        tb.done();
        let (c, tc) = q.next().await.unwrap();
        assert_eq!(c, 3);
        drop(tc);
        q.wait_idle().await;
        assert_eq!(q.status(), WorkQueueStatus::default());
    }

    #[tokio::test]
    async fn test_replace_discards_queued_items() {
        let q = WorkQueue::new();
        q.replace(vec!["a", "b", "c"]).await.unwrap();
        let (first, ticket) = q.next().await.unwrap();
        assert_eq!(first, "a");
        q.replace(vec!["x"]).await.unwrap();
        let (second, t2) = q.next().await.unwrap();
        assert_eq!(second, "x");
        ticket.done();
        t2.done();
        q.wait_idle().await;
    }

    #[tokio::test]
    async fn test_status_counts() {
        let q = WorkQueue::new();
        q.replace(vec![1, 2, 3]).await.unwrap();
        let (_, ticket) = q.next().await.unwrap();
        let mut rx = q.subscribe();
        let status = *rx
            .wait_for(|s| s.in_progress == 1 && s.queued == 2)
            .await
            .unwrap();
        assert_eq!(status.queued, 2);
        ticket.done();
        rx.wait_for(|s| s.in_progress == 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_waiter_receives_later_item() {
        let q: WorkQueue<u32> = WorkQueue::new();
        let worker = {
            let q = q.clone();
            tokio::spawn(async move { q.next().await.map(|(item, _)| item) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.replace(vec![7]).await.unwrap();
        assert_eq!(worker.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let q: WorkQueue<u32> = WorkQueue::new();
        let worker = {
            let q = q.clone();
            tokio::spawn(async move { q.next().await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.close().await;
        assert!(worker.await.unwrap());
        assert!(q.next().await.is_none());
    }

    #[tokio::test]
    async fn test_replace_after_close_fails() {
        let q: WorkQueue<u32> = WorkQueue::new();
        q.close().await;
        assert!(matches!(q.replace(vec![1]).await, Err(KeepError::QueueClosed)));
    }

    #[tokio::test]
    async fn test_close_drops_queue() {
        let q = WorkQueue::new();
        q.replace(vec![1, 2]).await.unwrap();
        q.close().await;
        assert!(q.next().await.is_none());
        let mut rx = q.subscribe();
        rx.wait_for(|s| s.queued == 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_waiter_does_not_lose_item() {
        let q = WorkQueue::new();
        let abandoned = tokio::time::timeout(Duration::from_millis(10), q.next()).await;
        assert!(abandoned.is_err());
        q.replace(vec![42]).await.unwrap();
        let (item, ticket) = q.next().await.unwrap();
        assert_eq!(item, 42);
        ticket.done();
        q.wait_idle().await;
    }

    #[tokio::test]
    async fn test_dropped_next_returns_sent_item() {
        let q = WorkQueue::new();
        let mut fut = Box::pin(q.next());
        assert!(futures::poll!(fut.as_mut()).is_pending());
        // the pending waiter is served before replace acknowledges
        q.replace(vec![1]).await.unwrap();
        drop(fut);

        let (item, ticket) = tokio::time::timeout(Duration::from_secs(1), q.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item, 1);
        ticket.done();
        q.wait_idle().await;
        assert_eq!(q.status(), WorkQueueStatus::default());
    }

    #[tokio::test]
    async fn test_dropped_next_item_discarded_after_replace() {
        let q = WorkQueue::new();
        let mut fut = Box::pin(q.next());
        assert!(futures::poll!(fut.as_mut()).is_pending());
        q.replace(vec![1]).await.unwrap();
        q.replace(vec![2]).await.unwrap();
        drop(fut);

        let (item, ticket) = q.next().await.unwrap();
        assert_eq!(item, 2);
        ticket.done();
        q.wait_idle().await;
        let leftover = tokio::time::timeout(Duration::from_millis(20), q.next()).await;
        assert!(leftover.is_err());
    }

    #[tokio::test]
    async fn test_many_workers_drain_queue() {
        let q = WorkQueue::new();
        q.replace((0..100).collect::<Vec<u32>>()).await.unwrap();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                let mut sum = 0u32;
                loop {
                    let next = tokio::time::timeout(Duration::from_millis(50), q.next()).await;
                    match next {
                        Ok(Some((n, ticket))) => {
                            sum += n;
                            ticket.done();
                        }
                        _ => return sum,
                    }
                }
            }));
        }
        let mut total = 0;
        for h in handles {
            total += h.await.unwrap();
        }
        assert_eq!(total, (0..100).sum::<u32>());
        q.wait_idle().await;
    }
}
