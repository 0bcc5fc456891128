//! Bounded FIFO work queues feeding the worker pools.
//!
//! A [`WorkQueue`] is cheap to clone: every clone sends into and receives from the same channel.
//! Supervisors send one message per work unit followed by exactly one [`QueueMessage::Stop`] per
//! worker, and each worker exits after observing its single STOP.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::bail;
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::error::{CopyDbResult, ErrorKind};
use crate::types::Oid;

/// Message exchanged on a work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMessage {
    /// Poison pill: the receiving worker must exit without receiving again.
    Stop,
    /// Copy one table or one part of a split table, or vacuum one table.
    TableOid { oid: Oid, part: Option<u32> },
    /// Build one index.
    IndexOid { oid: Oid },
}

impl fmt::Display for QueueMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueMessage::Stop => write!(f, "STOP"),
            QueueMessage::TableOid { oid, part: None } => write!(f, "TABLE {oid}"),
            QueueMessage::TableOid {
                oid,
                part: Some(part),
            } => write!(f, "TABLE {oid} part {part}"),
            QueueMessage::IndexOid { oid } => write!(f, "INDEX {oid}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkQueue {
    name: Arc<str>,
    tx: mpsc::Sender<QueueMessage>,
    rx: Arc<Mutex<mpsc::Receiver<QueueMessage>>>,
}

impl WorkQueue {
    /// Creates a queue holding at most `capacity` pending messages.
    pub fn create(name: &str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));

        Self {
            name: Arc::from(name),
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends a message, waiting while the queue is full.
    pub async fn send(&self, message: QueueMessage) -> CopyDbResult<()> {
        if self.tx.send(message).await.is_err() {
            bail!(
                ErrorKind::QueueClosed,
                "Work queue was unlinked",
                format!("queue: {}, message: {message}", self.name)
            );
        }

        debug!(queue = %self.name, %message, "message sent");

        Ok(())
    }

    /// Sends a message unless shutdown is signalled while the queue is full.
    pub async fn send_until_shutdown(
        &self,
        message: QueueMessage,
        shutdown_rx: &mut ShutdownRx,
    ) -> CopyDbResult<ShutdownResult<(), ()>> {
        if shutdown_rx.is_shutdown() {
            return Ok(ShutdownResult::Shutdown(()));
        }

        tokio::select! {
            biased;

            _ = shutdown_rx.wait() => Ok(ShutdownResult::Shutdown(())),
            result = self.send(message) => result.map(ShutdownResult::Ok),
        }
    }

    /// Sends one STOP message per worker.
    pub async fn send_stops(&self, workers: usize) -> CopyDbResult<()> {
        for _ in 0..workers {
            self.send(QueueMessage::Stop).await?;
        }

        Ok(())
    }

    /// Waits for the next message, or for shutdown.
    pub async fn receive(
        &self,
        shutdown_rx: &mut ShutdownRx,
    ) -> CopyDbResult<ShutdownResult<QueueMessage, ()>> {
        if shutdown_rx.is_shutdown() {
            return Ok(ShutdownResult::Shutdown(()));
        }

        let mut rx = tokio::select! {
            biased;

            _ = shutdown_rx.wait() => return Ok(ShutdownResult::Shutdown(())),
            rx = self.rx.lock() => rx,
        };

        tokio::select! {
            biased;

            _ = shutdown_rx.wait() => Ok(ShutdownResult::Shutdown(())),
            message = rx.recv() => match message {
                Some(message) => Ok(ShutdownResult::Ok(message)),
                None => bail!(
                    ErrorKind::QueueClosed,
                    "Work queue was unlinked",
                    format!("queue: {}", self.name)
                ),
            },
        }
    }

    /// Destroys the queue: further sends fail, pending messages can still be received.
    pub async fn unlink(&self) {
        self.rx.lock().await.close();
        debug!(queue = %self.name, "queue unlinked");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::concurrency::shutdown::create_shutdown_channel;

    #[tokio::test]
    async fn messages_are_received_in_order() {
        let queue = WorkQueue::create("tables", 8);
        let (_tx, mut shutdown_rx) = create_shutdown_channel();

        queue
            .send(QueueMessage::TableOid {
                oid: Oid(10),
                part: None,
            })
            .await
            .unwrap();
        queue
            .send(QueueMessage::IndexOid { oid: Oid(11) })
            .await
            .unwrap();
        queue.send_stops(1).await.unwrap();

        let mut received = Vec::new();
        loop {
            let ShutdownResult::Ok(message) = queue.receive(&mut shutdown_rx).await.unwrap()
            else {
                panic!("unexpected shutdown");
            };
            received.push(message);
            if message == QueueMessage::Stop {
                break;
            }
        }

        assert_eq!(
            received,
            vec![
                QueueMessage::TableOid {
                    oid: Oid(10),
                    part: None
                },
                QueueMessage::IndexOid { oid: Oid(11) },
                QueueMessage::Stop,
            ]
        );
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_blocked_receive() {
        let queue = WorkQueue::create("indexes", 1);
        let (shutdown_tx, mut shutdown_rx) = create_shutdown_channel();

        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive(&mut shutdown_rx).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.shutdown().unwrap();

        let result = receiver.await.unwrap().unwrap();
        assert!(result.should_shutdown());
    }

    #[tokio::test]
    async fn unlinked_queue_rejects_sends() {
        let queue = WorkQueue::create("vacuum", 1);
        queue.unlink().await;

        let err = queue.send(QueueMessage::Stop).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueClosed);
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_blocked_send() {
        let queue = WorkQueue::create("tables", 1);
        let (shutdown_tx, mut shutdown_rx) = create_shutdown_channel();
        queue.send(QueueMessage::Stop).await.unwrap();

        let sender = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .send_until_shutdown(QueueMessage::Stop, &mut shutdown_rx)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.shutdown().unwrap();

        let result = sender.await.unwrap().unwrap();
        assert!(result.should_shutdown());
    }

    /// Receives until STOP, returning the number of other messages received.
    async fn consume_until_stop(queue: WorkQueue) -> CopyDbResult<usize> {
        let (_shutdown_tx, mut shutdown_rx) = create_shutdown_channel();
        let mut received = 0;
        loop {
            match queue.receive(&mut shutdown_rx).await? {
                ShutdownResult::Ok(QueueMessage::Stop) => return Ok(received),
                ShutdownResult::Ok(_) => received += 1,
                ShutdownResult::Shutdown(()) => panic!("unexpected shutdown"),
            }
        }
    }

    fn spawn_consumers(
        queue: &WorkQueue,
        workers: usize,
    ) -> tokio::task::JoinSet<CopyDbResult<usize>> {
        let mut consumers = tokio::task::JoinSet::new();
        for _ in 0..workers {
            consumers.spawn(consume_until_stop(queue.clone()));
        }

        consumers
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn each_consumer_exits_on_its_own_stop() {
        let queue = WorkQueue::create("tables", 4);
        let mut consumers = spawn_consumers(&queue, 4);

        for oid in 1..=10 {
            queue
                .send(QueueMessage::TableOid {
                    oid: Oid(oid),
                    part: None,
                })
                .await
                .unwrap();
        }
        queue.send_stops(4).await.unwrap();

        let mut received = 0;
        let mut exited = 0;
        while let Some(result) = tokio::time::timeout(Duration::from_secs(5), consumers.join_next())
            .await
            .expect("every consumer should exit")
        {
            received += result.unwrap().unwrap();
            exited += 1;
        }
        assert_eq!(exited, 4);
        assert_eq!(received, 10);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_missing_stop_leaves_one_consumer_waiting() {
        let queue = WorkQueue::create("indexes", 4);
        let mut consumers = spawn_consumers(&queue, 3);
        queue.send_stops(2).await.unwrap();

        for _ in 0..2 {
            let result = tokio::time::timeout(Duration::from_secs(5), consumers.join_next())
                .await
                .expect("consumers with a STOP should exit");
            assert!(result.is_some());
        }

        let waiting = tokio::time::timeout(Duration::from_millis(200), consumers.join_next()).await;
        assert!(waiting.is_err(), "the third consumer received no STOP");
        assert_eq!(consumers.len(), 1);

        queue.send_stops(1).await.unwrap();
        let last = tokio::time::timeout(Duration::from_secs(5), consumers.join_next())
            .await
            .expect("the last consumer should exit on its STOP");
        assert_eq!(last.unwrap().unwrap().unwrap(), 0);
    }
}
