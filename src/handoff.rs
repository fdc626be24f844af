//! Worker-to-owner hand-off.
//!
//! The worker posts a payload into a capacity-1 channel and blocks until the
//! owner either completes it (applied) or drops it (discarded). The owner
//! drains the channel from its own loop; it never blocks on the worker except
//! when shutting it down.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HandoffError {
    #[error("the owner side of the hand-off channel is gone")]
    Closed,
}

/// How the owner dealt with a posted payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Applied,
    Discarded,
}

struct Envelope<T> {
    payload: T,
    ack: SyncSender<bool>,
}

pub fn channel<T>() -> (HandoffSender<T>, HandoffReceiver<T>) {
    let (tx, rx) = mpsc::sync_channel(1);
    (HandoffSender { tx }, HandoffReceiver { rx })
}

pub struct HandoffSender<T> {
    tx: SyncSender<Envelope<T>>,
}

impl<T> HandoffSender<T> {
    /// Posts and blocks until the owner has applied or discarded the payload.
    pub fn post_and_wait(&self, payload: T) -> Result<Delivery, HandoffError> {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.tx
            .send(Envelope {
                payload,
                ack: ack_tx,
            })
            .map_err(|_| HandoffError::Closed)?;

        match ack_rx.recv() {
            Ok(true) => Ok(Delivery::Applied),
            Ok(false) | Err(_) => Ok(Delivery::Discarded),
        }
    }
}

/// Owner-side acknowledgement of one hand-off.
///
/// Dropping it without calling [`Ack::complete`] reports the payload as
/// discarded and releases the waiting worker.
pub struct Ack {
    tx: Option<SyncSender<bool>>,
}

impl Ack {
    pub fn complete(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(true);
        }
    }
}

impl Drop for Ack {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(false);
        }
    }
}

pub struct HandoffReceiver<T> {
    rx: Receiver<Envelope<T>>,
}

impl<T> HandoffReceiver<T> {
    /// Next pending payload, if any. `Err(Closed)` once every sender is gone
    /// and the queue is empty.
    pub fn try_recv(&self) -> Result<Option<(T, Ack)>, HandoffError> {
        match self.rx.try_recv() {
            Ok(envelope) => Ok(Some(open(envelope))),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(HandoffError::Closed),
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<(T, Ack)>, HandoffError> {
        match self.rx.recv_timeout(timeout) {
            Ok(envelope) => Ok(Some(open(envelope))),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(HandoffError::Closed),
        }
    }
}

fn open<T>(envelope: Envelope<T>) -> (T, Ack) {
    (
        envelope.payload,
        Ack {
            tx: Some(envelope.ack),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn completed_ack_reports_applied() {
        let (tx, rx) = channel::<u32>();
        let worker = thread::spawn(move || tx.post_and_wait(7));

        let (value, ack) = loop {
            if let Some(handoff) = rx
                .recv_timeout(Duration::from_millis(50))
                .expect("sender alive")
            {
                break handoff;
            }
        };
        assert_eq!(value, 7);
        ack.complete();

        let delivery = worker.join().expect("worker panicked");
        assert_eq!(delivery, Ok(Delivery::Applied));
    }

    #[test]
    fn dropped_ack_reports_discarded() {
        let (tx, rx) = channel::<u32>();
        let worker = thread::spawn(move || tx.post_and_wait(1));

        let handoff = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("sender alive")
            .expect("payload within timeout");
        drop(handoff);

        assert_eq!(
            worker.join().expect("worker panicked"),
            Ok(Delivery::Discarded)
        );
    }

    #[test]
    fn dropped_receiver_closes_the_channel() {
        let (tx, rx) = channel::<String>();
        drop(rx);
        assert_eq!(
            tx.post_and_wait("y".to_string()),
            Err(HandoffError::Closed)
        );
    }

    #[test]
    fn receiver_sees_closed_after_senders_drop() {
        let (tx, rx) = channel::<u32>();
        let worker = thread::spawn(move || tx.post_and_wait(3));

        let (value, ack) = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("sender alive")
            .expect("payload within timeout");
        assert_eq!(value, 3);
        ack.complete();
        assert_eq!(worker.join().expect("worker panicked"), Ok(Delivery::Applied));

        assert!(matches!(rx.try_recv(), Err(HandoffError::Closed)));
    }
}
