//! Background batch prefetching.
//!
//! A single producer thread pulls items from an iterator and pushes them into
//! a bounded channel, so batch preparation overlaps with model execution.
//! Items arrive in the order the iterator yields them.

use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, select, Receiver, Sender, TryRecvError};
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub struct Prefetcher<T> {
    receiver: Receiver<T>,
    /// Cancellation token: dropping the sender wakes the producer.
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl<T: Send + 'static> Prefetcher<T> {
    /// Starts a producer thread buffering up to `max_queue_size` items.
    pub fn spawn<I>(name: &str, producer: I, max_queue_size: usize) -> Result<Self>
    where
        I: Iterator<Item = T> + Send + 'static,
    {
        let (sender, receiver) = bounded(max_queue_size.max(1));
        let (cancel, cancelled) = bounded::<()>(0);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || produce(producer, sender, cancelled))?;
        debug!(name, max_queue_size, "started prefetcher");

        Ok(Self {
            receiver,
            cancel: Some(cancel),
            handle: Some(handle),
            name: name.to_string(),
        })
    }

    /// Blocks for the next item. `None` once the producer is finished and the
    /// queue is drained, or after [`stop`](Self::stop).
    pub fn next(&self) -> Option<T> {
        if self.cancel.is_none() {
            return None;
        }
        self.receiver.recv().ok()
    }
}

impl<T: Send + 'static> Prefetcher<Result<T>> {
    /// Next item of a fallible stream. A producer that ends before `expected`
    /// items were received is an error.
    pub fn next_batch(&self, received: usize, expected: usize) -> Result<T> {
        self.next()
            .unwrap_or(Err(Error::ProducerClosed { received, expected }))
    }
}

impl<T> Prefetcher<T> {
    /// Cancels the producer and waits for its thread to exit. Idempotent.
    pub fn stop(&mut self) {
        // Dropping the token disconnects the cancellation channel.
        drop(self.cancel.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(name = %self.name, "prefetch producer panicked");
            } else {
                debug!(name = %self.name, "stopped prefetcher");
            }
        }
    }
}

impl<T> Drop for Prefetcher<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn produce<T, I: Iterator<Item = T>>(producer: I, sender: Sender<T>, cancelled: Receiver<()>) {
    for item in producer {
        select! {
            send(sender, item) -> sent => {
                if sent.is_err() {
                    break;
                }
            }
            recv(cancelled) -> _ => break,
        }
        if !matches!(cancelled.try_recv(), Err(TryRecvError::Empty)) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_items_arrive_in_order() -> Result<()> {
        let mut prefetcher = Prefetcher::spawn("ordered", 0..100, 4)?;
        let mut received = Vec::new();
        while let Some(item) = prefetcher.next() {
            received.push(item);
        }
        assert_eq!(received, (0..100).collect::<Vec<_>>());
        prefetcher.stop();
        Ok(())
    }

    #[test]
    fn test_stop_cancels_infinite_producer() -> Result<()> {
        let produced = Arc::new(AtomicUsize::new(0));
        let counter = produced.clone();
        let producer = std::iter::repeat(7u32).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut prefetcher = Prefetcher::spawn("infinite", producer, 2)?;
        for _ in 0..3 {
            assert_eq!(prefetcher.next(), Some(7));
        }
        prefetcher.stop();

        let after_stop = produced.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(produced.load(Ordering::SeqCst), after_stop, "producer kept running");
        assert_eq!(prefetcher.next(), None);

        // A second stop is a no-op.
        prefetcher.stop();
        Ok(())
    }

    #[test]
    fn test_queue_is_bounded() -> Result<()> {
        let produced = Arc::new(AtomicUsize::new(0));
        let counter = produced.clone();
        let producer = (0..1000).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let prefetcher = Prefetcher::spawn("bounded", producer, 3)?;
        std::thread::sleep(Duration::from_millis(50));
        // Three queued items plus one held by the blocked send.
        assert!(produced.load(Ordering::SeqCst) <= 4);
        drop(prefetcher);
        Ok(())
    }

    #[test]
    fn test_next_batch_reports_early_end() -> Result<()> {
        let items: Vec<Result<u8>> = vec![Ok(1), Ok(2)];
        let prefetcher = Prefetcher::spawn("short", items.into_iter(), 2)?;
        assert_eq!(prefetcher.next_batch(0, 3)?, 1);
        assert_eq!(prefetcher.next_batch(1, 3)?, 2);
        match prefetcher.next_batch(2, 3) {
            Err(Error::ProducerClosed { received, expected }) => assert_eq!((received, expected), (2, 3)),
            other => panic!("expected ProducerClosed, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_drop_stops_producer() -> Result<()> {
        let prefetcher = Prefetcher::spawn("dropped", std::iter::repeat(1u8), 1)?;
        assert_eq!(prefetcher.next(), Some(1));
        drop(prefetcher);
        Ok(())
    }
}
