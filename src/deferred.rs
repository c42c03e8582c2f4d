use std::{collections::VecDeque, sync::Arc};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    Mode,
    adaptor::{MessageConsumer, ReplySender},
    error::Error,
};

/// Explicit observer registration for adaptor connection events.
///
/// Handlers run only inside a `poll()` drain, so notification ordering and
/// multiplicity are explicit: every registered handler fires once per event,
/// in registration order, never concurrently with consumer callbacks.
#[derive(Default)]
pub struct ConnectionObservers {
    connected: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    disconnected: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    connect_failed: Mutex<Vec<Box<dyn Fn(&Error) + Send + Sync>>>,
}

impl ConnectionObservers {
    pub fn on_connected(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.connected.lock().push(Box::new(handler));
    }

    pub fn on_disconnected(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.disconnected.lock().push(Box::new(handler));
    }

    pub fn on_connect_failed(&self, handler: impl Fn(&Error) + Send + Sync + 'static) {
        self.connect_failed.lock().push(Box::new(handler));
    }

    fn notify_connected(&self) -> usize {
        let handlers = self.connected.lock();
        for handler in handlers.iter() {
            handler();
        }
        handlers.len()
    }

    fn notify_disconnected(&self) -> usize {
        let handlers = self.disconnected.lock();
        for handler in handlers.iter() {
            handler();
        }
        handlers.len()
    }

    fn notify_connect_failed(&self, error: &Error) -> usize {
        let handlers = self.connect_failed.lock();
        for handler in handlers.iter() {
            handler(error);
        }
        handlers.len()
    }
}

pub(crate) enum DeferredJob {
    Connected,
    Disconnected,
    ConnectFailed(Error),
    Message {
        consumer: Arc<dyn MessageConsumer>,
        mode: Mode,
        buf: Bytes,
        reply: Option<Arc<dyn ReplySender>>,
    },
}

/// Bounded queue of work accumulated by background I/O tasks and drained on
/// the owning application thread.
///
/// The drain call is the only place consumer callbacks and connection
/// observers execute for a poll-driven adaptor.
pub(crate) struct DeferredQueue {
    jobs: Mutex<VecDeque<DeferredJob>>,
    capacity: usize,
}

impl DeferredQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    pub fn push(&self, job: DeferredJob) {
        let mut jobs = self.jobs.lock();
        if jobs.len() >= self.capacity {
            tracing::warn!("deferred queue full, dropping inbound job");
            return;
        }
        jobs.push_back(job);
    }

    /// Drains every queued job, running callbacks outside the lock.
    /// Returns the number of callbacks performed.
    pub fn drain(&self, observers: &ConnectionObservers) -> usize {
        let to_handle: Vec<DeferredJob> = {
            let mut jobs = self.jobs.lock();
            jobs.drain(..).collect()
        };

        let mut performed = 0;
        for job in to_handle {
            match job {
                DeferredJob::Connected => performed += observers.notify_connected(),
                DeferredJob::Disconnected => performed += observers.notify_disconnected(),
                DeferredJob::ConnectFailed(error) => {
                    performed += observers.notify_connect_failed(&error);
                }
                DeferredJob::Message {
                    consumer,
                    mode,
                    buf,
                    reply,
                } => {
                    consumer.on_receive_message(mode, buf, reply);
                    performed += 1;
                }
            }
        }
        performed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_empty_drain_runs_nothing() {
        let queue = DeferredQueue::new(16);
        let observers = ConnectionObservers::default();
        observers.on_connected(|| panic!("no event was queued"));
        assert_eq!(queue.drain(&observers), 0);
    }

    #[test]
    fn test_drain_order_and_observers() {
        let queue = DeferredQueue::new(16);
        let observers = ConnectionObservers::default();
        let connects = Arc::new(AtomicUsize::new(0));
        {
            let connects = connects.clone();
            observers.on_connected(move || {
                connects.fetch_add(1, Ordering::SeqCst);
            });
        }

        struct Consumer(Arc<AtomicUsize>);
        impl MessageConsumer for Consumer {
            fn on_receive_message(&self, _: Mode, _: Bytes, _: Option<Arc<dyn ReplySender>>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let received = Arc::new(AtomicUsize::new(0));
        queue.push(DeferredJob::Connected);
        queue.push(DeferredJob::Message {
            consumer: Arc::new(Consumer(received.clone())),
            mode: Mode::Notify,
            buf: Bytes::new(),
            reply: None,
        });

        assert_eq!(queue.drain(&observers), 2);
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(received.load(Ordering::SeqCst), 1);

        // drained means gone
        assert_eq!(queue.drain(&observers), 0);
    }

    #[test]
    fn test_bounded() {
        let queue = DeferredQueue::new(1);
        queue.push(DeferredJob::Connected);
        queue.push(DeferredJob::Disconnected); // dropped
        let observers = ConnectionObservers::default();
        let events = Arc::new(AtomicUsize::new(0));
        {
            let events = events.clone();
            observers.on_connected(move || {
                events.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let events = events.clone();
            observers.on_disconnected(move || {
                events.fetch_add(100, Ordering::SeqCst);
            });
        }
        queue.drain(&observers);
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }
}
