//! Ordered asynchronous execution queues.
//!
//! A [`Stream`] models the execution model of an accelerator queue: work
//! submitted to a stream runs in submission order on a dedicated worker,
//! and submission returns immediately. Two different streams have no
//! ordering relative to each other unless a dependency is inserted with
//! [`Stream::wait_event`].
//!
//! Completion is only observable explicitly: [`Stream::synchronize`] blocks
//! until everything submitted so far has run, and [`Stream::record_event`]
//! produces an [`Event`] that completes once the stream reaches it. There
//! are no implicit synchronization points anywhere in this crate.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

/// Global counter for generating unique stream IDs.
static STREAM_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a unique stream ID.
fn next_stream_id() -> u64 {
    STREAM_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Work item executed by a stream worker.
type Job = Box<dyn FnOnce() + Send + 'static>;

struct StreamInner {
    id: u64,
    /// Sender half of the job queue. `None` only during teardown.
    tx: Option<kanal::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        // Closing the sender lets the worker drain queued jobs and exit,
        // so deferred deallocations still run before the join.
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// An ordered, asynchronous execution queue.
///
/// Cloning a `Stream` yields another handle to the same queue. The worker
/// thread is joined when the last handle is dropped, after draining all
/// queued work.
///
/// # Example
///
/// ```rust,ignore
/// let device = Device::new(0)?;
/// let stream = device.create_stream()?;
/// // ... enqueue copies on the stream ...
/// stream.synchronize()?;
/// ```
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    /// Spawn a new stream with a named worker thread.
    pub(crate) fn with_name(name: &str) -> Result<Stream> {
        let (tx, rx) = kanal::unbounded::<Job>();

        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            })?;

        Ok(Stream {
            inner: Arc::new(StreamInner {
                id: next_stream_id(),
                tx: Some(tx),
                worker: Some(worker),
            }),
        })
    }

    /// Get the unique ID of this stream.
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Enqueue a job; it runs after everything previously submitted.
    pub(crate) fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.inner.tx {
            Some(tx) => tx.send(Box::new(job)).map_err(|_| Error::Driver {
                op: "stream submit",
                msg: "stream worker is gone".into(),
            }),
            None => Err(Error::Driver {
                op: "stream submit",
                msg: "stream is shutting down".into(),
            }),
        }
    }

    /// Record a completion marker behind all work submitted so far.
    ///
    /// The returned [`Event`] completes once the stream's worker reaches it.
    pub fn record_event(&self) -> Result<Event> {
        let event = Event::new();
        let signal = event.clone();
        self.submit(move || signal.signal())?;
        Ok(event)
    }

    /// Block until all previously submitted work has completed.
    pub fn synchronize(&self) -> Result<()> {
        let event = self.record_event()?;
        event.wait();
        Ok(())
    }

    /// Insert a cross-stream dependency: work submitted to this stream after
    /// this call does not run until `event` has completed.
    pub fn wait_event(&self, event: &Event) -> Result<()> {
        let event = event.clone();
        self.submit(move || event.wait())
    }

    /// Downgrade to a weak handle that does not keep the worker alive.
    pub(crate) fn downgrade(&self) -> WeakStream {
        WeakStream {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.inner.id).finish()
    }
}

/// Weak handle to a stream, used by the device's stream registry.
pub(crate) struct WeakStream {
    inner: Weak<StreamInner>,
}

impl WeakStream {
    /// Upgrade back to a `Stream` if any strong handle is still alive.
    pub(crate) fn upgrade(&self) -> Option<Stream> {
        self.inner.upgrade().map(|inner| Stream { inner })
    }
}

struct EventState {
    done: Mutex<bool>,
    cv: Condvar,
}

/// A completion marker recorded on a stream.
///
/// Completes once the recording stream's worker has executed all work that
/// was submitted before [`Stream::record_event`]. Clones observe the same
/// completion.
#[derive(Clone)]
pub struct Event {
    state: Arc<EventState>,
}

impl Event {
    fn new() -> Event {
        Event {
            state: Arc::new(EventState {
                done: Mutex::new(false),
                cv: Condvar::new(),
            }),
        }
    }

    fn signal(&self) {
        let mut done = self.state.done.lock().unwrap_or_else(|e| e.into_inner());
        *done = true;
        self.state.cv.notify_all();
    }

    /// Check whether the event has completed.
    ///
    /// Note: this is a snapshot; an incomplete event may complete immediately
    /// after returning.
    pub fn is_complete(&self) -> bool {
        *self.state.done.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until the event completes.
    pub fn wait(&self) {
        let mut done = self.state.done.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            done = self.state.cv.wait(done).unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("complete", &self.is_complete())
            .finish()
    }
}
