//! The broker: one thread per process running the I/O event loop.
//!
//! Every [`Stream`](crate::stream::Stream), every routing table entry and
//! every timer lives on the broker thread inside [`Core`]. Other threads only
//! reach that state by queueing closures with [`Broker::defer`], which the
//! loop runs strictly in FIFO order.
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::StreamExt;
use tracing::{debug, error, info};

use crate::{config::RuntimeConfig, CallError, Error, Latch, Result};

mod runtime;
mod state;

pub use runtime::RuntimeWrapper;
pub use state::{Core, StreamId};

// How long shutdown waits for queued frames to reach the wire.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

type Deferred = Box<dyn FnOnce(&Rc<Core>) + Send>;

enum Command {
    Defer(Deferred),
    Shutdown,
}

/// Handle to a broker thread. Cheap to clone and safe to share.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

struct Inner {
    tx: UnboundedSender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl Broker {
    /// Spawn the broker thread and wait until its runtime is up.
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let (tx, rx) = unbounded();
        let ready = Arc::new(Latch::new());
        let runtime_type = config.runtime_type;
        let config = config.clone();
        let started = ready.clone();
        let handle = thread::Builder::new()
            .name("mitogen-broker".to_string())
            .spawn(move || {
                let mut runtime = match RuntimeWrapper::new(&config) {
                    Ok(runtime) => {
                        let _ = started.put(Ok(()));
                        runtime
                    }
                    Err(e) => {
                        let _ = started.put(Err(e));
                        return;
                    }
                };
                runtime.block_on(run(rx));
            })?;
        if let Err(e) = ready.get(None)? {
            let _ = handle.join();
            return Err(e.into());
        }
        info!("broker started with {:?} runtime", runtime_type);
        Ok(Self {
            inner: Arc::new(Inner {
                tx,
                thread: Mutex::new(Some(handle)),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    /// Queue `f` to run on the broker thread.
    ///
    /// Fails with [`Error::BrokerShutdown`] once the loop stopped accepting
    /// work; `f` is dropped without running in that case.
    pub fn defer<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Rc<Core>) + Send + 'static,
    {
        self.inner
            .tx
            .unbounded_send(Command::Defer(Box::new(f)))
            .map_err(|_| Error::BrokerShutdown)
    }

    /// Run `f` on the broker thread and wait for its result.
    ///
    /// Must not be called from the broker thread itself.
    pub fn defer_sync<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Rc<Core>) -> T + Send + 'static,
    {
        let latch = Arc::new(Latch::new());
        let reply = PutOnDrop(latch.clone());
        self.defer(move |core| {
            let _ = reply.0.put(Some(f(core)));
        })?;
        latch.get(None)?.ok_or(Error::BrokerShutdown)
    }

    /// Run `f` on the broker thread once `after` has elapsed.
    pub fn timer<F>(&self, after: Duration, f: F) -> Result<()>
    where
        F: FnOnce(&Rc<Core>) + Send + 'static,
    {
        self.defer(move |core| {
            let core = core.clone();
            monoio::spawn(async move {
                monoio::time::sleep(after).await;
                f(&core);
            });
        })
    }

    /// Ask the loop to stop. Streams are closed and every waiter is woken
    /// with a dead message. Idempotent, callable from any thread.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.swap(true, Ordering::AcqRel) {
            debug!("broker shutdown requested");
            let _ = self.inner.tx.unbounded_send(Command::Shutdown);
        }
    }

    /// Wait for the broker thread to exit. Idempotent.
    pub fn join(&self) {
        let handle = self
            .inner
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                error!("broker join called from the broker thread");
                return;
            }
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.inner.tx.is_closed()
    }
}

// Wakes a `defer_sync` caller whose closure panicked or was dropped unrun.
struct PutOnDrop<T>(Arc<Latch<Option<T>>>);

impl<T> Drop for PutOnDrop<T> {
    fn drop(&mut self) {
        let _ = self.0.put(None);
    }
}

async fn run(mut rx: UnboundedReceiver<Command>) {
    let core = Core::new();
    while let Some(command) = rx.next().await {
        match command {
            Command::Defer(f) => {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| f(&core))) {
                    error!(
                        "broker main loop crashed: {}",
                        CallError::from_panic(&*panic)
                    );
                    break;
                }
            }
            Command::Shutdown => break,
        }
    }

    // Closures queued before the channel closed still run, so any handler
    // they register is reached by the shutdown sweep below.
    rx.close();
    while let Ok(Some(command)) = rx.try_next() {
        if let Command::Defer(f) = command {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| f(&core))) {
                error!(
                    "deferred call crashed during shutdown: {}",
                    CallError::from_panic(&*panic)
                );
            }
        }
    }

    core.shutdown();
    core.flush(FLUSH_TIMEOUT).await;
    info!("broker stopped");
}
