//! Per-connection framed byte channels owned by the broker thread.
//!
//! A [`Stream`] wraps one duplex socket with two runtime tasks: a reader
//! feeding a [`MessageDecoder`] and handing complete messages to the router,
//! and a writer draining a queue of encoded frames. Neither task ever blocks
//! the broker thread.
use std::{
    cell::{Cell, RefCell},
    collections::HashSet,
    fmt, io,
    net::{Shutdown, TcpStream as StdTcpStream},
    os::unix::net::UnixStream as StdUnixStream,
    rc::{Rc, Weak},
    thread,
};

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::StreamExt;
use monoio::io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt, Splitable};
use tracing::{debug, error, trace};

use crate::{
    broker::{Core, StreamId},
    message::{ContextId, Message, MessageDecoder},
};

// Read buffer size: 64 KB
const READ_BUFFER_SIZE: usize = 64 * 1024;
// Upper bound on frames coalesced into a single write.
const MAX_COALESCE_BYTES: usize = 256 * 1024;

pub type CloseHook = Box<dyn FnOnce() + Send>;

/// A connected socket waiting to be attached to a broker.
pub struct Transport {
    io: TransportIo,
    on_close: Option<CloseHook>,
}

enum TransportIo {
    Unix(StdUnixStream),
    Tcp(StdTcpStream),
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.io {
            TransportIo::Unix(s) => write!(f, "Transport::Unix({s:?})"),
            TransportIo::Tcp(s) => write!(f, "Transport::Tcp({s:?})"),
        }
    }
}

impl Transport {
    pub fn unix(stream: StdUnixStream) -> Self {
        Self {
            io: TransportIo::Unix(stream),
            on_close: None,
        }
    }

    pub fn tcp(stream: StdTcpStream) -> Self {
        Self {
            io: TransportIo::Tcp(stream),
            on_close: None,
        }
    }

    /// Two connected transports, e.g. for an in-process peer or a child's
    /// stdio.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = StdUnixStream::pair()?;
        Ok((Self::unix(a), Self::unix(b)))
    }

    /// Run `hook` on a helper thread once the stream closes. Used to reap
    /// child processes without blocking the broker.
    pub fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }
}

enum ShutdownHandle {
    Unix(StdUnixStream),
    Tcp(StdTcpStream),
}

impl ShutdownHandle {
    fn shutdown(&self, how: Shutdown) {
        let _ = match self {
            ShutdownHandle::Unix(s) => s.shutdown(how),
            ShutdownHandle::Tcp(s) => s.shutdown(how),
        };
    }
}

pub(crate) struct StreamOptions {
    pub id: StreamId,
    pub remote_id: ContextId,
    pub name: String,
    pub is_parent: bool,
    pub auth_id: Option<ContextId>,
    pub max_message_size: usize,
}

/// One attached connection. Lives on the broker thread only.
pub struct Stream {
    id: StreamId,
    name: String,
    remote_id: ContextId,
    is_parent: bool,
    auth_id: Option<ContextId>,
    reachable: RefCell<HashSet<ContextId>>,
    tx: UnboundedSender<Vec<u8>>,
    pending: Rc<Cell<usize>>,
    closed: Cell<bool>,
    handle: ShutdownHandle,
    on_close: RefCell<Option<CloseHook>>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stream({}, {})", self.id, self.name)
    }
}

impl Stream {
    /// Register `transport` with the running runtime and spawn its reader
    /// and writer tasks. Must run on the broker thread.
    pub(crate) fn start(
        core: Weak<Core>,
        transport: Transport,
        opts: StreamOptions,
    ) -> io::Result<Rc<Self>> {
        let Transport { io, on_close } = transport;
        let (tx, rx) = unbounded();
        let pending = Rc::new(Cell::new(0));
        let tasks = Tasks {
            core,
            id: opts.id,
            max_message_size: opts.max_message_size,
            rx,
            pending: pending.clone(),
        };

        let handle = match io {
            TransportIo::Unix(stream) => {
                // Because we build the async stream from a std one, it has to
                // be non_blocking under the legacy driver.
                if monoio::utils::is_legacy() {
                    stream.set_nonblocking(true)?;
                }
                let handle = stream.try_clone()?;
                let (reader, writer) = monoio::net::UnixStream::from_std(stream)?.into_split();
                tasks.spawn(reader, writer);
                ShutdownHandle::Unix(handle)
            }
            TransportIo::Tcp(stream) => {
                if monoio::utils::is_legacy() {
                    stream.set_nonblocking(true)?;
                }
                stream.set_nodelay(true)?;
                let handle = stream.try_clone()?;
                let (reader, writer) = monoio::net::TcpStream::from_std(stream)?.into_split();
                tasks.spawn(reader, writer);
                ShutdownHandle::Tcp(handle)
            }
        };

        Ok(Rc::new(Self {
            id: opts.id,
            name: opts.name,
            remote_id: opts.remote_id,
            is_parent: opts.is_parent,
            auth_id: opts.auth_id,
            reachable: RefCell::new(HashSet::from([opts.remote_id])),
            tx,
            pending,
            closed: Cell::new(false),
            handle,
            on_close: RefCell::new(on_close),
        }))
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remote_id(&self) -> ContextId {
        self.remote_id
    }

    pub fn is_parent(&self) -> bool {
        self.is_parent
    }

    /// Authority stamped on every message arriving here, if any.
    pub fn auth_id(&self) -> Option<ContextId> {
        self.auth_id
    }

    pub fn reaches(&self, id: ContextId) -> bool {
        self.reachable.borrow().contains(&id)
    }

    pub(crate) fn add_reachable(&self, id: ContextId) {
        self.reachable.borrow_mut().insert(id);
    }

    pub(crate) fn remove_reachable(&self, id: ContextId) {
        self.reachable.borrow_mut().remove(&id);
    }

    pub fn reachable(&self) -> Vec<ContextId> {
        let mut ids: Vec<_> = self.reachable.borrow().iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Queue `msg` for the writer. Returns false once the stream is closed.
    pub fn send(&self, msg: &Message) -> bool {
        if self.closed.get() {
            return false;
        }
        trace!("{:?}.send({:?})", self, msg);
        self.pending.set(self.pending.get() + 1);
        if self.tx.unbounded_send(msg.to_frame()).is_err() {
            self.pending.set(self.pending.get() - 1);
            return false;
        }
        true
    }

    /// True while encoded frames are queued but not yet written.
    pub fn wants_write(&self) -> bool {
        self.pending.get() > 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Stop reading, let the writer flush what is queued, then half-close.
    /// Only the first call has any effect.
    pub(crate) fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        debug!("{:?}: closing", self);
        self.tx.close_channel();
        self.handle.shutdown(Shutdown::Read);
        if let Some(hook) = self.on_close.borrow_mut().take() {
            thread::spawn(hook);
        }
    }
}

struct Tasks {
    core: Weak<Core>,
    id: StreamId,
    max_message_size: usize,
    rx: UnboundedReceiver<Vec<u8>>,
    pending: Rc<Cell<usize>>,
}

impl Tasks {
    fn spawn<R, W>(self, reader: R, writer: W)
    where
        R: AsyncReadRent + 'static,
        W: AsyncWriteRent + 'static,
    {
        let Tasks {
            core,
            id,
            max_message_size,
            rx,
            pending,
        } = self;
        monoio::spawn(read_loop(reader, core, id, max_message_size));
        monoio::spawn(write_loop(writer, rx, pending, id));
    }
}

async fn read_loop<R: AsyncReadRent>(
    mut reader: R,
    core: Weak<Core>,
    id: StreamId,
    max_message_size: usize,
) {
    let mut decoder = MessageDecoder::new(max_message_size);
    let mut buf = Vec::with_capacity(READ_BUFFER_SIZE);
    'read: loop {
        buf.clear();
        let (res, b) = reader.read(buf).await;
        buf = b;
        match res {
            Ok(0) => {
                debug!("stream {id}: eof");
                break;
            }
            Ok(_) => decoder.extend(&buf),
            Err(e) => {
                debug!("stream {id}: read failed: {e}");
                break;
            }
        }
        loop {
            match decoder.decode() {
                Ok(Some(msg)) => {
                    let Some(core) = core.upgrade() else {
                        return;
                    };
                    core.route(msg, Some(id));
                }
                Ok(None) => break,
                Err(e) => {
                    error!("stream {id}: {e}");
                    break 'read;
                }
            }
        }
    }
    if let Some(core) = core.upgrade() {
        core.close_stream(id);
    }
}

async fn write_loop<W: AsyncWriteRent>(
    mut writer: W,
    mut rx: UnboundedReceiver<Vec<u8>>,
    pending: Rc<Cell<usize>>,
    id: StreamId,
) {
    while let Some(mut frame) = rx.next().await {
        let mut frames = 1;
        while frame.len() < MAX_COALESCE_BYTES {
            match rx.try_next() {
                Ok(Some(more)) => {
                    frame.extend_from_slice(&more);
                    frames += 1;
                }
                _ => break,
            }
        }
        let (res, _) = writer.write_all(frame).await;
        pending.set(pending.get().saturating_sub(frames));
        if let Err(e) = res {
            debug!("stream {id}: write failed: {e}");
            rx.close();
            pending.set(0);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use std::{
        io::Read,
        os::unix::net::UnixStream,
        thread,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{config::RuntimeConfig, message::HEADER_LEN, Broker};

    const FRAMES: usize = 64;
    const PAYLOAD: usize = 64 * 1024;

    fn attach(broker: &Broker, io: UnixStream) -> StreamId {
        broker
            .defer_sync(move |core| {
                core.connect_stream(Transport::unix(io), 1, "peer".into(), false, None)
            })
            .unwrap()
            .unwrap()
    }

    // Queue more than a socket buffer holds.
    fn fill(broker: &Broker, id: StreamId) -> bool {
        broker
            .defer_sync(move |core| {
                let stream = core.stream(id).unwrap();
                let msg = Message::new(1, 1000, vec![7u8; PAYLOAD]);
                (0..FRAMES).all(|_| stream.send(&msg)) && stream.wants_write()
            })
            .unwrap()
    }

    fn wants_write(broker: &Broker, id: StreamId) -> bool {
        broker
            .defer_sync(move |core| core.stream(id).is_some_and(|s| s.wants_write()))
            .unwrap()
    }

    #[test]
    fn wants_write_while_the_peer_is_not_reading() {
        let broker = Broker::new(&RuntimeConfig::default()).unwrap();
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let id = attach(&broker, ours);
        assert!(!wants_write(&broker, id));

        assert!(fill(&broker, id));
        thread::sleep(Duration::from_millis(100));
        assert!(wants_write(&broker, id));
        assert_eq!(broker.defer_sync(|core| core.pending_writers()).unwrap(), 1);

        let mut buf = vec![0u8; FRAMES * (HEADER_LEN + PAYLOAD)];
        theirs.read_exact(&mut buf).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while wants_write(&broker, id) {
            assert!(Instant::now() < deadline, "queue never drained");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(broker.defer_sync(|core| core.pending_writers()).unwrap(), 0);

        broker.shutdown();
        broker.join();
    }

    #[test]
    fn shutdown_flushes_closed_streams() {
        let broker = Broker::new(&RuntimeConfig::default()).unwrap();
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let id = attach(&broker, ours);
        assert!(fill(&broker, id));

        broker.shutdown();
        let reader = thread::spawn(move || {
            let mut out = Vec::new();
            theirs.read_to_end(&mut out).unwrap();
            out.len()
        });
        broker.join();
        assert_eq!(reader.join().unwrap(), FRAMES * (HEADER_LEN + PAYLOAD));
    }
}
