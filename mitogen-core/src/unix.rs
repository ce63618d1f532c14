//! Unix socket listener letting unrelated processes join a master's tree.
//!
//! Each accepted peer is given a fresh context id and becomes a child of
//! the listening router; the first 12 bytes on the socket tell it who it is.
//! Peers act with the listener's authority, so they may drive any context
//! the master can.
use std::{
    io::{Read, Write},
    os::unix::net::{UnixListener as StdUnixListener, UnixStream as StdUnixStream},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
};

use tracing::{debug, info, warn};

use crate::{
    config::RouterConfig, message::ContextId, Broker, Context, Error, Result, Router, Transport,
};

pub const HANDSHAKE_LEN: usize = 12;

/// Identity a listener hands each accepted peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub context_id: ContextId,
    pub parent_id: ContextId,
    pub pid: u32,
}

impl Handshake {
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0..4].copy_from_slice(&self.context_id.to_be_bytes());
        buf[4..8].copy_from_slice(&self.parent_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.pid.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HANDSHAKE_LEN]) -> Self {
        let word = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Self {
            context_id: word(0),
            parent_id: word(4),
            pid: word(8),
        }
    }
}

/// Accepts connections on a Unix socket path until closed or dropped.
pub struct Listener {
    path: PathBuf,
    stopping: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    /// Bind `path` (replacing a stale socket) and start accepting. Only the
    /// master can listen, since accepting allocates context ids.
    pub fn bind(router: &Router, path: impl AsRef<Path>) -> Result<Self> {
        if !router.is_master() {
            return Err(Error::Protocol("only the master context can listen".into()));
        }
        let path = path.as_ref().to_path_buf();
        // Try remove file first
        let _ = std::fs::remove_file(&path);
        let listener = StdUnixListener::bind(&path)?;
        info!("listening on {}", path.display());

        let stopping = Arc::new(AtomicBool::new(false));
        let router = router.clone();
        let stop = stopping.clone();
        let thread = thread::Builder::new()
            .name("mitogen-listener".to_string())
            .spawn(move || {
                for conn in listener.incoming() {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    let result = conn.map_err(Error::from).and_then(|c| accept(&router, c));
                    if let Err(e) = result {
                        warn!("failed to accept connection: {}", e);
                        if !router.broker().is_running() {
                            break;
                        }
                    }
                }
                debug!("listener stopped");
            })?;
        Ok(Self {
            path,
            stopping,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting and remove the socket file. Idempotent.
    pub fn close(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wake the blocking accept.
        let _ = StdUnixStream::connect(&self.path);
        let thread = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept(router: &Router, mut conn: StdUnixStream) -> Result<()> {
    let handshake = Handshake {
        context_id: router.allocate_id()?,
        parent_id: router.context_id(),
        pid: std::process::id(),
    };
    conn.write_all(&handshake.encode())?;
    debug!("accepted context {}", handshake.context_id);
    router.connect_trusted_stream(
        Transport::unix(conn),
        handshake.context_id,
        format!("unix.{}", handshake.context_id),
    )?;
    Ok(())
}

/// Join the tree of the master listening at `path`.
///
/// Returns this process' router and its parent context.
pub fn connect(
    path: impl AsRef<Path>,
    broker: Broker,
    config: &RouterConfig,
) -> Result<(Router, Context)> {
    let mut conn = StdUnixStream::connect(path.as_ref())?;
    let mut buf = [0u8; HANDSHAKE_LEN];
    conn.read_exact(&mut buf)?;
    let handshake = Handshake::decode(&buf);
    debug!(
        "connected to {} as context {} (master pid {})",
        path.as_ref().display(),
        handshake.context_id,
        handshake.pid
    );
    let router = Router::with_parent(broker, config, handshake.context_id, handshake.parent_id)?;
    let parent = router.connect_stream(
        Transport::unix(conn),
        handshake.parent_id,
        "parent",
        true,
    )?;
    Ok((router, parent))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        config::RuntimeConfig,
        dispatch::{Dispatcher, FunctionRegistry, PING},
        testing::{master, stop},
        HandlerOptions, Message,
    };

    fn client(path: &Path) -> (Router, Context) {
        let broker = Broker::new(&RuntimeConfig::default()).unwrap();
        connect(path, broker, &RouterConfig::default()).unwrap()
    }

    #[test]
    fn handshake_layout() {
        let hs = Handshake {
            context_id: 7,
            parent_id: 0,
            pid: 0x01020304,
        };
        let buf = hs.encode();
        assert_eq!(buf, [0, 0, 0, 7, 0, 0, 0, 0, 1, 2, 3, 4]);
        assert_eq!(Handshake::decode(&buf), hs);
    }

    #[test]
    fn clients_join_the_master_tree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mux.sock");
        let master = master();
        let listener = Listener::bind(&master, &path).unwrap();

        let (one, parent) = client(&path);
        let (two, _) = client(&path);
        assert_ne!(one.context_id(), two.context_id());
        assert_eq!(parent.id(), master.context_id());

        // Client to master.
        let rx = master.receiver(HandlerOptions::default());
        parent
            .send(rx.handle(), Message::encoded("hello").unwrap())
            .unwrap();
        let msg = rx.get(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(msg.src_id, one.context_id());
        assert_eq!(msg.decode::<String>().unwrap(), "hello");

        // Master to client.
        let _dispatcher = Dispatcher::start(&two, FunctionRegistry::new()).unwrap();
        let ctx = master.context_by_id(two.context_id(), "two");
        assert!(ctx.call::<bool, _>(PING, &()).unwrap());

        listener.close();
        assert!(!path.exists());
        stop(&one);
        stop(&two);
        stop(&master);
    }

    #[test]
    fn only_the_master_listens() {
        let dir = tempfile::tempdir().unwrap();
        let master = master();
        let child = crate::testing::child_of(&master, 1);
        assert!(Listener::bind(&child, dir.path().join("x.sock")).is_err());
        stop(&child);
        stop(&master);
    }
}
