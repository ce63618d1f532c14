use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io,
    rc::{Rc, Weak},
    time::{Duration, Instant},
};

use tracing::{debug, info};

use crate::{
    message::{ContextId, ADD_ROUTE, DISCONNECT, NO_REPLY},
    router::RouterTable,
    stream::{Stream, StreamOptions, Transport},
    DeadReason, Message,
};

pub type StreamId = u64;

/// Broker-thread state: every attached stream plus the routing table.
///
/// Only reachable from inside [`Broker::defer`](super::Broker::defer)
/// closures and the runtime tasks the broker spawns.
pub struct Core {
    me: Weak<Core>,
    streams: RefCell<HashMap<StreamId, Rc<Stream>>>,
    pub(crate) table: RefCell<RouterTable>,
    next_stream_id: Cell<StreamId>,
    /// Closed streams whose writers still hold queued frames.
    draining: RefCell<Vec<Rc<Stream>>>,
}

impl Core {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new_cyclic(|me| Core {
            me: me.clone(),
            streams: RefCell::new(HashMap::new()),
            table: RefCell::new(RouterTable::default()),
            next_stream_id: Cell::new(1),
            draining: RefCell::new(Vec::new()),
        })
    }

    pub fn context_id(&self) -> ContextId {
        self.table.borrow().context_id
    }

    /// Open streams leading away from our parent, by id.
    pub(crate) fn children(&self) -> Vec<Rc<Stream>> {
        let mut children: Vec<_> = self
            .streams
            .borrow()
            .values()
            .filter(|s| !s.is_parent())
            .cloned()
            .collect();
        children.sort_unstable_by_key(|s| s.id());
        children
    }

    pub fn stream(&self, id: StreamId) -> Option<Rc<Stream>> {
        self.streams.borrow().get(&id).cloned()
    }

    /// Stream `msg` for `dst` leaves on: its own route, else the parent.
    pub(crate) fn stream_for(&self, dst: ContextId) -> Option<Rc<Stream>> {
        let id = {
            let table = self.table.borrow();
            table.stream_by_id.get(&dst).copied().or(table.parent_stream)
        }?;
        self.stream(id)
    }

    /// Attach `transport` as the stream leading to `remote_id`.
    ///
    /// A child stream is announced to our parent with `ADD_ROUTE` so
    /// messages for `remote_id` find their way down from above. With
    /// `auth_id` set, messages arriving on the stream carry that authority.
    pub fn connect_stream(
        &self,
        transport: Transport,
        remote_id: ContextId,
        name: String,
        is_parent: bool,
        auth_id: Option<ContextId>,
    ) -> io::Result<StreamId> {
        let id = self.next_stream_id.get();
        self.next_stream_id.set(id + 1);
        let max_message_size = self.table.borrow().max_message_size;
        let stream = Stream::start(
            self.me.clone(),
            transport,
            StreamOptions {
                id,
                remote_id,
                name,
                is_parent,
                auth_id,
                max_message_size,
            },
        )?;
        debug!("{:?}: attached for context {}", stream, remote_id);
        self.streams.borrow_mut().insert(id, stream);
        {
            let mut table = self.table.borrow_mut();
            table.stream_by_id.insert(remote_id, id);
            if is_parent {
                table.parent_stream = Some(id);
            }
        }
        if !is_parent {
            self.propagate_up(ADD_ROUTE, remote_id);
        }
        Ok(id)
    }

    /// Close stream `id` and deliver one disconnect notice per context
    /// reachable through it. A no-op for unknown or already closed streams.
    pub fn close_stream(&self, id: StreamId) {
        let Some(stream) = self.streams.borrow_mut().remove(&id) else {
            return;
        };
        stream.close();
        {
            let mut draining = self.draining.borrow_mut();
            draining.retain(|s| s.wants_write());
            if stream.wants_write() {
                draining.push(stream.clone());
            }
        }
        let was_parent = {
            let mut table = self.table.borrow_mut();
            let was_parent = table.parent_stream == Some(id);
            if was_parent {
                table.parent_stream = None;
            }
            was_parent
        };
        for context in stream.reachable() {
            let notice = Message {
                dst_id: self.context_id(),
                src_id: context,
                auth_id: context,
                handle: DISCONNECT,
                reply_to: NO_REPLY,
                ..Message::dead(&DeadReason::Disconnected)
            };
            self.route(notice, None);
        }
        if was_parent {
            self.reap_orphans();
        }
    }

    /// Close every stream and fail every remaining handler.
    pub(crate) fn shutdown(&self) {
        let mut ids: Vec<_> = self.streams.borrow().keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.close_stream(id);
        }
        self.fail_all_handlers(DeadReason::Shutdown);
    }

    /// Streams, open or closed, with frames not yet written.
    pub fn pending_writers(&self) -> usize {
        let open = self
            .streams
            .borrow()
            .values()
            .filter(|s| s.wants_write())
            .count();
        let mut draining = self.draining.borrow_mut();
        draining.retain(|s| s.wants_write());
        open + draining.len()
    }

    /// Wait for stream writers to drain their queues, at most `timeout`.
    pub(crate) async fn flush(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = self.pending_writers();
            if pending == 0 {
                return;
            }
            if Instant::now() >= deadline {
                info!("{} stream(s) still flushing at exit", pending);
                return;
            }
            monoio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
