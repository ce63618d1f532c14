//! Handle dispatch, context routing and the call protocol.
//!
//! [`Router`] is the thread-safe face of the routing table kept in
//! [`Core`]. Every mutation it performs is deferred onto the broker thread;
//! the only blocking operations are waits on a [`Receiver`].
use std::{
    collections::HashMap,
    fmt,
    ops::Range,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error, trace, warn};

use crate::{
    broker::{Core, StreamId},
    config::{RouterConfig, DEFAULT_MAX_MESSAGE_SIZE},
    dispatch::CallRequest,
    message::{
        ContextId, Handle, ADD_ROUTE, ALLOCATE_ID, CALL_FUNCTION, DEL_ROUTE, DISCONNECT,
        FIRST_DYNAMIC_HANDLE, MASTER_ID, NO_REPLY, SHUTDOWN,
    },
    stream::Transport,
    Broker, CallError, Context, DeadReason, Error, Latch, Message, Result,
};

/// Ids handed to a child per `ALLOCATE_ID` request.
pub const ID_BLOCK_SIZE: u32 = 1000;

const REFUSED_BY_POLICY: &str = "Refused by policy.";

/// Decides whether a handler accepts a message. Runs on the broker thread.
pub type Policy = Arc<dyn Fn(&Message) -> bool + Send + Sync>;
type HandlerFn = Arc<dyn Fn(Message) + Send + Sync>;
type DisconnectListener = Arc<dyn Fn(ContextId) + Send + Sync>;

/// How a handler is registered.
#[derive(Clone, Default)]
pub struct HandlerOptions {
    /// Well-known handle to register at instead of allocating one.
    pub handle: Option<Handle>,
    /// Stay registered after the first delivery.
    pub persist: bool,
    /// Context whose disconnection fails the handler with a dead message.
    pub respondent: Option<ContextId>,
    pub policy: Option<Policy>,
}

impl fmt::Debug for HandlerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerOptions")
            .field("handle", &self.handle)
            .field("persist", &self.persist)
            .field("respondent", &self.respondent)
            .field("policy", &self.policy.is_some())
            .finish()
    }
}

impl HandlerOptions {
    pub fn persistent() -> Self {
        Self {
            persist: true,
            ..Default::default()
        }
    }

    pub fn at(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn respondent(mut self, context_id: ContextId) -> Self {
        self.respondent = Some(context_id);
        self
    }

    pub fn policy(mut self, policy: impl Fn(&Message) -> bool + Send + Sync + 'static) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }
}

#[derive(Clone)]
pub(crate) struct HandlerEntry {
    func: HandlerFn,
    persist: bool,
    respondent: Option<ContextId>,
    policy: Option<Policy>,
}

/// Routing state owned by the broker thread.
pub(crate) struct RouterTable {
    pub context_id: ContextId,
    pub parent_id: Option<ContextId>,
    pub max_message_size: usize,
    pub handlers: HashMap<Handle, HandlerEntry>,
    pub stream_by_id: HashMap<ContextId, StreamId>,
    pub parent_stream: Option<StreamId>,
    pub listeners: Vec<DisconnectListener>,
}

impl Default for RouterTable {
    fn default() -> Self {
        Self {
            context_id: MASTER_ID,
            parent_id: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            handlers: HashMap::new(),
            stream_by_id: HashMap::new(),
            parent_stream: None,
            listeners: Vec::new(),
        }
    }
}

impl Core {
    fn configure(&self, context_id: ContextId, parent_id: Option<ContextId>, max: usize) {
        let mut table = self.table.borrow_mut();
        table.context_id = context_id;
        table.parent_id = parent_id;
        table.max_message_size = max;
    }

    fn add_handler(&self, handle: Handle, entry: HandlerEntry) {
        trace!("add_handler({})", handle);
        let old = self.table.borrow_mut().handlers.insert(handle, entry);
        if old.is_some() {
            warn!("handler {} replaced", handle);
        }
    }

    fn del_handler(&self, handle: Handle) -> bool {
        self.table.borrow_mut().handlers.remove(&handle).is_some()
    }

    /// Route `msg`, which arrived on stream `via` or was produced locally.
    pub(crate) fn route(&self, mut msg: Message, via: Option<StreamId>) {
        trace!("route({:?}, via={:?})", msg, via);
        if let Some(via) = via {
            let Some(stream) = self.stream(via) else {
                return;
            };
            if !stream.is_parent() {
                if !stream.reaches(msg.auth_id) {
                    error!("bad auth_id: got {} via {:?}, dropping {:?}", msg.auth_id, stream, msg);
                    return;
                }
                if msg.src_id != msg.auth_id && !stream.reaches(msg.src_id) {
                    error!("bad src_id: got {} via {:?}, dropping {:?}", msg.src_id, stream, msg);
                    return;
                }
            }
            if let Some(auth_id) = stream.auth_id() {
                msg.auth_id = auth_id;
            }
        }

        let (me, max) = {
            let table = self.table.borrow();
            (table.context_id, table.max_message_size)
        };
        if msg.data.len() > max {
            error!("message too large (max {} bytes), dropping {:?}", max, msg);
            return;
        }

        if msg.dst_id == me {
            self.deliver_local(msg, via);
        } else {
            self.forward(msg, via);
        }
    }

    fn forward(&self, msg: Message, via: Option<StreamId>) {
        let stream = self
            .stream_for(msg.dst_id)
            .filter(|s| Some(s.id()) != via && !s.is_closed());
        match stream {
            Some(stream) if stream.send(&msg) => {}
            _ => {
                error!("no route to context {} for {:?}", msg.dst_id, msg);
                self.reply_dead(&msg, DeadReason::NoRoute(msg.dst_id));
            }
        }
    }

    fn deliver_local(&self, msg: Message, via: Option<StreamId>) {
        match msg.handle {
            DISCONNECT => {
                if msg.is_dead {
                    self.context_disconnected(msg.src_id);
                }
                return;
            }
            ADD_ROUTE => return self.on_add_route(&msg, via),
            DEL_ROUTE => return self.on_del_route(&msg, via),
            _ => {}
        }

        let entry = self.table.borrow().handlers.get(&msg.handle).cloned();
        let Some(entry) = entry else {
            warn!("dead-letter: no handler for {:?}", msg);
            self.reply_dead(&msg, DeadReason::InvalidHandle(msg.handle));
            return;
        };

        if let Some(policy) = &entry.policy {
            if !policy(&msg) {
                warn!("policy refused message: {:?}", msg);
                self.reply_error(&msg, CallError::new(REFUSED_BY_POLICY));
                return;
            }
        }

        if !entry.persist {
            self.table.borrow_mut().handlers.remove(&msg.handle);
        }
        self.invoke(msg.handle, &entry, msg);
    }

    fn invoke(&self, handle: Handle, entry: &HandlerEntry, msg: Message) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (entry.func)(msg))) {
            error!("handler {} crashed: {}", handle, CallError::from_panic(&*panic));
        }
    }

    fn dead_message(&self, handle: Handle, from: ContextId, reason: &DeadReason) -> Message {
        Message {
            dst_id: self.context_id(),
            src_id: from,
            auth_id: from,
            handle,
            ..Message::dead(reason)
        }
    }

    fn reply_dead(&self, msg: &Message, reason: DeadReason) {
        if msg.is_dead || msg.reply_to == NO_REPLY {
            return;
        }
        let reply = Message {
            dst_id: msg.src_id,
            src_id: self.context_id(),
            auth_id: self.context_id(),
            handle: msg.reply_to,
            ..Message::dead(&reason)
        };
        self.route(reply, None);
    }

    fn reply_error(&self, msg: &Message, err: CallError) {
        if msg.is_dead || msg.reply_to == NO_REPLY {
            return;
        }
        match msg.reply::<()>(&Err(err)) {
            Ok(mut reply) => {
                reply.src_id = self.context_id();
                reply.auth_id = self.context_id();
                self.route(reply, None);
            }
            Err(e) => error!("failed to encode reply: {}", e),
        }
    }

    fn on_add_route(&self, msg: &Message, via: Option<StreamId>) {
        let target = match msg.decode::<ContextId>() {
            Ok(target) => target,
            Err(e) => return error!("bad ADD_ROUTE payload: {}", e),
        };
        let Some(stream) = via.and_then(|id| self.stream(id)) else {
            return;
        };
        if stream.is_parent() {
            return warn!("ignoring ADD_ROUTE for {} from parent", target);
        }
        debug!("adding route to {} via {:?}", target, stream);
        self.add_route(target, stream.id());
    }

    fn on_del_route(&self, msg: &Message, via: Option<StreamId>) {
        let target = match msg.decode::<ContextId>() {
            Ok(target) => target,
            Err(e) => return error!("bad DEL_ROUTE payload: {}", e),
        };
        let owner = self.table.borrow().stream_by_id.get(&target).copied();
        let from_parent = via
            .and_then(|id| self.stream(id))
            .is_some_and(|s| s.is_parent());
        if from_parent {
            // A context lost somewhere above us. We never routed it, so
            // only our waiters and our own children need to hear.
            if owner.is_some() || target == self.context_id() {
                return warn!("ignoring DEL_ROUTE for {} from parent", target);
            }
            debug!("context {} lost upstream", target);
            self.notify_lost(target);
            self.propagate_down(DEL_ROUTE, target, None);
            return;
        }
        if via.is_some() && owner != via {
            return warn!("ignoring DEL_ROUTE for {} from a stream not routing it", target);
        }
        self.context_disconnected(target);
    }

    fn add_route(&self, target: ContextId, stream_id: StreamId) {
        let Some(stream) = self.stream(stream_id) else {
            return;
        };
        stream.add_reachable(target);
        self.table.borrow_mut().stream_by_id.insert(target, stream_id);
        self.propagate_up(ADD_ROUTE, target);
    }

    /// Forget `id`: fail its respondent handlers, run disconnect listeners
    /// and tell our parent and our other children. Only the first notice for
    /// a route has effect.
    pub(crate) fn context_disconnected(&self, id: ContextId) {
        let (stream_id, upward) = {
            let mut table = self.table.borrow_mut();
            let Some(stream_id) = table.stream_by_id.remove(&id) else {
                return;
            };
            (stream_id, table.parent_id != Some(id))
        };
        if let Some(stream) = self.stream(stream_id) {
            stream.remove_reachable(id);
        }
        self.notify_lost(id);
        if upward {
            self.propagate_up(DEL_ROUTE, id);
        }
        self.propagate_down(DEL_ROUTE, id, Some(stream_id));
    }

    // Fail handlers waiting on `id` and run the disconnect listeners.
    fn notify_lost(&self, id: ContextId) {
        let (failed, listeners) = {
            let mut table = self.table.borrow_mut();
            let mut handles: Vec<_> = table
                .handlers
                .iter()
                .filter(|(_, e)| e.respondent == Some(id))
                .map(|(h, _)| *h)
                .collect();
            handles.sort_unstable();
            let failed: Vec<_> = handles
                .into_iter()
                .filter_map(|h| table.handlers.remove(&h).map(|e| (h, e)))
                .collect();
            (failed, table.listeners.clone())
        };
        debug!("context {} disconnected, failing {} handler(s)", id, failed.len());
        for (handle, entry) in failed {
            let dead = self.dead_message(handle, id, &DeadReason::Disconnected);
            self.invoke(handle, &entry, dead);
        }
        for listener in listeners {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(id))) {
                error!("disconnect listener crashed: {}", CallError::from_panic(&*panic));
            }
        }
    }

    /// Send a route change for `target` to our parent, if we have one.
    pub(crate) fn propagate_up(&self, handle: Handle, target: ContextId) {
        let (me, parent_id) = {
            let table = self.table.borrow();
            match (table.parent_id, table.parent_stream) {
                (Some(parent_id), Some(_)) => (table.context_id, parent_id),
                _ => return,
            }
        };
        match Message::encoded(&target) {
            Ok(msg) => {
                let msg = Message {
                    src_id: me,
                    auth_id: me,
                    ..msg.with_dst(parent_id, handle)
                };
                self.route(msg, None);
            }
            Err(e) => error!("failed to encode route update: {}", e),
        }
    }

    /// Send a route change for `target` to every child stream but `except`.
    pub(crate) fn propagate_down(&self, handle: Handle, target: ContextId, except: Option<StreamId>) {
        let me = self.context_id();
        let msg = match Message::encoded(&target) {
            Ok(msg) => msg,
            Err(e) => return error!("failed to encode route update: {}", e),
        };
        for stream in self.children() {
            if Some(stream.id()) == except || stream.remote_id() == target {
                continue;
            }
            let update = Message {
                src_id: me,
                auth_id: me,
                ..msg.clone().with_dst(stream.remote_id(), handle)
            };
            stream.send(&update);
        }
    }

    /// Fail handlers waiting on contexts that lost their last route.
    pub(crate) fn reap_orphans(&self) {
        let failed: Vec<_> = {
            let mut table = self.table.borrow_mut();
            let me = table.context_id;
            let mut orphans: Vec<_> = table
                .handlers
                .iter()
                .filter_map(|(h, e)| match e.respondent {
                    Some(r) if r != me && !table.stream_by_id.contains_key(&r) => Some((*h, r)),
                    _ => None,
                })
                .collect();
            orphans.sort_unstable();
            orphans
                .into_iter()
                .filter_map(|(h, r)| table.handlers.remove(&h).map(|e| (h, r, e)))
                .collect()
        };
        for (handle, respondent, entry) in failed {
            let dead = self.dead_message(handle, respondent, &DeadReason::Disconnected);
            self.invoke(handle, &entry, dead);
        }
    }

    pub(crate) fn fail_all_handlers(&self, reason: DeadReason) {
        let mut handlers: Vec<_> = self.table.borrow_mut().handlers.drain().collect();
        handlers.sort_unstable_by_key(|(h, _)| *h);
        let me = self.context_id();
        for (handle, entry) in handlers {
            let dead = self.dead_message(handle, me, &reason);
            self.invoke(handle, &entry, dead);
        }
    }
}

enum IdAllocator {
    Master(Arc<AtomicU32>),
    Child(Mutex<Range<ContextId>>),
}

/// Thread-safe handle to a broker's routing table.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

struct Inner {
    broker: Broker,
    context_id: ContextId,
    parent_ids: Vec<ContextId>,
    max_message_size: usize,
    next_handle: AtomicU32,
    ids: IdAllocator,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Router(context_id={})", self.inner.context_id)
    }
}

impl Router {
    /// Router for the master context, the root of the tree.
    pub fn new(broker: Broker, config: &RouterConfig) -> Result<Self> {
        let next_id = Arc::new(AtomicU32::new(1));
        let router = Self::build(
            broker,
            config,
            MASTER_ID,
            Vec::new(),
            IdAllocator::Master(next_id.clone()),
        )?;
        let this = router.clone();
        router.add_handler(
            move |msg| {
                if msg.is_dead {
                    return;
                }
                let start = next_id.fetch_add(ID_BLOCK_SIZE, Ordering::Relaxed);
                let range: std::result::Result<_, CallError> = Ok((start, start + ID_BLOCK_SIZE));
                if let Err(e) = msg.reply(&range).and_then(|reply| this.route(reply)) {
                    error!("failed to answer ALLOCATE_ID: {}", e);
                }
            },
            HandlerOptions::persistent().at(ALLOCATE_ID),
        );
        Ok(router)
    }

    /// Router for a child context reached from `parent_id`, itself a child
    /// of the master.
    pub fn with_parent(
        broker: Broker,
        config: &RouterConfig,
        context_id: ContextId,
        parent_id: ContextId,
    ) -> Result<Self> {
        let mut parent_ids = vec![parent_id];
        if parent_id != MASTER_ID {
            parent_ids.push(MASTER_ID);
        }
        Self::with_ancestors(broker, config, context_id, parent_ids)
    }

    /// Router for a child context. `parent_ids` lists its ancestors, nearest
    /// first and ending with the master.
    pub fn with_ancestors(
        broker: Broker,
        config: &RouterConfig,
        context_id: ContextId,
        parent_ids: Vec<ContextId>,
    ) -> Result<Self> {
        if parent_ids.is_empty() {
            return Err(Error::Protocol("a child context needs a parent".into()));
        }
        let router = Self::build(
            broker,
            config,
            context_id,
            parent_ids,
            IdAllocator::Child(Mutex::new(0..0)),
        )?;
        let broker = router.broker().clone();
        router.add_handler(
            move |msg| {
                if !msg.is_dead {
                    debug!("shutdown requested by context {}", msg.src_id);
                    broker.shutdown();
                }
            },
            HandlerOptions::persistent()
                .at(SHUTDOWN)
                .policy(router.parent_authority()),
        );
        Ok(router)
    }

    fn build(
        broker: Broker,
        config: &RouterConfig,
        context_id: ContextId,
        parent_ids: Vec<ContextId>,
        ids: IdAllocator,
    ) -> Result<Self> {
        let max = config.max_message_size;
        let parent_id = parent_ids.first().copied();
        broker.defer_sync(move |core| core.configure(context_id, parent_id, max))?;
        Ok(Self {
            inner: Arc::new(Inner {
                broker,
                context_id,
                parent_ids,
                max_message_size: max,
                next_handle: AtomicU32::new(FIRST_DYNAMIC_HANDLE),
                ids,
            }),
        })
    }

    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    pub fn context_id(&self) -> ContextId {
        self.inner.context_id
    }

    pub fn parent_id(&self) -> Option<ContextId> {
        self.inner.parent_ids.first().copied()
    }

    /// Ancestors of this context, nearest first. Empty on the master.
    pub fn parent_ids(&self) -> &[ContextId] {
        &self.inner.parent_ids
    }

    pub fn is_master(&self) -> bool {
        self.inner.parent_ids.is_empty()
    }

    pub fn max_message_size(&self) -> usize {
        self.inner.max_message_size
    }

    /// Accepts messages carrying the authority of ourselves or one of our
    /// ancestors.
    pub fn parent_authority(&self) -> impl Fn(&Message) -> bool + Send + Sync + 'static {
        let me = self.inner.context_id;
        let parents = self.inner.parent_ids.clone();
        move |msg| msg.auth_id == me || parents.contains(&msg.auth_id)
    }

    pub fn context_by_id(&self, id: ContextId, name: impl Into<String>) -> Context {
        Context::new(self.clone(), id, name)
    }

    pub fn myself(&self) -> Context {
        self.context_by_id(self.context_id(), "self")
    }

    pub fn parent(&self) -> Option<Context> {
        self.parent_id().map(|id| self.context_by_id(id, "parent"))
    }

    /// Register `func` and return its handle.
    ///
    /// If the broker already stopped, `func` immediately receives a dead
    /// message instead, so nothing waits on a handler that can never fire.
    pub fn add_handler<F>(&self, func: F, options: HandlerOptions) -> Handle
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let handle = options
            .handle
            .unwrap_or_else(|| self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        let func: HandlerFn = Arc::new(func);
        let entry = HandlerEntry {
            func: func.clone(),
            persist: options.persist,
            respondent: options.respondent,
            policy: options.policy,
        };
        if self
            .inner
            .broker
            .defer(move |core| core.add_handler(handle, entry))
            .is_err()
        {
            func(Message {
                dst_id: self.context_id(),
                src_id: self.context_id(),
                auth_id: self.context_id(),
                handle,
                ..Message::dead(&DeadReason::Shutdown)
            });
        }
        handle
    }

    pub fn del_handler(&self, handle: Handle) -> Result<()> {
        self.inner.broker.defer(move |core| {
            core.del_handler(handle);
        })
    }

    /// Send `msg` from this context. Never blocks.
    pub fn route(&self, mut msg: Message) -> Result<()> {
        msg.src_id = self.context_id();
        msg.auth_id = self.context_id();
        if msg.data.len() > self.inner.max_message_size {
            error!(
                "message too large (max {} bytes), dropping {:?}",
                self.inner.max_message_size, msg
            );
            return Err(Error::Protocol(format!(
                "message too large (max {} bytes)",
                self.inner.max_message_size
            )));
        }
        self.inner.broker.defer(move |core| core.route(msg, None))
    }

    pub fn receiver(&self, options: HandlerOptions) -> Receiver {
        Receiver::new(self, options)
    }

    /// Start `function(args)` in `context` and return the pending reply.
    pub fn call_async<A>(&self, context: ContextId, function: &str, args: &A) -> Result<Receiver>
    where
        A: Serialize + ?Sized,
    {
        let request = CallRequest::new(function, args)?;
        let receiver = self.receiver(HandlerOptions::default().respondent(context));
        let msg = Message::encoded(&request)?
            .with_dst(context, CALL_FUNCTION)
            .with_reply_to(receiver.handle());
        self.route(msg)?;
        Ok(receiver)
    }

    pub fn call<R, A>(&self, context: ContextId, function: &str, args: &A) -> Result<R>
    where
        R: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        self.call_async(context, function, args)?.get_data(None)
    }

    /// Like [`Router::call`], giving up after `timeout`.
    ///
    /// Giving up only stops the wait: the remote function keeps running and
    /// its eventual reply is discarded as a dead-letter.
    pub fn call_with_timeout<R, A>(
        &self,
        context: ContextId,
        function: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R>
    where
        R: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        self.call_async(context, function, args)?
            .get_data(Some(timeout))
    }

    /// Attach `transport` as the stream to `remote_id`. With `is_parent`
    /// the stream becomes the default route for every unknown destination.
    pub fn connect_stream(
        &self,
        transport: Transport,
        remote_id: ContextId,
        name: impl Into<String>,
        is_parent: bool,
    ) -> Result<Context> {
        self.attach(transport, remote_id, name.into(), is_parent, None)
    }

    /// Attach a child stream whose traffic is granted this context's own
    /// authority, as for local processes joining through a listener.
    pub fn connect_trusted_stream(
        &self,
        transport: Transport,
        remote_id: ContextId,
        name: impl Into<String>,
    ) -> Result<Context> {
        let me = self.context_id();
        self.attach(transport, remote_id, name.into(), false, Some(me))
    }

    fn attach(
        &self,
        transport: Transport,
        remote_id: ContextId,
        name: String,
        is_parent: bool,
        auth_id: Option<ContextId>,
    ) -> Result<Context> {
        let stream_name = name.clone();
        self.inner.broker.defer_sync(move |core| {
            core.connect_stream(transport, remote_id, stream_name, is_parent, auth_id)
        })??;
        Ok(self.context_by_id(remote_id, name))
    }

    /// Route messages for `target` over the stream that reaches `via`.
    pub fn add_route(&self, target: ContextId, via: ContextId) -> Result<()> {
        self.inner.broker.defer(move |core| {
            let stream_id = core.table.borrow().stream_by_id.get(&via).copied();
            match stream_id {
                Some(stream_id) => core.add_route(target, stream_id),
                None => error!("cannot add route to {}: no stream reaches {}", target, via),
            }
        })
    }

    /// Drop the route to `target`, treating it as disconnected.
    pub fn del_route(&self, target: ContextId) -> Result<()> {
        self.inner
            .broker
            .defer(move |core| core.context_disconnected(target))
    }

    /// Close the stream leading directly to `id`, if there is one.
    pub fn disconnect(&self, id: ContextId) -> Result<()> {
        self.inner.broker.defer(move |core| {
            let stream_id = core.table.borrow().stream_by_id.get(&id).copied();
            let Some(stream) = stream_id.and_then(|s| core.stream(s)) else {
                return;
            };
            if stream.remote_id() == id {
                core.close_stream(stream.id());
            }
        })
    }

    /// Call `listener` on the broker thread whenever a context disconnects.
    pub fn on_disconnect<F>(&self, listener: F) -> Result<()>
    where
        F: Fn(ContextId) + Send + Sync + 'static,
    {
        let listener: DisconnectListener = Arc::new(listener);
        self.inner
            .broker
            .defer(move |core| core.table.borrow_mut().listeners.push(listener))
    }

    /// A context id never handed out before, anywhere in the tree.
    ///
    /// On a child this may block on the parent and must not run on the
    /// broker thread.
    pub fn allocate_id(&self) -> Result<ContextId> {
        match &self.inner.ids {
            IdAllocator::Master(next) => Ok(next.fetch_add(1, Ordering::Relaxed)),
            IdAllocator::Child(range) => {
                let mut range = range.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(id) = range.next() {
                    return Ok(id);
                }
                let parent = self.parent_id().unwrap_or(MASTER_ID);
                let receiver = self.receiver(HandlerOptions::default().respondent(parent));
                let msg = Message::encoded(&())?
                    .with_dst(parent, ALLOCATE_ID)
                    .with_reply_to(receiver.handle());
                self.route(msg)?;
                let (start, end): (ContextId, ContextId) = receiver.get_data(None)?;
                debug!("allocated ids {}..{} from parent", start, end);
                *range = start..end;
                range
                    .next()
                    .ok_or_else(|| Error::Protocol("parent allocated an empty id block".into()))
            }
        }
    }
}

/// Receiving end of a handler: a [`Latch`] fed by the broker thread.
pub struct Receiver {
    router: Router,
    handle: Handle,
    latch: Arc<Latch<Message>>,
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Receiver(handle={})", self.handle)
    }
}

impl Receiver {
    pub fn new(router: &Router, options: HandlerOptions) -> Self {
        let latch = Arc::new(Latch::new());
        let sink = latch.clone();
        let handle = router.add_handler(
            move |msg| {
                let _ = sink.put(msg);
            },
            options,
        );
        Self {
            router: router.clone(),
            handle,
            latch,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// A [`Sender`] addressing this receiver from anywhere in the tree.
    pub fn to_sender(&self) -> Sender {
        Sender::new(&self.router, self.router.context_id(), self.handle)
    }

    /// Next message. Dead messages surface as [`Error::Dead`] or
    /// [`Error::Routing`].
    pub fn get(&self, timeout: Option<Duration>) -> Result<Message> {
        let msg = self.latch.get(timeout)?;
        if msg.is_dead {
            return Err(msg.dead_reason().into());
        }
        Ok(msg)
    }

    /// Next message decoded as a reply envelope.
    pub fn get_data<T: DeserializeOwned>(&self, timeout: Option<Duration>) -> Result<T> {
        self.get(timeout)?.unpickle()
    }

    pub fn try_get(&self) -> Option<Message> {
        self.latch.try_get()
    }

    /// Unregister and wake every waiter with [`Error::LatchClosed`].
    pub fn close(&self) {
        let _ = self.router.del_handler(self.handle);
        self.latch.close();
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        let _ = self.router.del_handler(self.handle);
    }
}

/// Address of a handle in some context, able to post replies to it.
#[derive(Clone)]
pub struct Sender {
    router: Router,
    dst_id: ContextId,
    handle: Handle,
}

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sender({}:{})", self.dst_id, self.handle)
    }
}

impl Sender {
    pub fn new(router: &Router, dst_id: ContextId, handle: Handle) -> Self {
        Self {
            router: router.clone(),
            dst_id,
            handle,
        }
    }

    pub fn context_id(&self) -> ContextId {
        self.dst_id
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn send<T: Serialize>(&self, value: &T) -> Result<()> {
        self.send_result(&Ok(value))
    }

    pub fn send_result<T: Serialize>(&self, result: &std::result::Result<T, CallError>) -> Result<()> {
        let msg = Message::encoded(result)?.with_dst(self.dst_id, self.handle);
        self.router.route(msg)
    }

    /// Tell the receiving side no more data follows.
    pub fn close(&self) -> Result<()> {
        let msg = Message::dead(&DeadReason::Disconnected).with_dst(self.dst_id, self.handle);
        self.router.route(msg)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{
        config::RuntimeConfig,
        testing::{child_of, master, stop, worker_of},
    };

    const WAIT: Option<Duration> = Some(Duration::from_secs(5));

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn has_route(router: &Router, id: ContextId) -> bool {
        router
            .broker()
            .defer_sync(move |core| core.table.borrow().stream_by_id.contains_key(&id))
            .unwrap()
    }

    // Child handler answering every message with its payload doubled.
    fn install_doubler(router: &Router) -> Handle {
        let replier = router.clone();
        let handle = router.add_handler(
            move |msg| {
                if let Ok(n) = msg.decode::<u32>() {
                    let reply = msg.reply::<u32>(&Ok(n * 2)).unwrap();
                    replier.route(reply).unwrap();
                }
            },
            HandlerOptions::persistent(),
        );
        router.broker().defer_sync(|_| ()).unwrap();
        handle
    }

    #[test]
    fn local_delivery_and_one_shot_handlers() {
        let router = master();
        let rx = router.receiver(HandlerOptions::default());
        let msg = Message::encoded("hi").unwrap().with_dst(0, rx.handle());
        router.route(msg.clone()).unwrap();
        assert_eq!(rx.get(WAIT).unwrap().decode::<String>().unwrap(), "hi");

        // One-shot: the second message is a dead-letter.
        let bounce = router.receiver(HandlerOptions::default());
        router.route(msg.with_reply_to(bounce.handle())).unwrap();
        assert!(matches!(
            bounce.get(WAIT),
            Err(Error::Dead(DeadReason::InvalidHandle(_)))
        ));
        assert!(rx.try_get().is_none());
        stop(&router);
    }

    #[test]
    fn policy_refusal_replies_with_call_error() {
        let router = master();
        let guarded = router.receiver(HandlerOptions::persistent().policy(|_| false));
        let reply = router.receiver(HandlerOptions::default());
        let msg = Message::encoded(&1u32)
            .unwrap()
            .with_dst(0, guarded.handle())
            .with_reply_to(reply.handle());
        router.route(msg).unwrap();
        match reply.get_data::<()>(WAIT) {
            Err(Error::Call(e)) => assert_eq!(e.message(), "Refused by policy."),
            other => panic!("unexpected {other:?}"),
        }
        assert!(guarded.try_get().is_none());
        stop(&router);
    }

    #[test]
    fn shutdown_wakes_pending_receivers() {
        let router = master();
        let rx = router.receiver(HandlerOptions::persistent());
        let waiter = thread::spawn(move || rx.get(None));
        thread::sleep(Duration::from_millis(50));
        stop(&router);
        assert!(matches!(
            waiter.join().unwrap(),
            Err(Error::Dead(DeadReason::Shutdown))
        ));

        // Registering after shutdown fails the handler at once.
        let late = router.receiver(HandlerOptions::default());
        assert!(matches!(late.get(WAIT), Err(Error::Dead(DeadReason::Shutdown))));
    }

    #[test]
    fn crash_wakes_pending_receivers() {
        let router = master();
        let rx = router.receiver(HandlerOptions::default());
        router.broker().defer(|_| panic!("broker bug")).unwrap();
        assert!(matches!(rx.get(WAIT), Err(Error::Dead(DeadReason::Shutdown))));
        router.broker().join();
    }

    #[test]
    fn oversize_messages_are_refused() {
        let broker = Broker::new(&RuntimeConfig::default()).unwrap();
        let router = Router::new(broker, &RouterConfig { max_message_size: 16 }).unwrap();
        let msg = Message::new(0, 1000, vec![0u8; 17]);
        match router.route(msg) {
            Err(Error::Protocol(e)) => assert_eq!(e, "message too large (max 16 bytes)"),
            other => panic!("unexpected {other:?}"),
        }
        stop(&router);
    }

    #[test]
    fn unroutable_destination_fails_the_caller() {
        let router = master();
        match router.call::<u32, _>(99, "mitogen.ping", &()) {
            Err(Error::Routing(99)) => {}
            other => panic!("unexpected {other:?}"),
        }
        stop(&router);
    }

    #[test]
    fn messages_cross_streams_and_return() {
        let master = master();
        let child = child_of(&master, 1);
        let handle = install_doubler(&child);

        let rx = master.receiver(HandlerOptions::default().respondent(1));
        let msg = Message::encoded(&21u32)
            .unwrap()
            .with_dst(1, handle)
            .with_reply_to(rx.handle());
        master.route(msg).unwrap();
        assert_eq!(rx.get_data::<u32>(WAIT).unwrap(), 42);

        stop(&child);
        stop(&master);
    }

    #[test]
    fn disconnect_fails_respondent_handlers_and_notifies_listeners() {
        let master = master();
        let child = child_of(&master, 1);
        let notified = Arc::new(Latch::new());
        let sink = notified.clone();
        master.on_disconnect(move |id| sink.put(id).unwrap()).unwrap();
        let rx = master.receiver(HandlerOptions::default().respondent(1));
        let unrelated = master.receiver(HandlerOptions::default());

        stop(&child);
        assert!(matches!(
            rx.get(WAIT),
            Err(Error::Dead(DeadReason::Disconnected))
        ));
        assert_eq!(notified.get(WAIT).unwrap(), 1);
        assert!(unrelated.try_get().is_none());
        assert!(!has_route(&master, 1));
        stop(&master);
    }

    #[test]
    fn child_sees_parent_disconnect() {
        let master = master();
        let child = child_of(&master, 1);
        let rx = child.receiver(HandlerOptions::default().respondent(0));
        let gone = Arc::new(Latch::new());
        let sink = gone.clone();
        child.on_disconnect(move |id| sink.put(id).unwrap()).unwrap();
        stop(&master);
        assert_eq!(gone.get(WAIT).unwrap(), 0);
        assert!(matches!(
            rx.get(WAIT),
            Err(Error::Dead(DeadReason::Disconnected))
        ));
        stop(&child);
    }

    #[test]
    fn forged_source_ids_are_dropped() {
        let master = master();
        let child = child_of(&master, 1);
        let rx = master.receiver(HandlerOptions::persistent());
        let handle = rx.handle();
        child
            .broker()
            .defer_sync(move |core| {
                let stream = core.stream_for(0).unwrap();
                let forged = Message {
                    src_id: 77,
                    auth_id: 1,
                    ..Message::encoded(&"forged").unwrap().with_dst(0, handle)
                };
                let borrowed = Message {
                    src_id: 1,
                    auth_id: 0,
                    ..Message::encoded(&"borrowed").unwrap().with_dst(0, handle)
                };
                let honest = Message {
                    src_id: 1,
                    auth_id: 1,
                    ..Message::encoded(&"honest").unwrap().with_dst(0, handle)
                };
                assert!(stream.send(&forged));
                assert!(stream.send(&borrowed));
                assert!(stream.send(&honest));
            })
            .unwrap();
        let msg = rx.get(WAIT).unwrap();
        assert_eq!(msg.src_id, 1);
        assert_eq!(msg.decode::<String>().unwrap(), "honest");
        assert!(rx.try_get().is_none());
        stop(&child);
        stop(&master);
    }

    #[test]
    fn trusted_streams_lend_their_authority() {
        let master = master();
        let target = child_of(&master, 1);
        let worker = worker_of(&master, 2);
        let sibling = child_of(&master, 3);
        let rx = target.receiver(HandlerOptions::persistent().policy(target.parent_authority()));
        target.broker().defer_sync(|_| ()).unwrap();

        worker
            .route(Message::encoded(&"hi").unwrap().with_dst(1, rx.handle()))
            .unwrap();
        let msg = rx.get(WAIT).unwrap();
        assert_eq!(msg.src_id, 2);
        assert_eq!(msg.auth_id, 0);

        let reply = sibling.receiver(HandlerOptions::default());
        sibling
            .route(
                Message::encoded(&"hi")
                    .unwrap()
                    .with_dst(1, rx.handle())
                    .with_reply_to(reply.handle()),
            )
            .unwrap();
        match reply.get_data::<()>(WAIT) {
            Err(Error::Call(e)) => assert_eq!(e.message(), "Refused by policy."),
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_get().is_none());
        stop(&sibling);
        stop(&worker);
        stop(&target);
        stop(&master);
    }

    #[test]
    fn lost_routes_fail_calls_from_sibling_children() {
        let master = master();
        let target = child_of(&master, 1);
        let worker = worker_of(&master, 2);
        let bystander = child_of(&master, 3);
        let arrived = Arc::new(Latch::new());
        let sink = arrived.clone();
        // Never replies.
        let handle = target.add_handler(
            move |msg| sink.put(msg.src_id).unwrap(),
            HandlerOptions::persistent(),
        );
        target.broker().defer_sync(|_| ()).unwrap();
        let gone = Arc::new(Latch::new());
        let sink = gone.clone();
        worker.on_disconnect(move |id| sink.put(id).unwrap()).unwrap();
        let unrelated = bystander.receiver(HandlerOptions::default().respondent(0));

        let rx = worker.receiver(HandlerOptions::default().respondent(1));
        let msg = Message::encoded(&())
            .unwrap()
            .with_dst(1, handle)
            .with_reply_to(rx.handle());
        worker.route(msg).unwrap();
        assert_eq!(arrived.get(WAIT).unwrap(), 2);

        stop(&target);
        let err = rx.get(WAIT).unwrap_err();
        assert!(matches!(err, Error::Dead(DeadReason::Disconnected)));
        assert!(err.is_disconnect());
        assert_eq!(gone.get(WAIT).unwrap(), 1);
        assert!(!has_route(&master, 1));
        assert!(unrelated.try_get().is_none());

        stop(&bystander);
        stop(&worker);
        stop(&master);
    }

    #[test]
    fn disconnect_closes_the_direct_stream() {
        let master = master();
        let child = child_of(&master, 1);
        let gone = Arc::new(Latch::new());
        let sink = gone.clone();
        master.on_disconnect(move |id| sink.put(id).unwrap()).unwrap();
        master.disconnect(1).unwrap();
        assert_eq!(gone.get(WAIT).unwrap(), 1);
        wait_until(|| !has_route(&master, 1));
        stop(&child);
        stop(&master);
    }

    #[test]
    fn routes_propagate_to_the_master() {
        let master = master();
        let child = child_of(&master, 1);
        let grandchild = child_of(&child, 2);
        wait_until(|| has_route(&master, 2));
        let handle = install_doubler(&grandchild);

        let rx = master.receiver(HandlerOptions::default().respondent(2));
        let msg = Message::encoded(&5u32)
            .unwrap()
            .with_dst(2, handle)
            .with_reply_to(rx.handle());
        master.route(msg).unwrap();
        assert_eq!(rx.get_data::<u32>(WAIT).unwrap(), 10);

        // Losing the grandchild withdraws its route upstream.
        stop(&grandchild);
        wait_until(|| !has_route(&master, 2));
        stop(&child);
        stop(&master);
    }

    #[test]
    fn ids_are_unique_across_the_tree() {
        let master = master();
        let child = child_of(&master, 1);
        let m1 = master.allocate_id().unwrap();
        let c1 = child.allocate_id().unwrap();
        let c2 = child.allocate_id().unwrap();
        let m2 = master.allocate_id().unwrap();
        assert_eq!(c2, c1 + 1);
        assert!(c1 > m1);
        assert!(m2 >= c1 + ID_BLOCK_SIZE);
        stop(&child);
        stop(&master);
    }

    #[test]
    fn timeout_stops_waiting_but_not_the_remote_call() {
        let master = master();
        let child = child_of(&master, 1);
        let finished = Arc::new(AtomicBool::new(false));
        let replier = child.clone();
        let done = finished.clone();
        let handle = child.add_handler(
            move |msg| {
                let replier = replier.clone();
                let done = done.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(300));
                    done.store(true, Ordering::SeqCst);
                    let _ = replier.route(msg.reply::<u32>(&Ok(1)).unwrap());
                });
            },
            HandlerOptions::persistent(),
        );
        child.broker().defer_sync(|_| ()).unwrap();

        let rx = master.receiver(HandlerOptions::default().respondent(1));
        let msg = Message::encoded(&())
            .unwrap()
            .with_dst(1, handle)
            .with_reply_to(rx.handle());
        master.route(msg).unwrap();
        assert!(matches!(
            rx.get_data::<u32>(Some(Duration::from_millis(50))),
            Err(Error::LatchTimeout)
        ));
        drop(rx);
        assert!(!finished.load(Ordering::SeqCst));
        wait_until(|| finished.load(Ordering::SeqCst));
        stop(&child);
        stop(&master);
    }

    #[test]
    fn panicking_handlers_do_not_stop_the_broker() {
        let router = master();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = router.add_handler(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                panic!("handler bug");
            },
            HandlerOptions::persistent(),
        );
        router.route(Message::new(0, handle, Vec::new())).unwrap();
        router.route(Message::new(0, handle, Vec::new())).unwrap();
        assert_eq!(router.broker().defer_sync(|_| 1).unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        stop(&router);
    }

    #[test]
    fn senders_address_receivers() {
        let master = master();
        let child = child_of(&master, 1);
        let rx = master.receiver(HandlerOptions::persistent());
        let sender = Sender::new(&child, 0, rx.handle());
        sender.send(&"one").unwrap();
        assert_eq!(rx.get_data::<String>(WAIT).unwrap(), "one");
        rx.to_sender().send(&"two").unwrap();
        assert_eq!(rx.get_data::<String>(WAIT).unwrap(), "two");
        sender.close().unwrap();
        assert!(matches!(rx.get(WAIT), Err(Error::Dead(DeadReason::Disconnected))));
        stop(&child);
        stop(&master);
    }
}
