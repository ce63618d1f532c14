//! Connection registry running in the mux.
//!
//! Every worker asks the context service for its targets instead of
//! connecting itself, so each distinct set of [`ConnectParams`] is connected
//! once and shared. An entry moves through three states:
//!
//! ```text
//!   ABSENT --get--> CONNECTING --ok--> READY --put to zero--> ABSENT
//!                       |                 |
//!                       +----failed-------+--disconnect------> ABSENT
//! ```
//!
//! Callers arriving while a connect is in flight wait on its latch and all
//! receive the same outcome.
use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard},
};

use mitogen_core::{
    message::CONTEXT_SERVICE, CallContext, CallError, Context, ContextId, ContextRef, Handle,
    Latch, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    connect::{ConnectParams, Connected, Connector},
    service::{call_service, kwargs, reply, unknown_method, Service},
    Result, ServiceError,
};

/// Answer to `get`. A non-empty `msg` means the connect failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectReply {
    #[serde(default)]
    pub context: Option<ContextRef>,
    #[serde(default)]
    pub home_dir: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
}

impl ConnectReply {
    fn ready(connected: &Connected) -> Self {
        Self {
            context: Some(connected.context.to_ref()),
            home_dir: Some(connected.home_dir.clone()),
            msg: None,
        }
    }

    fn failed(msg: impl Into<String>) -> Self {
        Self {
            msg: Some(msg.into()),
            ..Default::default()
        }
    }

    pub fn is_failure(&self) -> bool {
        self.msg.as_deref().is_some_and(|m| !m.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRequest {
    pub context: ContextRef,
}

enum Entry {
    Connecting {
        latch: Arc<Latch<ConnectReply>>,
        waiters: usize,
    },
    Ready {
        context: Context,
        reply: ConnectReply,
        refs: usize,
    },
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, Entry>,
    key_by_context: HashMap<ContextId, String>,
}

impl Registry {
    // Drop a READY entry whose context went away.
    fn purge(&mut self, context_id: ContextId) -> bool {
        let Some(key) = self.key_by_context.remove(&context_id) else {
            return false;
        };
        if matches!(self.entries.get(&key), Some(Entry::Ready { .. })) {
            self.entries.remove(&key);
        }
        true
    }
}

pub struct ContextService {
    router: Router,
    connector: Arc<dyn Connector>,
    registry: Arc<Mutex<Registry>>,
}

impl ContextService {
    pub fn new(router: &Router, connector: Arc<dyn Connector>) -> Result<Self> {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let weak = Arc::downgrade(&registry);
        router.on_disconnect(move |context_id| {
            if let Some(registry) = weak.upgrade() {
                if registry
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .purge(context_id)
                {
                    info!("context {} disconnected, forgetting it", context_id);
                }
            }
        })?;
        Ok(Self {
            router: router.clone(),
            connector,
            registry,
        })
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the context for `params`, connecting it first if nobody did.
    /// Each successful `get` takes a reference released by [`Self::put`].
    pub fn get(&self, params: &ConnectParams) -> ConnectReply {
        let key = match params.key() {
            Ok(key) => key,
            Err(e) => return ConnectReply::failed(e.to_string()),
        };
        let pending = {
            let mut registry = self.registry();
            match registry.entries.get_mut(&key) {
                Some(Entry::Ready { reply, refs, .. }) => {
                    *refs += 1;
                    return reply.clone();
                }
                Some(Entry::Connecting { latch, waiters }) => {
                    *waiters += 1;
                    Some(latch.clone())
                }
                None => {
                    registry.entries.insert(
                        key.clone(),
                        Entry::Connecting {
                            latch: Arc::new(Latch::new()),
                            waiters: 0,
                        },
                    );
                    None
                }
            }
        };
        if let Some(latch) = pending {
            debug!("waiting for the connect in progress to {}", params.name());
            return latch
                .get(None)
                .unwrap_or_else(|e| ConnectReply::failed(e.to_string()));
        }

        info!("connecting to {}", params.name());
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.connector.connect(&self.router, params)
        }))
        .unwrap_or_else(|panic| {
            Err(ServiceError::Connection(
                CallError::from_panic(&*panic).message().to_string(),
            ))
        });
        self.finish(key, outcome)
    }

    // Publish a connect outcome to everyone who waited for it.
    fn finish(&self, key: String, outcome: Result<Connected>) -> ConnectReply {
        let reply = match &outcome {
            Ok(connected) => ConnectReply::ready(connected),
            Err(ServiceError::Connection(msg) | ServiceError::Become(msg)) => {
                ConnectReply::failed(msg.clone())
            }
            Err(e) => ConnectReply::failed(e.to_string()),
        };
        if let Some(msg) = &reply.msg {
            warn!("connect failed: {}", msg);
        }

        let mut registry = self.registry();
        let waiters = match registry.entries.remove(&key) {
            Some(Entry::Connecting { latch, waiters }) => {
                for _ in 0..waiters {
                    let _ = latch.put(reply.clone());
                }
                waiters
            }
            _ => 0,
        };
        if let Ok(connected) = outcome {
            registry
                .key_by_context
                .insert(connected.context.id(), key.clone());
            registry.entries.insert(
                key,
                Entry::Ready {
                    context: connected.context,
                    reply: reply.clone(),
                    refs: waiters + 1,
                },
            );
        }
        reply
    }

    /// Release one reference to `context_id`. The last one shuts the
    /// context down. Returns the references left, `None` if the context is
    /// not registered.
    pub fn put(&self, context_id: ContextId) -> Option<usize> {
        let context = {
            let mut registry = self.registry();
            let key = registry.key_by_context.get(&context_id)?.clone();
            match registry.entries.get_mut(&key) {
                Some(Entry::Ready { refs, .. }) if *refs > 1 => {
                    *refs -= 1;
                    return Some(*refs);
                }
                Some(Entry::Ready { .. }) => {}
                _ => return None,
            }
            registry.key_by_context.remove(&context_id);
            match registry.entries.remove(&key) {
                Some(Entry::Ready { context, .. }) => context,
                _ => return None,
            }
        };
        info!("last reference to {:?} released, shutting it down", context);
        if let Err(e) = context.shutdown() {
            warn!("failed to shut down {:?}: {}", context, e);
        }
        Some(0)
    }

    /// Contexts currently connected.
    pub fn connected(&self) -> Vec<ContextRef> {
        self.registry()
            .entries
            .values()
            .filter_map(|entry| match entry {
                Entry::Ready { context, .. } => Some(context.to_ref()),
                Entry::Connecting { .. } => None,
            })
            .collect()
    }
}

impl Service for ContextService {
    fn name(&self) -> &str {
        "context_service"
    }

    fn handle(&self) -> Handle {
        CONTEXT_SERVICE
    }

    fn restricted(&self, _method: &str) -> bool {
        true
    }

    fn dispatch(
        &self,
        _ctx: &CallContext,
        method: &str,
        args: Value,
    ) -> std::result::Result<Value, CallError> {
        match method {
            "get" => {
                let params: ConnectParams = kwargs(args)?;
                reply(self.get(&params))
            }
            "put" => {
                let req: PutRequest = kwargs(args)?;
                if self.put(req.context.id).is_none() {
                    debug!("put for unknown context {}", req.context.id);
                }
                reply(())
            }
            _ => Err(unknown_method(self.name(), method)),
        }
    }
}

/// Ask the context service in `service` for the context described by
/// `params`.
pub fn get(service: &Context, params: &ConnectParams) -> Result<Connected> {
    let reply: ConnectReply = call_service(service, CONTEXT_SERVICE, "get", params)?;
    if reply.is_failure() {
        return Err(params.failure(reply.msg.unwrap_or_default()));
    }
    match (reply.context, reply.home_dir) {
        (Some(context), Some(home_dir)) => Ok(Connected {
            context: context.attach(service.router()),
            home_dir,
        }),
        _ => Err(params.failure("context service returned no context")),
    }
}

/// Release a context obtained from [`get`].
pub fn put(service: &Context, context: &Context) -> Result<()> {
    call_service::<(), _>(
        service,
        CONTEXT_SERVICE,
        "put",
        &PutRequest {
            context: context.to_ref(),
        },
    )
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        thread,
        time::{Duration, Instant},
    };

    use mitogen_core::Error;

    use super::*;
    use crate::{
        connect::{Method, SudoParams},
        service::ServicePool,
        testing::{child_of, master, stop, worker_of},
    };

    /// Connects in-process child routers, counting the attempts.
    #[derive(Default)]
    struct FakeConnector {
        attempts: AtomicUsize,
        fail_next: AtomicBool,
        panic_next: AtomicBool,
        delay: Duration,
        children: Mutex<Vec<Router>>,
    }

    impl FakeConnector {
        fn slow() -> Self {
            Self {
                delay: Duration::from_millis(200),
                ..Default::default()
            }
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        fn stop_all(&self) {
            for child in self.children.lock().unwrap().drain(..) {
                stop(&child);
            }
        }
    }

    impl Connector for FakeConnector {
        fn connect(&self, router: &Router, params: &ConnectParams) -> Result<Connected> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            if self.panic_next.swap(false, Ordering::SeqCst) {
                panic!("connector bug");
            }
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(params.failure("boom"));
            }
            let id = router.allocate_id()?;
            self.children.lock().unwrap().push(child_of(router, id));
            Ok(Connected {
                context: router.context_by_id(id, params.name()),
                home_dir: "/home/fake".to_string(),
            })
        }
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn concurrent_gets_share_one_connect() {
        let master = master();
        let connector = Arc::new(FakeConnector::slow());
        let service = Arc::new(ContextService::new(&master, connector.clone()).unwrap());

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                thread::spawn(move || service.get(&ConnectParams::local()))
            })
            .collect();
        let replies: Vec<_> = callers.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(connector.attempts(), 1);
        assert!(replies.iter().all(|r| r == &replies[0] && !r.is_failure()));
        assert_eq!(replies[0].home_dir.as_deref(), Some("/home/fake"));
        let id = replies[0].context.as_ref().unwrap().id;
        assert_eq!(service.connected().len(), 1);

        // Different parameters are a different connection.
        let sudo = ConnectParams::new(Method::Sudo(SudoParams {
            username: Some("root".into()),
            ..Default::default()
        }));
        let other = service.get(&sudo);
        assert_ne!(other.context.unwrap().id, id);
        assert_eq!(connector.attempts(), 2);

        for left in (1..8).rev() {
            assert_eq!(service.put(id), Some(left));
        }
        assert_eq!(service.put(id), Some(0));
        assert_eq!(service.put(id), None);
        assert_eq!(service.connected().len(), 1);

        // The last put shut the target down.
        let first = connector.children.lock().unwrap().remove(0);
        first.broker().join();

        connector.stop_all();
        stop(&master);
    }

    #[test]
    fn failures_reach_every_waiter_and_are_not_cached() {
        let master = master();
        let connector = Arc::new(FakeConnector::slow());
        connector.fail_next.store(true, Ordering::SeqCst);
        let service = Arc::new(ContextService::new(&master, connector.clone()).unwrap());

        let callers: Vec<_> = (0..4)
            .map(|_| {
                let service = service.clone();
                thread::spawn(move || service.get(&ConnectParams::local()))
            })
            .collect();
        for caller in callers {
            let reply = caller.join().unwrap();
            assert!(reply.is_failure());
            assert_eq!(reply.msg.as_deref(), Some("boom"));
            assert!(reply.context.is_none());
        }
        assert_eq!(connector.attempts(), 1);
        assert!(service.connected().is_empty());

        assert!(!service.get(&ConnectParams::local()).is_failure());
        assert_eq!(connector.attempts(), 2);

        connector.stop_all();
        stop(&master);
    }

    #[test]
    fn a_panicking_connect_fails_like_any_other() {
        let master = master();
        let connector = Arc::new(FakeConnector::slow());
        connector.panic_next.store(true, Ordering::SeqCst);
        let service = Arc::new(ContextService::new(&master, connector.clone()).unwrap());

        let callers: Vec<_> = (0..3)
            .map(|_| {
                let service = service.clone();
                thread::spawn(move || service.get(&ConnectParams::local()))
            })
            .collect();
        for caller in callers {
            let reply = caller.join().unwrap();
            assert!(reply.is_failure());
            assert_eq!(reply.msg.as_deref(), Some("panic: connector bug"));
        }
        assert_eq!(connector.attempts(), 1);
        assert!(service.connected().is_empty());

        // The entry went back to absent, so the next get connects again.
        assert!(!service.get(&ConnectParams::local()).is_failure());
        assert_eq!(connector.attempts(), 2);

        connector.stop_all();
        stop(&master);
    }

    #[test]
    fn disconnected_contexts_are_reconnected() {
        let master = master();
        let connector = Arc::new(FakeConnector::default());
        let service = ContextService::new(&master, connector.clone()).unwrap();

        let first = service.get(&ConnectParams::local()).context.unwrap();
        connector.stop_all();
        wait_until("the registry to forget the context", || {
            service.connected().is_empty()
        });
        assert_eq!(service.put(first.id), None);

        let second = service.get(&ConnectParams::local()).context.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(connector.attempts(), 2);

        connector.stop_all();
        stop(&master);
    }

    #[test]
    fn workers_use_the_service_over_the_wire() {
        let master = master();
        let connector = Arc::new(FakeConnector::default());
        let pool = ServicePool::new(&master, 2).unwrap();
        pool.add(Arc::new(
            ContextService::new(&master, connector.clone()).unwrap(),
        ));
        let worker = worker_of(&master, 100);
        master.broker().defer_sync(|_| ()).unwrap();
        let mux = worker.parent().unwrap();

        let connected = get(&mux, &ConnectParams::local()).unwrap();
        assert_eq!(connected.home_dir, "/home/fake");
        assert_eq!(connected.context.name(), "local");
        put(&mux, &connected.context).unwrap();

        connector.fail_next.store(true, Ordering::SeqCst);
        match get(&mux, &ConnectParams::local()) {
            Err(ServiceError::Connection(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected {other:?}"),
        }

        stop(&worker);
        connector.stop_all();
        stop(&master);
        pool.join();
    }
    #[test]
    fn targets_may_not_request_connections() {
        let master = master();
        let connector = Arc::new(FakeConnector::default());
        let pool = ServicePool::new(&master, 2).unwrap();
        pool.add(Arc::new(
            ContextService::new(&master, connector.clone()).unwrap(),
        ));
        let target = child_of(&master, 1);
        master.broker().defer_sync(|_| ()).unwrap();

        match get(&target.parent().unwrap(), &ConnectParams::local()) {
            Err(ServiceError::Core(Error::Call(e))) => assert_eq!(e.message(), "Refused by policy."),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(connector.attempts(), 0);

        stop(&target);
        stop(&master);
        pool.join();
    }
}
