//! In-process routers for the unit tests, wired together over socketpairs.
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

use mitogen_core::{
    config::{RouterConfig, RuntimeConfig},
    Broker, ContextId, Dispatcher, Router, Transport,
};

use crate::{
    connect::{ConnectParams, Connected, Connector},
    target, Result,
};

pub(crate) fn master() -> Router {
    let broker = Broker::new(&RuntimeConfig::default()).unwrap();
    Router::new(broker, &RouterConfig::default()).unwrap()
}

pub(crate) fn child_of(parent: &Router, id: ContextId) -> Router {
    let broker = Broker::new(&RuntimeConfig::default()).unwrap();
    let mut ancestors = vec![parent.context_id()];
    ancestors.extend_from_slice(parent.parent_ids());
    let child = Router::with_ancestors(broker, &RouterConfig::default(), id, ancestors).unwrap();
    let (down, up) = Transport::pair().unwrap();
    parent
        .connect_stream(down, id, format!("child-{id}"), false)
        .unwrap();
    child
        .connect_stream(up, parent.context_id(), "parent", true)
        .unwrap();
    child
}

/// A worker attached below `parent` over a trusted stream, as a local
/// process joining through the listener would be.
pub(crate) fn worker_of(parent: &Router, id: ContextId) -> Router {
    let broker = Broker::new(&RuntimeConfig::default()).unwrap();
    let worker =
        Router::with_parent(broker, &RouterConfig::default(), id, parent.context_id()).unwrap();
    let (down, up) = Transport::pair().unwrap();
    parent
        .connect_trusted_stream(down, id, format!("worker-{id}"))
        .unwrap();
    worker
        .connect_stream(up, parent.context_id(), "parent", true)
        .unwrap();
    worker
}

pub(crate) fn stop(router: &Router) {
    router.broker().shutdown();
    router.broker().join();
}

/// Connects in-process agents serving the target functions.
#[derive(Default)]
pub(crate) struct InProcessConnector {
    attempts: AtomicUsize,
    agents: Mutex<Vec<(Router, Dispatcher)>>,
}

impl InProcessConnector {
    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_all(&self) {
        for (router, dispatcher) in self.agents.lock().unwrap().drain(..) {
            stop(&router);
            dispatcher.join();
        }
    }
}

impl Connector for InProcessConnector {
    fn connect(&self, router: &Router, params: &ConnectParams) -> Result<Connected> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let id = router.allocate_id()?;
        let agent = child_of(router, id);
        let dispatcher = Dispatcher::start(&agent, target::registry())?;
        agent.broker().defer_sync(|_| ())?;
        self.agents.lock().unwrap().push((agent, dispatcher));
        Ok(Connected {
            context: router.context_by_id(id, params.name()),
            home_dir: "/home/fake".to_string(),
        })
    }
}
