//! Fixtures shared by the unit tests: in-process routers wired together
//! over socketpairs.
use crate::{
    config::{RouterConfig, RuntimeConfig},
    message::ContextId,
    Broker, Router, Transport,
};

pub(crate) fn master() -> Router {
    let broker = Broker::new(&RuntimeConfig::default()).unwrap();
    Router::new(broker, &RouterConfig::default()).unwrap()
}

/// A child router with its own broker, attached below `parent` as `id`.
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
