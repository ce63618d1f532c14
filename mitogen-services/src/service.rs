//! Named services reachable at well-known handles, and the thread pool that
//! runs them.
//!
//! A service request is a [`ServiceRequest`] posted to the service's handle
//! with a `reply_to`; the reply is the usual `Result<T, CallError>`
//! envelope. The broker thread only queues requests, pool threads decode and
//! run them.
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use mitogen_core::{
    call_error, message::NO_REPLY, CallContext, CallError, Context, Handle, HandlerOptions, Latch,
    Message, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::Result;

/// A request to `method` of the service at some handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub method: String,
    #[serde(default)]
    pub kwargs: Value,
}

pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Well-known handle the service listens on.
    fn handle(&self) -> Handle;

    /// Methods only our own context or an ancestor may call. Workers
    /// joining through a trusted stream carry our authority.
    fn restricted(&self, _method: &str) -> bool {
        false
    }

    fn dispatch(
        &self,
        ctx: &CallContext,
        method: &str,
        kwargs: Value,
    ) -> std::result::Result<Value, CallError>;
}

/// Decode request arguments, reporting a mismatch as a [`CallError`].
pub fn kwargs<T: DeserializeOwned>(kwargs: Value) -> std::result::Result<T, CallError> {
    serde_json::from_value(kwargs).map_err(|e| CallError::from_error(&e))
}

/// Encode a method's return value.
pub fn reply<T: Serialize>(value: T) -> std::result::Result<Value, CallError> {
    serde_json::to_value(value).map_err(|e| CallError::from_error(&e))
}

pub fn unknown_method(service: &str, method: &str) -> CallError {
    call_error!("%s has no method %r", service, method)
}

type Job = (Arc<dyn Service>, Message);

/// Runs every registered service on a fixed set of threads.
pub struct ServicePool {
    router: Router,
    latch: Arc<Latch<Job>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ServicePool {
    pub fn new(router: &Router, size: usize) -> Result<Self> {
        let latch = Arc::new(Latch::<Job>::new());
        let mut threads = Vec::with_capacity(size);
        for idx in 0..size.max(1) {
            let router = router.clone();
            let queue = latch.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("mitogen-service-{idx}"))
                    .spawn(move || {
                        while let Ok((service, msg)) = queue.get(None) {
                            serve(&router, &*service, msg);
                        }
                        debug!("service thread {} stopped", idx);
                    })?,
            );
        }
        Ok(Self {
            router: router.clone(),
            latch,
            threads: Mutex::new(threads),
        })
    }

    /// Start accepting requests for `service` at its handle. Callers of a
    /// restricted method without parent authority are refused.
    pub fn add(&self, service: Arc<dyn Service>) -> Handle {
        let me = self.router.context_id();
        let sink = self.latch.clone();
        let target = service.clone();
        let guarded = service.clone();
        let authority = self.router.parent_authority();
        let handle = self.router.add_handler(
            move |msg| {
                if msg.is_dead {
                    // Only our own broker going down stops the pool.
                    if msg.src_id == me {
                        sink.close();
                    }
                    return;
                }
                let _ = sink.put((target.clone(), msg));
            },
            HandlerOptions::persistent()
                .at(service.handle())
                .policy(move |msg: &Message| {
                    msg.is_dead
                        || authority(msg)
                        || msg
                            .decode::<ServiceRequest>()
                            .map_or(true, |req| !guarded.restricted(&req.method))
                }),
        );
        info!("service {} listening at handle {}", service.name(), handle);
        handle
    }

    /// Stop taking requests. Requests in progress complete.
    pub fn stop(&self) {
        self.latch.close();
    }

    /// Wait for every pool thread. Returns once the pool is stopped or the
    /// broker shut down.
    pub fn join(&self) {
        let threads: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for thread in threads {
            let _ = thread.join();
        }
    }
}

fn serve(router: &Router, service: &dyn Service, msg: Message) {
    let ctx = CallContext::new(router.clone(), msg.src_id);
    let result = match msg.decode::<ServiceRequest>() {
        Ok(request) => {
            debug!(
                "{}.{} requested by context {}",
                service.name(),
                request.method,
                msg.src_id
            );
            catch_unwind(AssertUnwindSafe(|| {
                service.dispatch(&ctx, &request.method, request.kwargs)
            }))
            .unwrap_or_else(|panic| Err(CallError::from_panic(&*panic)))
        }
        Err(e) => Err(CallError::from_error(&e)),
    };
    if msg.reply_to == NO_REPLY {
        if let Err(e) = result {
            warn!("{} request from context {} failed: {}", service.name(), msg.src_id, e);
        }
        return;
    }
    if let Err(e) = msg.reply(&result).and_then(|reply| router.route(reply)) {
        error!("failed to reply to context {}: {}", msg.src_id, e);
    }
}

/// Call `method` on the service at `handle` in `context` and wait for the
/// result.
pub fn call_service<R, A>(context: &Context, handle: Handle, method: &str, kwargs: &A) -> Result<R>
where
    R: DeserializeOwned,
    A: Serialize + ?Sized,
{
    call_service_with_timeout(context, handle, method, kwargs, None)
}

pub fn call_service_with_timeout<R, A>(
    context: &Context,
    handle: Handle,
    method: &str,
    kwargs: &A,
    timeout: Option<Duration>,
) -> Result<R>
where
    R: DeserializeOwned,
    A: Serialize + ?Sized,
{
    let request = ServiceRequest {
        method: method.to_string(),
        kwargs: serde_json::to_value(kwargs)?,
    };
    Ok(context.send_async(handle, &request)?.get_data(timeout)?)
}
