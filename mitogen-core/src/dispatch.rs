//! Executes named functions on behalf of remote callers.
//!
//! The broker thread only queues `CALL_FUNCTION` messages; a dedicated
//! executor thread decodes each [`CallRequest`], runs the registered
//! function with panics captured, and routes the `Result<T, CallError>`
//! envelope back to the caller's reply handle.
use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::{
    message::{ContextId, CALL_FUNCTION, NO_REPLY},
    CallError, Context, HandlerOptions, Latch, Message, Result, Router,
};

pub const PING: &str = "mitogen.ping";

/// Wire form of a function call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    pub function: String,
    #[serde(default)]
    pub args: Value,
}

impl CallRequest {
    pub fn new<A: Serialize + ?Sized>(function: &str, args: &A) -> Result<Self> {
        Ok(Self {
            function: function.to_string(),
            args: serde_json::to_value(args)?,
        })
    }
}

/// What a running function knows about its invocation.
pub struct CallContext {
    router: Router,
    caller: ContextId,
}

impl CallContext {
    pub fn new(router: Router, caller: ContextId) -> Self {
        Self { router, caller }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn caller_id(&self) -> ContextId {
        self.caller
    }

    pub fn caller(&self) -> Context {
        self.router.context_by_id(self.caller, "caller")
    }
}

type BoxedFunction = Box<dyn Fn(&CallContext, Value) -> std::result::Result<Value, CallError> + Send + Sync>;

/// Named functions callable through `CALL_FUNCTION`.
pub struct FunctionRegistry {
    functions: HashMap<String, BoxedFunction>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionRegistry {
    /// Registry holding only the built-in `mitogen.ping`.
    pub fn new() -> Self {
        let mut this = Self {
            functions: HashMap::new(),
        };
        this.register(PING, |_, ()| Ok(true));
        this
    }

    pub fn register<A, R, F>(&mut self, name: &str, func: F) -> &mut Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(&CallContext, A) -> std::result::Result<R, CallError> + Send + Sync + 'static,
    {
        self.functions.insert(
            name.to_string(),
            Box::new(move |ctx, args| {
                let args: A = serde_json::from_value(args).map_err(|e| CallError::from_error(&e))?;
                let ret = func(ctx, args)?;
                serde_json::to_value(ret).map_err(|e| CallError::from_error(&e))
            }),
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Run `request`, turning a panic into a [`CallError`].
    pub fn invoke(&self, ctx: &CallContext, request: CallRequest) -> std::result::Result<Value, CallError> {
        let Some(func) = self.functions.get(&request.function) else {
            return Err(call_error!("no such function: %r", request.function));
        };
        catch_unwind(AssertUnwindSafe(|| func(ctx, request.args)))
            .unwrap_or_else(|panic| Err(CallError::from_panic(&*panic)))
    }
}

/// Serves `CALL_FUNCTION` for one router until its broker shuts down.
pub struct Dispatcher {
    latch: Arc<Latch<Message>>,
    thread: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Install the `CALL_FUNCTION` handler and start the executor thread.
    /// Only our parent and ourselves may call in.
    pub fn start(router: &Router, registry: FunctionRegistry) -> Result<Self> {
        let latch = Arc::new(Latch::new());
        let sink = latch.clone();
        router.add_handler(
            move |msg| {
                if msg.is_dead {
                    sink.close();
                } else {
                    let _ = sink.put(msg);
                }
            },
            HandlerOptions::persistent()
                .at(CALL_FUNCTION)
                .policy(router.parent_authority()),
        );

        let router = router.clone();
        let registry = Arc::new(registry);
        let queue = latch.clone();
        let thread = thread::Builder::new()
            .name("mitogen-dispatch".to_string())
            .spawn(move || {
                while let Ok(msg) = queue.get(None) {
                    dispatch_one(&router, &registry, msg);
                }
                debug!("dispatcher stopped");
            })?;
        Ok(Self {
            latch,
            thread: Some(thread),
        })
    }

    /// Stop taking new calls. The call in progress, if any, completes.
    pub fn stop(&self) {
        self.latch.close();
    }

    /// Wait for the executor thread, which exits once the broker shuts down
    /// or [`Dispatcher::stop`] is called.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn dispatch_one(router: &Router, registry: &FunctionRegistry, msg: Message) {
    let ctx = CallContext::new(router.clone(), msg.src_id);
    let result = match msg.decode::<CallRequest>() {
        Ok(request) => {
            debug!("calling {} for context {}", request.function, msg.src_id);
            registry.invoke(&ctx, request)
        }
        Err(e) => Err(CallError::from_error(&e)),
    };
    if msg.reply_to == NO_REPLY {
        if let Err(e) = result {
            warn!("call from context {} failed: {}", msg.src_id, e);
        }
        return;
    }
    if let Err(e) = msg.reply(&result).and_then(|reply| router.route(reply)) {
        error!("failed to reply to context {}: {}", msg.src_id, e);
    }
}
