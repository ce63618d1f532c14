use std::{fmt, sync::Arc, time::Duration};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    message::{ContextId, Handle, SHUTDOWN},
    HandlerOptions, Message, Receiver, Result, Router,
};

/// Proxy for one remote endpoint.
///
/// Holds no connection of its own: every operation goes through the
/// [`Router`], so a context whose stream is gone fails with a routing or
/// dead error rather than reconnecting.
#[derive(Clone)]
pub struct Context {
    router: Router,
    id: ContextId,
    name: Arc<str>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Context({}, {:?})", self.id, self.name)
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Context {}

impl Context {
    pub fn new(router: Router, id: ContextId, name: impl Into<String>) -> Self {
        Self {
            router,
            id,
            name: name.into().into(),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn call_async<A>(&self, function: &str, args: &A) -> Result<Receiver>
    where
        A: Serialize + ?Sized,
    {
        self.router.call_async(self.id, function, args)
    }

    pub fn call<R, A>(&self, function: &str, args: &A) -> Result<R>
    where
        R: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        self.router.call(self.id, function, args)
    }

    pub fn call_with_timeout<R, A>(&self, function: &str, args: &A, timeout: Duration) -> Result<R>
    where
        R: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        self.router.call_with_timeout(self.id, function, args, timeout)
    }

    /// Post `msg` to `handle` in this context without waiting for a reply.
    pub fn send(&self, handle: Handle, msg: Message) -> Result<()> {
        self.router.route(msg.with_dst(self.id, handle))
    }

    /// Post `payload` to `handle` and return the pending reply.
    pub fn send_async<T>(&self, handle: Handle, payload: &T) -> Result<Receiver>
    where
        T: Serialize + ?Sized,
    {
        let receiver = self
            .router
            .receiver(HandlerOptions::default().respondent(self.id));
        let msg = Message::encoded(payload)?.with_reply_to(receiver.handle());
        self.send(handle, msg)?;
        Ok(receiver)
    }

    /// Ask the remote context to shut its broker down.
    pub fn shutdown(&self) -> Result<()> {
        self.send(SHUTDOWN, Message::encoded(&())?)
    }

    pub fn to_ref(&self) -> ContextRef {
        ContextRef {
            id: self.id,
            name: self.name.to_string(),
        }
    }
}

/// Serializable reference to a context, turned back into a [`Context`] by
/// whoever receives it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextRef {
    pub id: ContextId,
    pub name: String,
}

impl ContextRef {
    pub fn attach(self, router: &Router) -> Context {
        router.context_by_id(self.id, self.name)
    }
}
