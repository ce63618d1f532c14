//! Messaging and RPC runtime for driving code in other processes.
//!
//! A single broker thread per process owns every connection and all routing
//! state. Application threads talk to it only through [`Broker::defer`] and
//! [`Latch`] waits, so no broker-side structure is ever shared across threads.
//!
//! # Key Components
//!
//! - [`Latch`]: blocking, timeout-capable wait queue.
//! - [`Message`]: framed unit of routing, see [`message`].
//! - [`Broker`]: owns the event loop thread and every stream.
//! - [`Router`]: handle dispatch, context routing and the call protocol.
//! - [`Context`]: proxy for one remote endpoint.
//! - [`CallError`]: serializable description of a remote failure.
//! - [`Dispatcher`]: executes [`FunctionRegistry`] entries for remote callers.
#[macro_use]
mod call_error;
mod error;

pub mod broker;
pub mod child;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod latch;
pub mod message;
pub mod router;
pub mod stream;
pub mod unix;

#[cfg(test)]
mod testing;

pub use broker::Broker;
pub use call_error::CallError;
pub use context::{Context, ContextRef};
pub use dispatch::{CallContext, Dispatcher, FunctionRegistry};
pub use error::{DeadReason, Error, Result};
pub use latch::Latch;
pub use message::{ContextId, Handle, Message};
pub use router::{HandlerOptions, Receiver, Router, Sender};
pub use stream::Transport;
