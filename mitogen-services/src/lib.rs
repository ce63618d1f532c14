//! Services built on the mitogen runtime.
//!
//! # Key Components
//!
//! - [`service`]: named services at well-known handles and the pool running
//!   them.
//! - [`context_service`]: connects each target once and shares it between
//!   workers.
//! - [`file_service`]: serves registered files to targets in chunks.
//! - [`connect`]: the connection methods (`local`, `ssh`, `sudo`, `docker`)
//!   and how agents are started.
//! - [`target`]: functions every agent serves.
//! - [`mux`]: the master process assembling all of the above behind a unix
//!   listener.
//! - [`connection`]: a worker's handle on one target, going through the mux.
macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

mod error;

pub mod connect;
pub mod connection;
pub mod context_service;
pub mod file_service;
pub mod mux;
pub mod service;
pub mod target;
pub mod wire;

#[cfg(test)]
mod testing;

pub use connect::{ConnectParams, Connected, Connector, Method, ProcessConnector};
pub use connection::{Connection, ConnectionOptions};
pub use error::{Result, ServiceError};
pub use mux::{Mux, MuxConfig};
pub use service::{Service, ServicePool};
