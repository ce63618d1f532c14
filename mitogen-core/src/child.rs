//! Bootstrap for a context running as a child process.
//!
//! The parent speaks the framed protocol over the child's stdin/stdout.
//! Pipes cannot be driven by the socket runtime directly, so two helper
//! threads bridge them onto one end of a socketpair and the broker attaches
//! the other end as the parent stream.
use std::{
    io::{self, Read, Write},
    net::Shutdown,
    os::unix::net::UnixStream as StdUnixStream,
    thread,
};

use tracing::{debug, info};

use crate::{
    config::{RouterConfig, RuntimeConfig},
    dispatch::{Dispatcher, FunctionRegistry},
    message::ContextId,
    Broker, Error, Result, Router, Transport,
};

// Copy buffer size: 64 KB
const BRIDGE_BUFFER_SIZE: usize = 64 * 1024;

/// Identity and settings of a child context.
#[derive(Debug, Clone, Default)]
pub struct ChildOptions {
    pub context_id: ContextId,
    /// Ancestors, nearest first and ending with the master.
    pub parent_ids: Vec<ContextId>,
    pub runtime: RuntimeConfig,
    pub router: RouterConfig,
}

/// Serve `registry` to the parent on stdin/stdout until the parent goes
/// away or asks us to shut down.
pub fn run_stdio(options: &ChildOptions, registry: FunctionRegistry) -> Result<()> {
    let (ours, theirs) = StdUnixStream::pair()?;
    bridge_stdio(theirs)?;
    let broker = Broker::new(&options.runtime)?;
    let router = Router::with_ancestors(
        broker,
        &options.router,
        options.context_id,
        options.parent_ids.clone(),
    )?;
    run(router, Transport::unix(ours), registry)
}

/// Attach `parent` as the parent stream of `router`, serve `registry` and
/// block until the broker stops.
pub fn run(router: Router, parent: Transport, registry: FunctionRegistry) -> Result<()> {
    let parent_id = router
        .parent_id()
        .ok_or_else(|| Error::Protocol("a child router needs a parent".into()))?;
    let broker = router.broker().clone();
    let stopper = broker.clone();
    router.on_disconnect(move |id| {
        if id == parent_id {
            info!("parent disconnected, shutting down");
            stopper.shutdown();
        }
    })?;
    // The dispatcher registers before the stream exists so no early call is
    // lost as a dead-letter.
    let dispatcher = Dispatcher::start(&router, registry)?;
    router.connect_stream(parent, parent_id, "parent", true)?;
    info!("context {} serving parent {}", router.context_id(), parent_id);

    broker.join();
    dispatcher.stop();
    dispatcher.join();
    debug!("context {} exiting", router.context_id());
    Ok(())
}

fn bridge_stdio(sock: StdUnixStream) -> io::Result<()> {
    let mut down = sock.try_clone()?;
    let mut up = sock;

    thread::Builder::new()
        .name("mitogen-stdin".to_string())
        .spawn(move || {
            let mut stdin = io::stdin().lock();
            let _ = io::copy(&mut stdin, &mut down);
            let _ = down.shutdown(Shutdown::Write);
        })?;

    thread::Builder::new()
        .name("mitogen-stdout".to_string())
        .spawn(move || {
            let mut stdout = io::stdout().lock();
            let mut buf = vec![0u8; BRIDGE_BUFFER_SIZE];
            loop {
                match up.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stdout.write_all(&buf[..n]).and_then(|_| stdout.flush()).is_err() {
                            break;
                        }
                    }
                }
            }
        })?;
    Ok(())
}
