//! Per-worker connection to one target, driven through the mux.
//!
//! A [`Connection`] joins the mux on first use, asks its context service
//! for the transport (and, with privilege elevation, a `sudo` context
//! started from that transport) and then issues target calls. Closing
//! releases the contexts; unless a new task follows, the worker's broker is
//! shut down too.
use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use mitogen_core::{
    config::{RouterConfig, RuntimeConfig},
    unix, Broker, Context, Router,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::{
    connect::{ConnectParams, Connected, Method},
    context_service, file_service,
    target::{
        self, ExecCommand, ExecOutput, TransferFile, EXEC_COMMAND, READ_PATH, TRANSFER_FILE,
        WRITE_PATH,
    },
    wire::HexBytes,
    Result,
};

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Unix socket of the mux.
    pub listener_path: PathBuf,
    pub runtime: RuntimeConfig,
    pub router: RouterConfig,
    /// How the target is reached.
    pub transport: ConnectParams,
    /// Elevation applied on top of the transport.
    pub become_params: Option<ConnectParams>,
    /// Host name reported in command output.
    pub remote_addr: String,
}

impl ConnectionOptions {
    pub fn new(listener_path: impl Into<PathBuf>, transport: ConnectParams) -> Self {
        let remote_addr = match &transport.method {
            Method::Ssh(ssh) => ssh.hostname.clone(),
            Method::Docker(docker) => docker.container.clone(),
            Method::Local | Method::Sudo(_) => "localhost".to_string(),
        };
        Self {
            listener_path: listener_path.into(),
            runtime: RuntimeConfig::default(),
            router: RouterConfig::default(),
            transport,
            become_params: None,
            remote_addr,
        }
    }
}

struct Session {
    router: Router,
    mux: Context,
}

pub struct Connection {
    options: ConnectionOptions,
    session: Option<Session>,
    /// Context of the transport.
    host: Option<Connected>,
    /// Context commands run in: the transport or the elevated one.
    context: Option<Connected>,
}

impl Connection {
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            options,
            session: None,
            host: None,
            context: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.context.is_some()
    }

    fn session(&mut self) -> Result<&Session> {
        if self.session.is_none() {
            let broker = Broker::new(&self.options.runtime)?;
            let (router, mux) =
                unix::connect(&self.options.listener_path, broker, &self.options.router)?;
            debug!("joined mux as context {}", router.context_id());
            self.session = Some(Session { router, mux });
        }
        self.session
            .as_ref()
            .ok_or_else(|| crate::ServiceError::Connection("no session".to_string()))
    }

    /// Make sure a target context is available.
    pub fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let mux = self.session()?.mux.clone();
        let transport = self.options.transport.clone();
        let become_params = self.options.become_params.clone();

        // A local transport needs no separate host to elevate from.
        if matches!(transport.method, Method::Local) {
            self.context = Some(match become_params {
                Some(params) => context_service::get(&mux, &params)?,
                None => context_service::get(&mux, &transport)?,
            });
            return Ok(());
        }

        let host = context_service::get(&mux, &transport)?;
        self.host = Some(host.clone());
        self.context = Some(match become_params {
            Some(params) => context_service::get(&mux, &params.via(host.context.to_ref()))?,
            None => host,
        });
        Ok(())
    }

    fn target(&mut self) -> Result<Context> {
        self.connect()?;
        self.context
            .as_ref()
            .map(|c| c.context.clone())
            .ok_or_else(|| crate::ServiceError::Connection("not connected".to_string()))
    }

    /// Release the target contexts. With `new_task` the mux session stays
    /// up for the next task. Safe to call repeatedly.
    pub fn close(&mut self, new_task: bool) {
        let host = self.host.take();
        let context = self.context.take();
        if let Some(session) = &self.session {
            let mut released = Vec::new();
            for connected in [host, context].into_iter().flatten() {
                let id = connected.context.id();
                if released.contains(&id) {
                    continue;
                }
                released.push(id);
                if let Err(e) = context_service::put(&session.mux, &connected.context) {
                    warn!("failed to release {:?}: {}", connected.context, e);
                }
            }
        }
        if !new_task {
            if let Some(session) = self.session.take() {
                session.router.broker().shutdown();
                session.router.broker().join();
            }
        }
    }

    /// Call `function` in the target and wait for its result.
    pub fn call<R, A>(&mut self, function: &str, args: &A) -> Result<R>
    where
        R: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        let target = self.target()?;
        let started = Instant::now();
        let result = target.call(function, args);
        debug!(
            "call {} took {} ms",
            function,
            started.elapsed().as_millis()
        );
        Ok(result?)
    }

    /// Run `cmd` with the target's shell. Without input data and when
    /// elevation may apply, output is merged as a terminal would show it.
    pub fn exec_command(
        &mut self,
        cmd: &str,
        in_data: &[u8],
        sudoable: bool,
        chdir: Option<&Path>,
    ) -> Result<ExecOutput> {
        let emulate_tty = in_data.is_empty() && sudoable;
        let request = ExecCommand {
            cmd: cmd.to_string(),
            in_data: in_data.to_vec(),
            chdir: chdir.map(Path::to_path_buf),
            emulate_tty,
        };
        let mut output: ExecOutput = self.call(EXEC_COMMAND, &request)?;
        output.stderr.extend_from_slice(
            format!(
                "Shared connection to {} closed.{}",
                self.options.remote_addr,
                if emulate_tty { "\r\n" } else { "\n" }
            )
            .as_bytes(),
        );
        Ok(output)
    }

    /// Copy the target's `in_path` to the local `out_path`.
    pub fn fetch_file(&mut self, in_path: &Path, out_path: &Path) -> Result<()> {
        let data: HexBytes = self.call(READ_PATH, in_path)?;
        target::write_path(out_path, &data.0)?;
        Ok(())
    }

    /// Write `data` to `out_path` on the target.
    pub fn put_data(&mut self, out_path: &Path, data: &[u8]) -> Result<()> {
        self.call::<(), _>(WRITE_PATH, &(out_path, HexBytes(data.to_vec())))
    }

    /// Stream the local `in_path` to `out_path` on the target through the
    /// mux's file service. The registration is released afterwards, whether
    /// or not the transfer succeeded.
    pub fn put_file(&mut self, in_path: &Path, out_path: &Path) -> Result<()> {
        let in_path = in_path.canonicalize()?;
        let mux = self.session()?.mux.clone();
        file_service::register(&mux, &in_path)?;
        let result = self.call::<(), _>(
            TRANSFER_FILE,
            &TransferFile {
                context: mux.to_ref(),
                in_path: in_path.clone(),
                out_path: out_path.to_path_buf(),
            },
        );
        if let Err(e) = file_service::unregister(&mux, &in_path) {
            warn!("failed to unregister {}: {}", in_path.display(), e);
        }
        result
    }

    pub fn home_dir(&mut self) -> Result<String> {
        self.connect()?;
        Ok(self
            .context
            .as_ref()
            .map(|c| c.home_dir.clone())
            .unwrap_or_default())
    }

    /// Name of the context commands run in, once connected.
    pub fn context_name(&self) -> Option<&str> {
        self.context.as_ref().map(|c| c.context.name())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close(false);
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::Arc};

    use super::*;
    use crate::{
        connect::{SshParams, SudoParams},
        mux::{Mux, MuxConfig},
        testing::InProcessConnector,
    };

    fn start_mux(dir: &Path) -> (Mux, Arc<InProcessConnector>) {
        let connector = Arc::new(InProcessConnector::default());
        let mut config = MuxConfig::new(dir.join("mux.sock"));
        config.pool_size = 4;
        let mux = Mux::with_connector(&config, connector.clone()).unwrap();
        (mux, connector)
    }

    #[test]
    fn runs_commands_and_moves_files() {
        let dir = tempfile::tempdir().unwrap();
        let (mux, connector) = start_mux(dir.path());
        let mut conn = Connection::new(ConnectionOptions::new(
            mux.listener_path(),
            ConnectParams::local(),
        ));

        let out = conn.exec_command("echo hi", b"", true, None).unwrap();
        assert_eq!(out.rc, 0);
        assert_eq!(out.stdout, b"hi\n");
        assert_eq!(out.stderr, b"Shared connection to localhost closed.\r\n");
        assert_eq!(conn.context_name(), Some("local"));
        assert_eq!(conn.home_dir().unwrap(), "/home/fake");

        let out = conn.exec_command("cat", b"piped", true, None).unwrap();
        assert_eq!(out.stdout, b"piped");
        assert_eq!(out.stderr, b"Shared connection to localhost closed.\n");

        let remote = dir.path().join("remote.txt");
        conn.put_data(&remote, b"put data").unwrap();
        let local = dir.path().join("fetched.txt");
        conn.fetch_file(&remote, &local).unwrap();
        assert_eq!(fs::read(&local).unwrap(), b"put data");

        let big = dir.path().join("big.bin");
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
        fs::write(&big, &data).unwrap();
        let copy = dir.path().join("copy.bin");
        conn.put_file(&big, &copy).unwrap();
        assert_eq!(fs::read(&copy).unwrap(), data);
        assert!(mux.file_service().registered().is_empty());

        // A failed transfer releases the file too.
        assert!(conn
            .put_file(&big, &dir.path().join("missing/dir/copy.bin"))
            .is_err());
        assert!(mux.file_service().registered().is_empty());
        assert_eq!(connector.attempts(), 1);

        // A new task keeps the session but releases the target.
        conn.close(true);
        assert!(!conn.is_connected());
        assert!(mux.context_service().connected().is_empty());
        conn.exec_command("true", b"", false, None).unwrap();
        assert_eq!(connector.attempts(), 2);

        conn.close(false);
        conn.close(false);
        connector.stop_all();
        mux.shutdown();
    }

    #[test]
    fn elevation_runs_on_top_of_the_transport() {
        let dir = tempfile::tempdir().unwrap();
        let (mux, connector) = start_mux(dir.path());
        let mut options = ConnectionOptions::new(
            mux.listener_path(),
            ConnectParams::new(Method::Ssh(SshParams {
                hostname: "web1".into(),
                ..Default::default()
            })),
        );
        options.become_params = Some(ConnectParams::new(Method::Sudo(SudoParams {
            username: Some("root".into()),
            ..Default::default()
        })));
        let mut conn = Connection::new(options);

        let out = conn.exec_command("exit 4", b"", true, None).unwrap();
        assert_eq!(out.rc, 4);
        assert_eq!(out.stderr, b"Shared connection to web1 closed.\r\n");
        assert_eq!(conn.context_name(), Some("sudo.root"));
        assert_eq!(connector.attempts(), 2);
        assert_eq!(mux.context_service().connected().len(), 2);

        drop(conn);
        assert!(mux.context_service().connected().is_empty());
        connector.stop_all();
        mux.shutdown();
    }
}
