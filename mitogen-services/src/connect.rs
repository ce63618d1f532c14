//! Connection methods and the connector that starts agents for them.
//!
//! A [`ConnectParams`] names one way of reaching a target: run the agent
//! locally, over ssh, under sudo or inside a docker container, optionally
//! starting it from an already connected `via` context instead of from here.
//! The agent then speaks the framed protocol on its stdin/stdout, which the
//! spawning side attaches as a child stream.
use std::{
    os::{fd::OwnedFd, unix::net::UnixStream as StdUnixStream},
    path::PathBuf,
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use mitogen_core::{Context, ContextId, ContextRef, Router, Transport};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{target, Result, ServiceError};

// Default connect timeout: 30s
const DEFAULT_CONNECT_TIMEOUT: u64 = 30;
// Time a child is given to exit once its stream closes.
const REAP_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_REMOTE_AGENT_PATH: &str = "mitogen";

fn default_remote_agent_path() -> String {
    DEFAULT_REMOTE_AGENT_PATH.to_string()
}

/// How to reach a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectParams {
    #[serde(flatten)]
    pub method: Method,
    /// Agent program started on the target.
    #[serde(default, alias = "python_path", skip_serializing_if = "Option::is_none")]
    pub agent_path: Option<String>,
    /// Seconds to wait for the agent to come up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,
    /// Start the agent from this context rather than from the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<ContextRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method_name", rename_all = "snake_case")]
pub enum Method {
    Local,
    Ssh(SshParams),
    Sudo(SudoParams),
    Docker(DockerParams),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshParams {
    pub hostname: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub identity_file: Option<String>,
    #[serde(default)]
    pub ssh_path: Option<String>,
    #[serde(default)]
    pub check_host_keys: bool,
    #[serde(default)]
    pub ssh_args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SudoParams {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub sudo_path: Option<String>,
    #[serde(default)]
    pub sudo_args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerParams {
    pub container: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub docker_path: Option<String>,
}

impl ConnectParams {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            agent_path: None,
            connect_timeout: None,
            via: None,
        }
    }

    pub fn local() -> Self {
        Self::new(Method::Local)
    }

    pub fn via(mut self, context: ContextRef) -> Self {
        self.via = Some(context);
        self
    }

    /// Canonical form: equal parameters always produce the same key.
    pub fn key(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT))
    }

    /// Name given to the resulting context.
    pub fn name(&self) -> String {
        match &self.method {
            Method::Local => "local".to_string(),
            Method::Ssh(ssh) => match ssh.port {
                Some(port) => format!("ssh.{}:{}", ssh.hostname, port),
                None => format!("ssh.{}", ssh.hostname),
            },
            Method::Sudo(sudo) => format!("sudo.{}", sudo.username.as_deref().unwrap_or("root")),
            Method::Docker(docker) => format!("docker.{}", docker.container),
        }
    }

    /// Privilege elevation fails as [`ServiceError::Become`], everything
    /// else as [`ServiceError::Connection`].
    pub fn is_become(&self) -> bool {
        matches!(self.method, Method::Sudo(_))
    }

    pub fn failure(&self, msg: impl Into<String>) -> ServiceError {
        if self.is_become() {
            ServiceError::Become(msg.into())
        } else {
            ServiceError::Connection(msg.into())
        }
    }

    /// Command line running `agent` through this method.
    pub fn argv(&self, agent: &[String]) -> Result<Vec<String>> {
        let mut argv = Vec::new();
        match &self.method {
            Method::Local => {}
            Method::Ssh(ssh) => {
                if ssh.password.is_some() {
                    return Err(self.failure("ssh password authentication is not supported"));
                }
                argv.push(ssh.ssh_path.clone().unwrap_or_else(|| "ssh".to_string()));
                argv.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
                if !ssh.check_host_keys {
                    for opt in [
                        "StrictHostKeyChecking=no",
                        "UserKnownHostsFile=/dev/null",
                        "GlobalKnownHostsFile=/dev/null",
                    ] {
                        argv.extend(["-o".to_string(), opt.to_string()]);
                    }
                }
                if let Some(timeout) = self.connect_timeout {
                    argv.extend(["-o".to_string(), format!("ConnectTimeout={timeout}")]);
                }
                if let Some(username) = &ssh.username {
                    argv.extend(["-l".to_string(), username.clone()]);
                }
                if let Some(port) = ssh.port {
                    argv.extend(["-p".to_string(), port.to_string()]);
                }
                if let Some(identity) = &ssh.identity_file {
                    argv.extend(["-i".to_string(), identity.clone()]);
                }
                argv.extend(ssh.ssh_args.iter().cloned());
                argv.push(ssh.hostname.clone());
                argv.push(shell_join(agent));
                return Ok(argv);
            }
            Method::Sudo(sudo) => {
                if sudo.password.is_some() {
                    return Err(self.failure("sudo password authentication is not supported"));
                }
                argv.push(sudo.sudo_path.clone().unwrap_or_else(|| "sudo".to_string()));
                // -n: fail instead of prompting for a password.
                argv.extend(["-n".to_string(), "-H".to_string(), "-u".to_string()]);
                argv.push(sudo.username.clone().unwrap_or_else(|| "root".to_string()));
                argv.extend(sudo.sudo_args.iter().cloned());
                argv.push("--".to_string());
            }
            Method::Docker(docker) => {
                argv.push(docker.docker_path.clone().unwrap_or_else(|| "docker".to_string()));
                argv.extend(["exec".to_string(), "-i".to_string()]);
                if let Some(username) = &docker.username {
                    argv.extend(["-u".to_string(), username.clone()]);
                }
                argv.push(docker.container.clone());
            }
        }
        argv.extend(agent.iter().cloned());
        Ok(argv)
    }
}

/// Quote `arg` for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c);
    if !arg.is_empty() && arg.chars().all(safe) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A freshly connected target.
#[derive(Debug, Clone)]
pub struct Connected {
    pub context: Context,
    pub home_dir: String,
}

/// Establishes connections on behalf of the context service.
pub trait Connector: Send + Sync + 'static {
    /// Bring up the context described by `params`. Blocks until the agent
    /// answers or the connect timeout expires.
    fn connect(&self, router: &Router, params: &ConnectParams) -> Result<Connected>;
}

/// Where the agent program lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectorConfig {
    /// Agent for local, sudo and via spawns. Defaults to the running
    /// executable.
    #[serde(default)]
    pub agent_path: Option<PathBuf>,
    /// Agent on ssh and docker targets, looked up in their `PATH`.
    #[serde(default = "default_remote_agent_path")]
    pub remote_agent_path: String,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            agent_path: None,
            remote_agent_path: default_remote_agent_path(),
        }
    }
}

/// Starts agents as child processes speaking over their stdio.
#[derive(Debug, Clone, Default)]
pub struct ProcessConnector {
    config: ConnectorConfig,
}

impl ProcessConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self { config }
    }

    /// Command line of the agent a context `context_id` should run.
    pub fn agent_command(
        &self,
        params: &ConnectParams,
        context_id: ContextId,
        parent_ids: &[ContextId],
    ) -> Result<Vec<String>> {
        let program = match (&params.agent_path, &params.method) {
            (Some(path), _) => path.clone(),
            (None, Method::Ssh(_) | Method::Docker(_)) => self.config.remote_agent_path.clone(),
            (None, Method::Local | Method::Sudo(_)) => match &self.config.agent_path {
                Some(path) => path.display().to_string(),
                None => std::env::current_exe()?.display().to_string(),
            },
        };
        let parent_ids = parent_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        Ok(vec![
            program,
            "agent".to_string(),
            "--context-id".to_string(),
            context_id.to_string(),
            "--parent-ids".to_string(),
            parent_ids,
        ])
    }

    /// Spawn the agent for `params` as context `context_id`, a child of the
    /// context `router` belongs to, and wait until it answers.
    pub fn start_child(
        &self,
        router: &Router,
        context_id: ContextId,
        params: &ConnectParams,
    ) -> Result<Context> {
        let mut ancestors = vec![router.context_id()];
        ancestors.extend_from_slice(router.parent_ids());
        let agent = self.agent_command(params, context_id, &ancestors)?;
        let argv = params.argv(&agent)?;
        let context = spawn_agent(router, context_id, params.name(), &argv)
            .map_err(|e| params.failure(format!("{}: {}", params.name(), e)))?;
        if let Err(e) = context.call_with_timeout::<bool, _>(
            mitogen_core::dispatch::PING,
            &(),
            params.timeout(),
        ) {
            let _ = router.disconnect(context_id);
            return Err(params.failure(format!("{}: {}", params.name(), e)));
        }
        Ok(context)
    }

    fn start_via(&self, router: &Router, via: &ContextRef, params: &ConnectParams) -> Result<Context> {
        let via = via.clone().attach(router);
        let request = target::ConnectChild {
            context_id: router.allocate_id()?,
            params: ConnectParams {
                via: None,
                ..params.clone()
            },
        };
        debug!("asking {:?} to start {}", via, params.name());
        let child: ContextRef = via
            .call_with_timeout(target::CONNECT_CHILD, &request, params.timeout())
            .map_err(|e| params.failure(format!("{} via {}: {}", params.name(), via.name(), e)))?;
        Ok(child.attach(router))
    }
}

impl Connector for ProcessConnector {
    fn connect(&self, router: &Router, params: &ConnectParams) -> Result<Connected> {
        let context = match &params.via {
            Some(via) => self.start_via(router, via, params)?,
            None => self.start_child(router, router.allocate_id()?, params)?,
        };
        let home_dir = context
            .call_with_timeout::<String, _>(target::HOME_DIR, &(), params.timeout())
            .map_err(|e| params.failure(format!("{}: {}", context.name(), e)))?;
        info!("connected to {:?}", context);
        Ok(Connected { context, home_dir })
    }
}

/// Run `argv` with its stdin/stdout on a socketpair and attach our end as
/// the stream to `context_id`. The process is reaped once the stream closes.
pub fn spawn_agent(
    router: &Router,
    context_id: ContextId,
    name: String,
    argv: &[String],
) -> Result<Context> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| ServiceError::Connection("empty command line".to_string()))?;
    let (ours, theirs) = StdUnixStream::pair()?;
    let stdin = theirs.try_clone()?;
    debug!("starting {:?}", argv);
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::from(OwnedFd::from(stdin)))
        .stdout(Stdio::from(OwnedFd::from(theirs)))
        .stderr(Stdio::inherit())
        .spawn()?;
    let transport = Transport::unix(ours).on_close(move || reap(child));
    Ok(router.connect_stream(transport, context_id, name, false)?)
}

fn reap(mut child: Child) {
    let pid = child.id();
    let deadline = Instant::now() + REAP_GRACE;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return debug!("process {} exited: {}", pid, status),
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
            Ok(None) => {
                warn!("process {} did not exit, killing it", pid);
                let _ = child.kill();
                let _ = child.wait();
                return;
            }
            Err(e) => return warn!("failed to reap process {}: {}", pid, e),
        }
    }
}
