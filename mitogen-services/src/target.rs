//! Functions an agent exposes to its callers.
//!
//! [`registry`] is what every agent serves on `CALL_FUNCTION`: command
//! execution, whole-file reads and writes, streamed file transfer from a
//! [`FileService`](crate::file_service::FileService), and the bootstrap
//! helpers used while connecting.
use std::{
    fs,
    io::{self, Write},
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
};

use mitogen_core::{CallError, ContextId, ContextRef, FunctionRegistry};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::{
    connect::{ConnectParams, ProcessConnector},
    file_service,
    wire::{hex_bytes, HexBytes},
};

pub const EXEC_COMMAND: &str = "mitogen.exec_command";
pub const READ_PATH: &str = "mitogen.read_path";
pub const WRITE_PATH: &str = "mitogen.write_path";
pub const TRANSFER_FILE: &str = "mitogen.transfer_file";
pub const HOME_DIR: &str = "mitogen.home_dir";
pub const CONNECT_CHILD: &str = "mitogen.connect_child";

const SHELL: &str = "/bin/sh";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecCommand {
    pub cmd: String,
    #[serde(default, with = "hex_bytes")]
    pub in_data: Vec<u8>,
    #[serde(default)]
    pub chdir: Option<PathBuf>,
    /// Merge stderr into stdout, as a terminal would show them.
    #[serde(default)]
    pub emulate_tty: bool,
}

impl ExecCommand {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub rc: i32,
    #[serde(with = "hex_bytes")]
    pub stdout: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub stderr: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferFile {
    /// Context running the file service that registered `in_path`.
    pub context: ContextRef,
    pub in_path: PathBuf,
    pub out_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectChild {
    pub context_id: ContextId,
    pub params: ConnectParams,
}

/// Run `cmd` with the shell, feeding it `in_data`.
///
/// A command killed by a signal reports the negated signal number.
pub fn exec_command(req: &ExecCommand) -> io::Result<ExecOutput> {
    let script = match req.emulate_tty {
        true => format!("exec 2>&1\n{}", req.cmd),
        false => req.cmd.clone(),
    };
    let mut command = Command::new(SHELL);
    command
        .arg("-c")
        .arg(script)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &req.chdir {
        command.current_dir(dir);
    }
    debug!("running {:?}", req.cmd);
    let mut child = command.spawn()?;

    // Fed from a separate thread so a chatty command can't deadlock us.
    let stdin = child.stdin.take();
    let data = req.in_data.clone();
    let feeder = thread::spawn(move || {
        if let Some(mut stdin) = stdin {
            let _ = stdin.write_all(&data);
        }
    });
    let output = child.wait_with_output()?;
    let _ = feeder.join();

    let rc = match output.status.code() {
        Some(code) => code,
        None => -output.status.signal().unwrap_or(0),
    };
    Ok(ExecOutput {
        rc,
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

pub fn read_path(path: &Path) -> io::Result<Vec<u8>> {
    fs::read(path)
}

/// Replace `path` with `data`. Readers never observe a partial file.
pub fn write_path(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tmp = NamedTempFile::new_in(parent_dir(path))?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

pub fn home_dir() -> io::Result<PathBuf> {
    dirs::home_dir()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no home directory"))
}

fn io_error(e: io::Error) -> CallError {
    CallError::from_error(&e)
}

/// Functions every agent serves.
pub fn registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry
        .register(EXEC_COMMAND, |_, req: ExecCommand| {
            exec_command(&req).map_err(io_error)
        })
        .register(READ_PATH, |_, path: PathBuf| {
            read_path(&path).map(HexBytes).map_err(io_error)
        })
        .register(WRITE_PATH, |_, (path, data): (PathBuf, HexBytes)| {
            write_path(&path, &data.0).map_err(io_error)
        })
        .register(TRANSFER_FILE, |ctx, req: TransferFile| {
            let source = req.context.attach(ctx.router());
            file_service::download(&source, &req.in_path, &req.out_path)?;
            Ok(())
        })
        .register(HOME_DIR, |_, ()| {
            home_dir()
                .map(|p| p.display().to_string())
                .map_err(io_error)
        })
        .register(CONNECT_CHILD, |ctx, req: ConnectChild| {
            let child = ProcessConnector::default().start_child(
                ctx.router(),
                req.context_id,
                &req.params,
            )?;
            Ok(child.to_ref())
        });
    registry
}
