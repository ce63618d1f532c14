use std::{
    io::{self, Read, Write},
    path::PathBuf,
    process::ExitCode,
};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use mitogen_core::{
    child::{self, ChildOptions},
    ContextId,
};
use mitogen_services::{target, ConnectParams, Connection, ConnectionOptions, Mux, MuxConfig};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve a parent context on stdin/stdout
    Agent {
        #[clap(long)]
        context_id: ContextId,
        /// Ancestors, nearest first
        #[clap(long, value_delimiter = ',', required = true)]
        parent_ids: Vec<ContextId>,
    },
    /// Run a multiplexer until it is shut down
    Mux {
        /// Path of the config file
        #[clap(short, long, value_parser)]
        config: Option<PathBuf>,
        /// Unix socket to listen on, overriding the config file
        #[clap(short, long)]
        listener_path: Option<PathBuf>,
    },
    /// Run a shell command on the local host through a multiplexer
    Exec {
        /// Socket of a running multiplexer; one is started in-process if
        /// omitted
        #[clap(long)]
        mux: Option<PathBuf>,
        /// Feed our stdin to the command
        #[clap(long)]
        stdin: bool,
        /// Keep stderr apart from stdout
        #[clap(long)]
        no_tty: bool,
        cmd: String,
    },
}

fn main() -> Result<ExitCode> {
    // An agent's stdout carries protocol frames, so logs go to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    match Args::parse().command {
        Command::Agent {
            context_id,
            parent_ids,
        } => {
            let options = ChildOptions {
                context_id,
                parent_ids,
                ..Default::default()
            };
            child::run_stdio(&options, target::registry())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Mux {
            config,
            listener_path,
        } => {
            let config = match (config, listener_path) {
                (Some(path), listener_path) => {
                    let mut config = MuxConfig::load(&path)
                        .with_context(|| format!("loading {}", path.display()))?;
                    if let Some(listener_path) = listener_path {
                        config.listener_path = listener_path;
                    }
                    config
                }
                (None, Some(listener_path)) => MuxConfig::new(listener_path),
                (None, None) => anyhow::bail!("either --config or --listener-path is required"),
            };
            let mux = Mux::start(&config)?;
            tracing::info!("mux started, pid {}", std::process::id());
            mux.join();
            Ok(ExitCode::SUCCESS)
        }
        Command::Exec {
            mux,
            stdin,
            no_tty,
            cmd,
        } => exec(mux, stdin, no_tty, &cmd),
    }
}

fn exec(mux_path: Option<PathBuf>, stdin: bool, no_tty: bool, cmd: &str) -> Result<ExitCode> {
    let mut in_data = Vec::new();
    if stdin {
        io::stdin().read_to_end(&mut in_data)?;
    }

    // Keeps the in-process mux and its socket directory alive until we exit.
    let mut local_mux = None;
    let listener_path = match mux_path {
        Some(path) => path,
        None => {
            let dir = tempfile::tempdir()?;
            let mux = Mux::start(&MuxConfig::new(dir.path().join("mux.sock")))?;
            let path = mux.listener_path().to_path_buf();
            local_mux = Some((mux, dir));
            path
        }
    };

    let mut conn = Connection::new(ConnectionOptions::new(
        listener_path,
        ConnectParams::local(),
    ));
    let output = conn.exec_command(cmd, &in_data, !no_tty, None)?;
    conn.close(false);
    drop(local_mux);

    io::stdout().write_all(&output.stdout)?;
    io::stderr().write_all(&output.stderr)?;
    let code = match output.rc {
        rc if rc < 0 => 128 - rc,
        rc => rc,
    };
    Ok(ExitCode::from(code.clamp(0, 255) as u8))
}
