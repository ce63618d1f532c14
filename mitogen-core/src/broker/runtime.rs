use std::{future::Future, io};

#[cfg(target_os = "linux")]
use monoio::IoUringDriver;
use monoio::{time::TimeDriver, LegacyDriver, Runtime, RuntimeBuilder};
use tracing::warn;

use crate::config::{RuntimeConfig, RuntimeType, MIN_SQPOLL_IDLE_TIME};

pub enum RuntimeWrapper {
    #[cfg(target_os = "linux")]
    IoUring(Runtime<TimeDriver<IoUringDriver>>),
    Legacy(Runtime<TimeDriver<LegacyDriver>>),
}

impl RuntimeWrapper {
    pub fn new(config: &RuntimeConfig) -> io::Result<Self> {
        match config.runtime_type {
            #[cfg(target_os = "linux")]
            RuntimeType::IoUring if monoio::utils::detect_uring() => {
                let builder = match config.sqpoll_idle {
                    Some(idle) => {
                        let builder = RuntimeBuilder::<IoUringDriver>::new();
                        let idle = MIN_SQPOLL_IDLE_TIME.max(idle);
                        let mut uring_builder = io_uring::IoUring::builder();
                        uring_builder.setup_sqpoll(idle);
                        builder.uring_builder(uring_builder)
                    }
                    None => RuntimeBuilder::<IoUringDriver>::new(),
                };
                let runtime = builder.enable_timer().with_entries(config.entries).build()?;
                Ok(RuntimeWrapper::IoUring(runtime))
            }
            #[cfg(target_os = "linux")]
            RuntimeType::IoUring => {
                warn!("io_uring unavailable, falling back to the legacy driver");
                Self::legacy(config)
            }
            RuntimeType::Legacy => Self::legacy(config),
        }
    }

    fn legacy(config: &RuntimeConfig) -> io::Result<Self> {
        let runtime = RuntimeBuilder::<LegacyDriver>::new()
            .enable_timer()
            .with_entries(config.entries)
            .build()?;
        Ok(RuntimeWrapper::Legacy(runtime))
    }

    pub fn block_on<F: Future>(&mut self, future: F) -> F::Output {
        match self {
            #[cfg(target_os = "linux")]
            RuntimeWrapper::IoUring(driver) => driver.block_on(future),
            RuntimeWrapper::Legacy(driver) => driver.block_on(future),
        }
    }
}
