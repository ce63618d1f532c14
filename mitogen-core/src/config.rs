use std::path::Path;

use anyhow::bail;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

// MAX configuration file size: 16 MB
const MAX_CONFIG_FILE_SIZE: u64 = 16 * 1024 * 1024;
// Default iouring/epoll entries: 1k
const DEFAULT_ENTRIES: u32 = 1024;
// Default max message size: 128 MB
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;
pub const MIN_SQPOLL_IDLE_TIME: u32 = 1000; // 1s idle time.

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

/// Event loop settings for a broker thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    #[serde(default = "default_entries")]
    pub entries: u32,
    pub sqpoll_idle: Option<u32>,
    #[serde(default)]
    pub runtime_type: RuntimeType,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            entries: default_entries(),
            sqpoll_idle: None,
            runtime_type: Default::default(),
        }
    }
}

define_const!(default_entries, DEFAULT_ENTRIES, u32);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    #[cfg(target_os = "linux")]
    IoUring,
    #[default]
    Legacy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouterConfig {
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            max_message_size: default_max_message_size(),
        }
    }
}

define_const!(default_max_message_size, DEFAULT_MAX_MESSAGE_SIZE, usize);

/// Parse a config document. JSON when the first non-blank byte is `{`,
/// TOML otherwise.
pub fn parse<T: DeserializeOwned>(content: &[u8]) -> anyhow::Result<T> {
    // read first non-space u8
    let is_json = match content
        .iter()
        .find(|&&b| b != b' ' && b != b'\r' && b != b'\n' && b != b'\t')
    {
        Some(first) => *first == b'{',
        None => false,
    };
    match is_json {
        true => serde_json::from_slice::<T>(content).map_err(Into::into),
        false => toml::from_str::<T>(&String::from_utf8_lossy(content)).map_err(Into::into),
    }
}

pub fn load<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) => bail!("Config: error open file {}: {:?}", path.display(), e),
    };
    if meta.len() > MAX_CONFIG_FILE_SIZE {
        bail!("Config: max file size: {}", MAX_CONFIG_FILE_SIZE);
    }
    parse(&std::fs::read(path)?)
}
