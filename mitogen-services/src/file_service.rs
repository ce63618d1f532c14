//! Serves registered files to other contexts in bounded chunks.
//!
//! Each registered path keeps one open handle. Chunks are read with
//! positional reads, so any number of requesters stream the same file at
//! independent offsets without reopening or seeking it. Registrations are
//! counted; the handle closes once every registrant unregistered and no
//! fetch still reads from it.
use std::{
    collections::HashMap,
    fs::File,
    io::{self, Write},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use mitogen_core::{message::FILE_SERVICE, CallContext, CallError, Context, Handle};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::{
    service::{call_service, kwargs, reply, unknown_method, Service},
    target::parent_dir,
    wire::HexBytes,
    Result, ServiceError,
};

// Default chunk size: 128 KiB
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRequest {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub path: PathBuf,
    pub offset: u64,
    /// Bytes wanted; the service never returns more than its chunk size.
    #[serde(default)]
    pub size: Option<usize>,
}

struct Registered {
    file: File,
    size: u64,
}

struct Entry {
    registered: Arc<Registered>,
    refs: usize,
}

pub struct FileService {
    chunk_size: usize,
    files: Mutex<HashMap<PathBuf, Entry>>,
}

impl Default for FileService {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl FileService {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            files: Mutex::new(HashMap::new()),
        }
    }

    fn files(&self) -> MutexGuard<'_, HashMap<PathBuf, Entry>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, path: &Path) -> Option<Arc<Registered>> {
        self.files().get(path).map(|e| e.registered.clone())
    }

    /// Make `path` available for fetching and return its size. Registering
    /// a path twice keeps the first handle and takes another reference.
    pub fn register(&self, path: &Path) -> Result<u64> {
        if !path.is_absolute() {
            return Err(ServiceError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path must be absolute: {}", path.display()),
            )));
        }
        if let Some(entry) = self.files().get_mut(path) {
            entry.refs += 1;
            return Ok(entry.registered.size);
        }
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let mut files = self.files();
        let entry = files.entry(path.to_path_buf()).or_insert_with(|| Entry {
            registered: Arc::new(Registered { file, size }),
            refs: 0,
        });
        entry.refs += 1;
        info!("registered {} ({} bytes)", path.display(), entry.registered.size);
        Ok(entry.registered.size)
    }

    /// Drop one registration of `path`. The last one makes the path
    /// unavailable. Returns false if `path` was not registered.
    pub fn unregister(&self, path: &Path) -> bool {
        let mut files = self.files();
        let Some(entry) = files.get_mut(path) else {
            return false;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            files.remove(path);
            info!("unregistered {}", path.display());
        }
        true
    }

    /// Paths currently registered.
    pub fn registered(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.files().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn stat(&self, path: &Path) -> Result<u64> {
        self.lookup(path)
            .map(|r| r.size)
            .ok_or_else(|| ServiceError::NotRegistered(path.to_path_buf()))
    }

    /// Up to `size` bytes (at most one chunk) of `path` from `offset`.
    /// Empty once `offset` reaches the registered size.
    pub fn fetch(&self, path: &Path, offset: u64, size: Option<usize>) -> Result<Vec<u8>> {
        let registered = self
            .lookup(path)
            .ok_or_else(|| ServiceError::NotRegistered(path.to_path_buf()))?;
        let remaining = registered.size.saturating_sub(offset);
        let want = size
            .unwrap_or(self.chunk_size)
            .min(self.chunk_size)
            .min(remaining as usize);
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            match registered.file.read_at(&mut buf[filled..], offset + filled as u64)? {
                0 => break,
                n => filled += n,
            }
        }
        buf.truncate(filled);
        debug!("fetch {} @{}: {} bytes", path.display(), offset, filled);
        Ok(buf)
    }
}

impl Service for FileService {
    fn name(&self) -> &str {
        "file_service"
    }

    fn handle(&self) -> Handle {
        FILE_SERVICE
    }

    fn restricted(&self, method: &str) -> bool {
        matches!(method, "register" | "unregister")
    }

    fn dispatch(
        &self,
        _ctx: &CallContext,
        method: &str,
        args: Value,
    ) -> std::result::Result<Value, CallError> {
        match method {
            "register" => {
                let req: PathRequest = kwargs(args)?;
                reply(self.register(&req.path)?)
            }
            "unregister" => {
                let req: PathRequest = kwargs(args)?;
                reply(self.unregister(&req.path))
            }
            "stat" => {
                let req: PathRequest = kwargs(args)?;
                reply(self.stat(&req.path)?)
            }
            "fetch" => {
                let req: FetchRequest = kwargs(args)?;
                reply(HexBytes(self.fetch(&req.path, req.offset, req.size)?))
            }
            _ => Err(unknown_method(self.name(), method)),
        }
    }
}

/// Register `path` with the file service running in `context`.
pub fn register(context: &Context, path: &Path) -> Result<u64> {
    call_service(context, FILE_SERVICE, "register", &PathRequest { path: path.into() })
        .map_err(remote)
}

/// Release a registration taken with [`register`].
pub fn unregister(context: &Context, path: &Path) -> Result<bool> {
    call_service(context, FILE_SERVICE, "unregister", &PathRequest { path: path.into() })
        .map_err(remote)
}

pub fn stat(context: &Context, path: &Path) -> Result<u64> {
    call_service(context, FILE_SERVICE, "stat", &PathRequest { path: path.into() })
        .map_err(remote)
}

pub fn fetch(context: &Context, path: &Path, offset: u64, size: usize) -> Result<Vec<u8>> {
    let req = FetchRequest {
        path: path.into(),
        offset,
        size: Some(size),
    };
    call_service::<HexBytes, _>(context, FILE_SERVICE, "fetch", &req)
        .map(|data| data.0)
        .map_err(remote)
}

/// Stream `path` from the service in `context` into `out`, chunk by chunk.
/// Returns the number of bytes written.
pub fn fetch_to(context: &Context, path: &Path, out: &mut impl Write) -> Result<u64> {
    let size = stat(context, path)?;
    let mut offset = 0;
    while offset < size {
        let chunk = fetch(context, path, offset, DEFAULT_CHUNK_SIZE)?;
        if chunk.is_empty() {
            break;
        }
        out.write_all(&chunk)?;
        offset += chunk.len() as u64;
    }
    Ok(offset)
}

/// Copy `in_path` from the service in `context` to the local `out_path`,
/// replacing it only once the whole file arrived.
pub fn download(context: &Context, in_path: &Path, out_path: &Path) -> Result<u64> {
    let mut tmp = NamedTempFile::new_in(parent_dir(out_path))?;
    let written = fetch_to(context, in_path, &mut tmp)?;
    tmp.as_file().sync_all()?;
    tmp.persist(out_path).map_err(|e| e.error)?;
    info!(
        "transferred {} to {} ({} bytes)",
        in_path.display(),
        out_path.display(),
        written
    );
    Ok(written)
}

fn remote(err: ServiceError) -> ServiceError {
    match err {
        ServiceError::Core(e) => ServiceError::from_remote(e),
        e => e,
    }
}
