use std::path::PathBuf;

use mitogen_core::CallError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServiceError>;

// Prefix of the `NotRegistered` message.
const NOT_REGISTERED: &str = "path is not registered: ";

#[derive(Error, Debug)]
pub enum ServiceError {
    /// The transport to a target could not be established.
    #[error("connection failed: {0}")]
    Connection(String),
    /// A transport came up but privilege elevation on top of it failed.
    #[error("become failed: {0}")]
    Become(String),
    #[error("path is not registered: {}", .0.display())]
    NotRegistered(PathBuf),
    #[error(transparent)]
    Core(#[from] mitogen_core::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ServiceError {
    /// Recover the `NotRegistered` kind from a remote failure.
    pub(crate) fn from_remote(err: mitogen_core::Error) -> Self {
        if let mitogen_core::Error::Call(e) = &err {
            if let Some(path) = e.message().strip_prefix(NOT_REGISTERED) {
                return ServiceError::NotRegistered(PathBuf::from(path));
            }
        }
        ServiceError::Core(err)
    }
}

impl From<ServiceError> for CallError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Core(mitogen_core::Error::Call(e)) => e,
            e => CallError::new(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_registered_survives_the_boundary() {
        let remote: CallError = ServiceError::NotRegistered("/etc/hosts".into()).into();
        assert_eq!(remote.message(), "path is not registered: /etc/hosts");
        match ServiceError::from_remote(mitogen_core::Error::Call(remote)) {
            ServiceError::NotRegistered(path) => assert_eq!(path, PathBuf::from("/etc/hosts")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn remote_call_errors_pass_through_unchanged() {
        let inner = CallError::new("bang");
        let outer: CallError = ServiceError::Core(mitogen_core::Error::Call(inner.clone())).into();
        assert_eq!(outer, inner);
    }
}
