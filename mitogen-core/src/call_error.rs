use std::{any::Any, backtrace::Backtrace, fmt};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A failure raised by a function running in another context.
///
/// The only error that crosses a process boundary as data. It carries exactly
/// one formatted string, which survives a serialize/deserialize round trip
/// unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct CallError {
    message: String,
}

/// Build a [`CallError`], `%`-interpolating the arguments when any are given.
///
/// ```
/// use mitogen_core::call_error;
///
/// assert_eq!(call_error!("%s%s").message(), "%s%s");
/// assert_eq!(call_error!("%s%s", 1, 1).message(), "11");
/// ```
#[macro_export]
macro_rules! call_error {
    ($msg:expr) => {
        $crate::CallError::new($msg)
    };
    ($fmt:expr, $($arg:expr),+ $(,)?) => {
        $crate::CallError::with_args($fmt, &[$(&$arg as &dyn ::std::fmt::Display),+])
    };
}

impl CallError {
    /// Literal message. `%` sequences are kept as they are.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Message produced by `%`-interpolating `args` into `fmt`.
    pub fn with_args(fmt: &str, args: &[&dyn fmt::Display]) -> Self {
        Self {
            message: interpolate(fmt, args),
        }
    }

    /// `"<type name>: <text>"` for a concrete error value.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        Self {
            message: format!("{}: {err}", std::any::type_name::<E>()),
        }
    }

    /// Like [`CallError::from_error`], with the current backtrace appended.
    pub fn from_error_with_backtrace<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let mut this = Self::from_error(err);
        this.message
            .push_str(&format!("\nBacktrace:\n{}", Backtrace::force_capture()));
        this
    }

    /// Describe a caught panic payload.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let text = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self {
            message: format!("panic: {text}"),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

// Supports the conversions the remote side actually produces: %s, %d, %r
// and the %% escape. Anything else is copied through untouched.
fn interpolate(fmt: &str, args: &[&dyn fmt::Display]) -> String {
    let mut out = String::with_capacity(fmt.len());
    let mut args = args.iter();
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('%') => {
                chars.next();
                out.push('%');
            }
            Some(conv @ ('s' | 'd' | 'r')) => match args.next() {
                Some(arg) => {
                    chars.next();
                    if conv == 'r' {
                        out.push_str(&format!("{:?}", arg.to_string()));
                    } else {
                        out.push_str(&arg.to_string());
                    }
                }
                None => out.push('%'),
            },
            _ => out.push('%'),
        }
    }
    out
}
