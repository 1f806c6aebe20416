//! Error taxonomy for Sarus's runtime assembly pipeline.
//!
//! Every failure is classified into one of the kinds below (see spec
//! section 7) and carries a trace of frames accumulated as the error
//! propagates up through layers, the way a C++ exception would carry a
//! backtrace. `#[track_caller]` supplies `{file, line}`; callers name the
//! `function` explicitly via [`Error::trace`] since Rust has no portable
//! "current function name" intrinsic.

use std::fmt;
use std::panic::Location;

/// Alias for `Result<T, sarus_core::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// One annotation frame attached as an error crosses a layer boundary.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Source file of the annotation site.
    pub file: &'static str,
    /// Source line of the annotation site.
    pub line: u32,
    /// Name of the function doing the annotating.
    pub function: &'static str,
    /// Human-readable context for this frame.
    pub message: String,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({}): {}", self.file, self.line, self.function, self.message)
    }
}

/// The kind of failure, independent of where it occurred.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Kind {
    /// Malformed CLI/mount/device string, absolute-path violation, access-flag
    /// violation, or destination blacklist hit.
    #[error("invalid request '{request}': {reason}")]
    InvalidRequest {
        /// The offending request string.
        request: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Tampered path detected, lock-file timeout exceeded, or a destination
    /// resolved outside the rootfs after symlink resolution.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// A mount/umount/mknod/chown/chmod/lock syscall failed.
    #[error("I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),

    /// A spawned external tool exited non-zero.
    #[error("external tool '{command}' failed with status {status}")]
    ExternalToolFailure {
        /// The command line that was run.
        command: String,
        /// Its exit status, or -1 if it was killed by a signal.
        status: i32,
    },

    /// An internal invariant was violated (e.g. a `dup` returned a lower fd
    /// than its source, or a schema-shaped JSON document was missing a
    /// required field after validation was believed to have passed).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The requested image does not exist in the local store. Distinct from
    /// the other kinds because the CLI reports it to the user specially.
    #[error("image not found: {0}")]
    NotFound(String),
}

/// An error with a kind and a propagation trace.
#[derive(Debug)]
pub struct Error {
    /// The root cause.
    pub kind: Kind,
    /// Frames pushed by each layer that re-threw this error, innermost first.
    pub trace: Vec<Frame>,
}

impl Error {
    /// Wraps a [`Kind`] into a fresh [`Error`] with an empty trace.
    #[track_caller]
    pub fn new(kind: Kind) -> Self {
        Self { kind, trace: Vec::new() }
    }

    /// Pushes an annotation frame at the call site and returns `self`.
    ///
    /// Typical use: `do_thing().map_err(|e| e.trace("assembling bundle"))?`.
    #[track_caller]
    pub fn trace(mut self, message: impl Into<String>) -> Self {
        let loc = Location::caller();
        self.trace.push(Frame {
            file: loc.file(),
            line: loc.line(),
            function: "<closure>",
            message: message.into(),
        });
        self
    }

    /// Like [`trace`](Self::trace) but names the function explicitly, for
    /// call sites that want a precise function name in the frame.
    #[track_caller]
    pub fn trace_in(mut self, function: &'static str, message: impl Into<String>) -> Self {
        let loc = Location::caller();
        self.trace.push(Frame {
            file: loc.file(),
            line: loc.line(),
            function,
            message: message.into(),
        });
        self
    }

    /// Shorthand for `Error::new(Kind::InvalidRequest { .. })`.
    #[track_caller]
    pub fn invalid(request: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(Kind::InvalidRequest { request: request.into(), reason: reason.into() })
    }

    /// Shorthand for `Error::new(Kind::PolicyViolation(..))`.
    #[track_caller]
    pub fn policy(message: impl Into<String>) -> Self {
        Self::new(Kind::PolicyViolation(message.into()))
    }

    /// Shorthand for `Error::new(Kind::InvariantViolation(..))`.
    #[track_caller]
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(Kind::InvariantViolation(message.into()))
    }

    /// Shorthand for `Error::new(Kind::ExternalToolFailure { .. })`.
    #[track_caller]
    pub fn external_tool(command: impl Into<String>, status: i32) -> Self {
        Self::new(Kind::ExternalToolFailure { command: command.into(), status })
    }

    /// `true` if this is the distinguished "image not found" condition.
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind, Kind::NotFound(_))
    }
}

impl From<std::io::Error> for Error {
    #[track_caller]
    fn from(e: std::io::Error) -> Self {
        Self::new(Kind::IoFailure(e))
    }
}

impl From<sarus_store::Error> for Error {
    #[track_caller]
    fn from(e: sarus_store::Error) -> Self {
        match e {
            sarus_store::Error::Io(io) => Self::new(Kind::IoFailure(io)),
            sarus_store::Error::NotFound(s) => Self::new(Kind::NotFound(s)),
            other => Self::new(Kind::InvalidRequest { request: "image reference".into(), reason: other.to_string() }),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for frame in self.trace.iter().rev() {
            write!(f, "\n  caused by: {frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}
