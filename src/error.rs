//! Error types for the hakurei sandbox.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.
//! Each failure domain gets its own enum; the privileged-side pipeline wraps
//! failures with a step label so a single "cannot <action>: <reason>" line can
//! be printed for the user.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the application.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Host requirements not met
    #[error("system requirements check failed")]
    #[diagnostic(code(hakurei::system::requirements))]
    Requirements(#[from] RequirementsError),

    /// Configuration rejected by validation
    #[error(transparent)]
    #[diagnostic(code(hakurei::config))]
    Config(#[from] ConfigError),

    /// Transaction commit or revert failure
    #[error(transparent)]
    #[diagnostic(code(hakurei::system::op))]
    Op(#[from] OpError),

    /// Accumulated revert failures
    #[error(transparent)]
    #[diagnostic(code(hakurei::system::revert))]
    Revert(#[from] RevertError),

    /// Container start failure
    #[error(transparent)]
    #[diagnostic(code(hakurei::container::start))]
    Start(#[from] StartError),

    /// Cross-process state framing failure
    #[error(transparent)]
    #[diagnostic(code(hakurei::proto))]
    Proto(#[from] ProtoError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(hakurei::io))]
    Io(#[from] std::io::Error),
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The reason a configuration was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// A required field or nested record is missing.
    Null,
    /// Identity outside `[1, 9999]`.
    IdentityBounds,
    /// An environment variable name contains `=` or NUL.
    Environ,
    /// The cgroup slice escapes the cgroup root after cleaning.
    CgroupPath,
    /// Any other invalid value (negative pid limit, malformed path).
    Invalid,
}

/// A validation failure, framed with the step it was raised from.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
#[error("{step}: {msg}")]
#[diagnostic(code(hakurei::config::validate))]
pub struct ConfigError {
    /// Stage label identifying which part of the pipeline failed.
    pub step: &'static str,
    /// User-facing description.
    pub msg: String,
    /// Machine-checkable reason.
    pub kind: ConfigErrorKind,
}

impl ConfigError {
    pub(crate) fn new(step: &'static str, kind: ConfigErrorKind, msg: impl Into<String>) -> Self {
        Self {
            step,
            msg: msg.into(),
            kind,
        }
    }
}

/// A failure applying or reverting a single transaction op.
///
/// `revert` distinguishes rollback failures so they can be joined without
/// masking the commit error that triggered the rollback.
#[derive(Debug, Error, Diagnostic)]
#[error("op {op}{}: {source}", if *.revert { " (revert)" } else { "" })]
#[diagnostic(code(hakurei::system::op))]
pub struct OpError {
    /// Tag of the failing op, e.g. `"xhost"`, `"cgroup"`, `"mkdir"`.
    pub op: &'static str,
    /// Whether the failure was raised while rolling back.
    pub revert: bool,
    /// Underlying cause.
    #[source]
    pub source: std::io::Error,
}

impl OpError {
    pub(crate) fn new(op: &'static str, source: std::io::Error) -> Self {
        Self {
            op,
            revert: false,
            source,
        }
    }

    pub(crate) fn reverting(op: &'static str, source: std::io::Error) -> Self {
        Self {
            op,
            revert: true,
            source,
        }
    }

    pub(crate) fn message(op: &'static str, msg: impl Into<String>) -> Self {
        Self::new(op, std::io::Error::other(msg.into()))
    }
}

/// Every op failure observed during a revert, in encounter order.
#[derive(Debug, Error, Diagnostic)]
#[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n"))]
#[diagnostic(code(hakurei::system::revert))]
pub struct RevertError(pub Vec<OpError>);

/// A container startup failure.
///
/// `fatal` suggests whole-program abort; `passthrough` means the underlying
/// message is already user-facing and needs no "cannot" framing.
#[derive(Debug, Error, Diagnostic)]
#[error("{step}: {source}")]
#[diagnostic(code(hakurei::container::start))]
pub struct StartError {
    /// Whether this failure should abort the entire program.
    pub fatal: bool,
    /// The part of container setup this error is returned from.
    pub step: &'static str,
    /// Whether the error originated from the start call itself.
    pub origin: bool,
    /// Whether the message of `source` is already user-facing.
    pub passthrough: bool,
    /// Underlying cause.
    #[source]
    pub source: std::io::Error,
}

impl StartError {
    pub(crate) fn new(fatal: bool, step: &'static str, source: std::io::Error) -> Self {
        Self {
            fatal,
            step,
            origin: false,
            passthrough: false,
            source,
        }
    }

    pub(crate) fn origin(step: &'static str, source: std::io::Error) -> Self {
        Self {
            fatal: false,
            step,
            origin: true,
            passthrough: false,
            source,
        }
    }

    pub(crate) fn passthrough(fatal: bool, step: &'static str, source: std::io::Error) -> Self {
        Self {
            fatal,
            step,
            origin: false,
            passthrough: true,
            source,
        }
    }

    /// Returns a user-facing single-line message.
    #[must_use]
    pub fn user_message(&self) -> String {
        if self.passthrough {
            format!("cannot {}", self.source)
        } else if self.origin {
            self.step.to_owned()
        } else {
            format!("cannot {}: {}", self.step, self.source)
        }
    }
}

/// A failure decoding or encoding the cross-process state frame.
#[derive(Debug, Error, Diagnostic)]
pub enum ProtoError {
    /// The frame carries an unknown version byte.
    #[error("unsupported state frame version {0}")]
    #[diagnostic(code(hakurei::proto::version))]
    Version(u8),

    /// The frame length prefix exceeds the sanity bound.
    #[error("state frame length {0} out of bounds")]
    #[diagnostic(code(hakurei::proto::length))]
    Length(u32),

    /// The frame body is not valid JSON for the expected shape.
    #[error("malformed state frame: {0}")]
    #[diagnostic(code(hakurei::proto::body))]
    Body(#[from] serde_json::Error),

    /// The pipe failed or the write deadline expired.
    #[error("state pipe: {0}")]
    #[diagnostic(code(hakurei::proto::pipe))]
    Pipe(#[from] std::io::Error),
}

/// Errors related to host requirements probing.
#[derive(Error, Debug, Diagnostic)]
pub enum RequirementsError {
    /// Kernel version too old
    #[error("kernel version {found} is below minimum required {required}")]
    #[diagnostic(
        code(hakurei::system::kernel_version),
        help("Landlock ABI v6 with socket scoping requires kernel 6.7 or later")
    )]
    KernelTooOld { found: String, required: String },

    /// Landlock not available or ABI too old
    #[error("Landlock ABI version {found} is below minimum required {required}")]
    #[diagnostic(
        code(hakurei::system::landlock),
        help("kernel 6.7+ provides Landlock ABI v6 with abstract socket scoping")
    )]
    LandlockAbiTooOld { found: i32, required: i32 },

    /// Landlock not available at all
    #[error("Landlock is not available on this system")]
    #[diagnostic(
        code(hakurei::system::landlock_unavailable),
        help("ensure the kernel has CONFIG_SECURITY_LANDLOCK=y")
    )]
    LandlockUnavailable,

    /// cgroups v2 not available
    #[error("cgroup v2 is not available")]
    #[diagnostic(
        code(hakurei::system::cgroups),
        help("mount the unified hierarchy with: mount -t cgroup2 none /sys/fs/cgroup")
    )]
    CgroupsV2Unavailable,

    /// Unprivileged user namespaces not enabled
    #[error("unprivileged user namespaces are not enabled")]
    #[diagnostic(
        code(hakurei::system::userns),
        help("enable with: sysctl -w kernel.unprivileged_userns_clone=1")
    )]
    UserNamespacesDisabled,

    /// Failed to read system information
    #[error("failed to read system information: {context}")]
    #[diagnostic(code(hakurei::system::read_failed))]
    ReadFailed {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_error_display() {
        let e = OpError::message("xhost", "connection refused");
        assert_eq!(e.to_string(), "op xhost: connection refused");

        let e = OpError::reverting("mkdir", std::io::Error::other("busy"));
        assert_eq!(e.to_string(), "op mkdir (revert): busy");
    }

    #[test]
    fn test_revert_error_joins() {
        let joined = RevertError(vec![
            OpError::reverting("xhost", std::io::Error::other("a")),
            OpError::reverting("mkdir", std::io::Error::other("b")),
        ]);
        let text = joined.to_string();
        assert!(text.contains("op xhost (revert): a"));
        assert!(text.contains("op mkdir (revert): b"));
    }

    #[test]
    fn test_start_error_message() {
        let e = StartError::new(
            false,
            "open cgroup directory",
            std::io::Error::other("permission denied"),
        );
        assert_eq!(
            e.user_message(),
            "cannot open cgroup directory: permission denied"
        );

        let e = StartError::origin(
            "kernel version too old for abstract socket scoping",
            std::io::Error::from_raw_os_error(libc::ENOSYS),
        );
        assert_eq!(
            e.user_message(),
            "kernel version too old for abstract socket scoping"
        );
    }
}
