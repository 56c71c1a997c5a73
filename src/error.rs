use thiserror::Error;

/// Error type for every fallible OmniQ operation.
///
/// Variants line up with the error-kind taxonomy in the design docs:
/// configuration failures are fatal at [`crate::Client::create`][create],
/// validation failures are fatal at the call site, protocol/script errors
/// surface a malformed or rejected server reply, and [`Error::Transport`]
/// wraps the underlying store driver.
///
/// [create]: crate::client::Client::create
#[derive(Debug, Error)]
pub enum Error {
    /// A fatal problem discovered while building a [`Client`](crate::client::Client):
    /// a missing scripts directory, a missing script file, or an invalid
    /// child-counter key.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A caller-supplied argument violates a documented precondition:
    /// a non-object/array publish payload, an empty child id, or a batch
    /// larger than 100 ids.
    #[error("validation error: {0}")]
    Validation(String),

    /// The store returned a reply that does not match the shape this
    /// operation expects.
    #[error("protocol error: unexpected reply for {op}: {reply}")]
    Protocol {
        /// Name of the operation whose reply was malformed.
        op: &'static str,
        /// Debug-formatted raw reply, for diagnostics.
        reply: String,
    },

    /// A script replied with an explicit `["ERR", reason, ...]` discriminant.
    #[error("{op} failed: {reason}")]
    Script {
        /// Name of the operation that was rejected.
        op: &'static str,
        /// Reason string reported by the script, e.g. `NOT_ACTIVE`,
        /// `TOKEN_MISMATCH`, `BAD_STATE`.
        reason: String,
    },

    /// Failure from the underlying key-value store driver.
    #[error(transparent)]
    Transport(#[from] redis::RedisError),
}

impl Error {
    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub(crate) fn protocol(op: &'static str, reply: &redis::Value) -> Self {
        Error::Protocol {
            op,
            reply: format!("{reply:?}"),
        }
    }

    pub(crate) fn script(op: &'static str, reason: impl Into<String>) -> Self {
        Error::Script {
            op,
            reason: reason.into(),
        }
    }

    /// True when this is a [`Error::Script`] whose reason contains `NOT_ACTIVE`
    /// or `TOKEN_MISMATCH` (case-insensitive) — the two substrings the
    /// heartbeater and runloop treat as terminal lease loss.
    pub(crate) fn is_lease_loss(&self) -> bool {
        match self {
            Error::Script { reason, .. } => contains_lease_loss_marker(reason),
            _ => false,
        }
    }

    /// True when this error (from any source) looks like a `NOSCRIPT` reply,
    /// by case-insensitive substring match per spec.
    pub(crate) fn is_noscript(&self) -> bool {
        match self {
            Error::Transport(e) => e.to_string().to_uppercase().contains("NOSCRIPT"),
            Error::Script { reason, .. } => reason.to_uppercase().contains("NOSCRIPT"),
            _ => false,
        }
    }
}

/// Case-insensitive check for the two lease-loss markers scripts use.
pub(crate) fn contains_lease_loss_marker(s: &str) -> bool {
    let upper = s.to_uppercase();
    upper.contains("NOT_ACTIVE") || upper.contains("TOKEN_MISMATCH")
}

pub type Result<T> = std::result::Result<T, Error>;
