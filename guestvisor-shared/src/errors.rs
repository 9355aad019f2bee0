//! Error taxonomy for guest orchestration.

use std::time::Duration;

/// Result alias used by every guestvisor crate.
pub type GuestvisorResult<T> = Result<T, GuestvisorError>;

#[derive(Debug, thiserror::Error)]
pub enum GuestvisorError {
    /// Illegal lifecycle transition.
    #[error("cannot forward status: {from} => {to}")]
    ForwardStatus { from: String, to: String },

    /// A queued task was discarded because an earlier task for the same guest failed.
    #[error("serialized task aborted")]
    SerializedTaskAborted,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    /// The per-guest host lock is held by someone else.
    #[error("{0} has been locked")]
    Locked(String),

    #[error("domain not exists: {0}")]
    DomainNotExists(String),

    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    /// Optimistic concurrency failure on a metadata key.
    #[error("key {0} has a bad version")]
    BadVersion(String),

    #[error("key {0} already exists")]
    KeyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("too many volumes, at most {0}")]
    TooManyVolumes(usize),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),

    /// An error annotated with the operation that produced it.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<GuestvisorError>,
    },
}

impl GuestvisorError {
    /// Wrap this error with operation context.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping every `Context` layer.
    pub fn root(&self) -> &GuestvisorError {
        let mut err = self;
        while let Self::Context { source, .. } = err {
            err = source;
        }
        err
    }

    pub fn is_domain_not_exists(&self) -> bool {
        matches!(self.root(), Self::DomainNotExists(_))
    }

    pub fn is_locked(&self) -> bool {
        matches!(self.root(), Self::Locked(_))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.root(), Self::SerializedTaskAborted)
    }

    pub fn is_forward_status(&self) -> bool {
        matches!(self.root(), Self::ForwardStatus { .. })
    }

    pub fn is_bad_version(&self) -> bool {
        matches!(self.root(), Self::BadVersion(_))
    }
}

/// Attach context to errors in a `GuestvisorResult`.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> GuestvisorResult<T>;

    fn with_context<C, F>(self, f: F) -> GuestvisorResult<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> ResultExt<T> for GuestvisorResult<T> {
    fn context(self, context: impl Into<String>) -> GuestvisorResult<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<C, F>(self, f: F) -> GuestvisorResult<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_chain_keeps_root() {
        let err: GuestvisorResult<()> = Err(GuestvisorError::DomainNotExists("g1".into()));
        let err = err.context("shutdown").context("destroy").unwrap_err();

        assert!(err.is_domain_not_exists());
        assert_eq!(
            err.to_string(),
            "destroy: shutdown: domain not exists: g1"
        );
    }

    #[test]
    fn test_forward_status_message() {
        let err = GuestvisorError::ForwardStatus {
            from: "stopped".into(),
            to: "running".into(),
        };
        assert_eq!(err.to_string(), "cannot forward status: stopped => running");
        assert!(err.is_forward_status());
        assert!(!err.is_locked());
    }
}
