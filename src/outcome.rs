//! Results of operations that may hand control to another page.

use url::Url;

/// Why a redirecting operation did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The current URL still carries `state`/`code` from a callback.
    CallbackInProgress,
    /// Tokens are already stored.
    AlreadyAuthenticated,
    /// There is no session to end.
    NotAuthenticated,
}

/// Outcome of `login` and `logout`.
///
/// `Navigated` is terminal: the host has been sent elsewhere and the client
/// instance should not be used further.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectOutcome {
    Navigated(Url),
    Skipped(SkipReason),
}

impl RedirectOutcome {
    pub fn navigated(&self) -> Option<&Url> {
        match self {
            Self::Navigated(url) => Some(url),
            Self::Skipped(_) => None,
        }
    }
}

/// Outcome of `init`.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    /// Background work is running and events are live.
    Ready,
    /// A login callback was consumed and the host was sent back to the
    /// original redirect URI. Terminal.
    Navigated(Url),
}
