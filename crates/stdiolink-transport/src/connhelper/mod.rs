//! Connection helpers for daemon URLs that need a custom transport
//!
//! A connection helper wraps everything the client layer above needs
//! to reach a daemon that is not directly dialable: a [`Dialer`] that
//! produces the stream, and the dummy host URL to use for requests
//! sent over it.

pub mod ssh;

use crate::error::{Result, TransportError};
use crate::traits::Dialer;
use url::Url;

/// A custom stream provider for one daemon URL
pub struct ConnectionHelper {
    /// Produces the connection when invoked
    pub dialer: Dialer,
    /// Dummy URL for requests carried over the dialed stream
    pub host: String,
}

impl std::fmt::Debug for ConnectionHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHelper")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

/// Return the connection helper for `daemon_url`, if one is registered
/// for its scheme
///
/// Returns `Ok(None)` for any well-formed URL with an unrecognized
/// scheme: that means "use the default transport" and must never be
/// treated as a failure. New schemes are added here, not in callers.
///
/// # Errors
///
/// Returns [`TransportError::Parse`] only for a malformed URL, or when
/// a recognized scheme's URL violates that scheme's rules.
pub fn get_connection_helper(daemon_url: &str) -> Result<Option<ConnectionHelper>> {
    let url = Url::parse(daemon_url)
        .map_err(|e| TransportError::Parse(format!("{daemon_url}: {e}")))?;
    match url.scheme() {
        "ssh" => ssh::new_connection_helper(daemon_url).map(Some),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_scheme_returns_a_helper() {
        let helper = get_connection_helper("ssh://me@server01").unwrap();
        assert!(helper.is_some());
        assert_eq!(helper.unwrap().host, "http://daemon");
    }

    #[test]
    fn test_other_schemes_are_not_an_error() {
        for url in ["tcp://127.0.0.1:2375", "unix:///var/run/daemon.sock", "npipe:////./pipe/daemon"] {
            let helper = get_connection_helper(url).unwrap();
            assert!(helper.is_none(), "{url} should route to the default transport");
        }
    }

    #[test]
    fn test_malformed_url_is_a_parse_error() {
        let err = get_connection_helper("not a url at all").unwrap_err();
        assert!(matches!(err, TransportError::Parse(_)));
    }

    #[test]
    fn test_bad_ssh_url_propagates_the_parse_error() {
        let err = get_connection_helper("ssh://:secret@host").unwrap_err();
        assert!(matches!(err, TransportError::Parse(_)));
    }
}
