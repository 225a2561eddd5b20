//! Parses a `backup`/`restore` destination argument into either a remote
//! SFTP address or a local filesystem path.
//!
//! The grammar (spec.md §4.7) is intentionally crude rather than a general
//! URI parser: `s` is a remote address iff it contains `'@'`, the portion
//! after the first `'@'` contains `':'`, and the portion before the first
//! `'@'` contains no `'/'`. That last condition is what keeps a path like
//! `./a@b.com:/hello/` — which has an `'@'` and a `':'` but a `'/'` before
//! the `'@'` — classified as local.

/// A parsed `user@host:/path` destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddress {
    pub user: String,
    pub host: String,
    pub path: String,
    /// Always `None` from [`parse`]: the grammar has no port syntax. Kept
    /// so [`crate::transport::sftp::SftpTransport`] has somewhere to put a
    /// non-default port if one is ever threaded through.
    pub port: Option<u16>,
}

/// The result of parsing a destination argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Remote(RemoteAddress),
    Local(String),
}

/// Parse `s` per the grammar above. Never fails: anything that doesn't look
/// like a remote address is a local path, verbatim.
pub fn parse(s: &str) -> Destination {
    if let Some(at) = s.find('@') {
        let (before, after_at) = s.split_at(at);
        let after_at = &after_at[1..]; // drop the '@' itself
        if !before.contains('/') {
            if let Some(colon) = after_at.find(':') {
                let host = after_at[..colon].trim();
                let path = after_at[colon + 1..].trim();
                return Destination::Remote(RemoteAddress {
                    user: before.trim().to_string(),
                    host: host.to_string(),
                    path: path.to_string(),
                    port: None,
                });
            }
        }
    }
    Destination::Local(s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_address_parses_user_host_path() {
        match parse("alice@srv:/d") {
            Destination::Remote(addr) => {
                assert_eq!(addr.user, "alice");
                assert_eq!(addr.host, "srv");
                assert_eq!(addr.path, "/d");
            }
            Destination::Local(_) => panic!("expected a remote address"),
        }
    }

    #[test]
    fn absolute_local_path_is_local() {
        assert_eq!(parse("/var/data"), Destination::Local("/var/data".to_string()));
    }

    #[test]
    fn slash_before_at_forces_local() {
        // Contains '@' and ':', but the '/' before '@' disqualifies it.
        assert_eq!(
            parse("./a@b.com:/hello/"),
            Destination::Local("./a@b.com:/hello/".to_string())
        );
    }

    #[test]
    fn at_without_colon_after_is_local() {
        assert_eq!(
            parse("user@hostonly"),
            Destination::Local("user@hostonly".to_string())
        );
    }

    #[test]
    fn surrounding_whitespace_is_trimmed() {
        match parse(" bob @ host : /x ") {
            Destination::Remote(addr) => {
                assert_eq!(addr.user, "bob");
                assert_eq!(addr.host, "host");
                assert_eq!(addr.path, "/x");
            }
            Destination::Local(_) => panic!("expected a remote address"),
        }
    }
}
