//! Username/password authenticator shared by the SOCKS and HTTP inbounds

use std::collections::HashMap;

/// Credential store built from `user:pass` config entries.
///
/// An empty store means no authentication is required.
#[derive(Debug, Clone, Default)]
pub struct Authenticator {
    users: HashMap<String, String>,
}

impl Authenticator {
    /// Build from `user:pass` lines; malformed entries are skipped.
    pub fn new(entries: &[String]) -> Self {
        let users = entries
            .iter()
            .filter_map(|line| {
                line.split_once(':')
                    .map(|(u, p)| (u.to_string(), p.to_string()))
            })
            .collect();
        Self { users }
    }

    pub fn enabled(&self) -> bool {
        !self.users.is_empty()
    }

    pub fn verify(&self, user: &str, pass: &str) -> bool {
        self.users.get(user).map(String::as_str) == Some(pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_store_disabled() {
        let auth = Authenticator::new(&[]);
        assert!(!auth.enabled());
    }

    #[test]
    fn test_verify() {
        let auth = Authenticator::new(&["alice:secret".into(), "broken".into()]);
        assert!(auth.enabled());
        assert!(auth.verify("alice", "secret"));
        assert!(!auth.verify("alice", "wrong"));
        assert!(!auth.verify("bob", "secret"));
        assert!(!auth.verify("broken", ""));
    }
}
