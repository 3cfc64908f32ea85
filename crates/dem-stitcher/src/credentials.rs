//! Netrc credentials for hosts that require a login.

use crate::{Result, StitchError};
use std::env;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Login and password for one host.
#[derive(Clone, PartialEq, Eq)]
pub struct NetrcEntry {
    /// User name.
    pub login: String,
    /// Password.
    pub password: String,
}

impl std::fmt::Debug for NetrcEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetrcEntry")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Find the entry for `host` in netrc `contents`, falling back to a `default` entry.
pub fn find_netrc_entry(contents: &str, host: &str) -> Option<NetrcEntry> {
    let mut tokens = contents.split_whitespace();
    let mut matched: Option<NetrcEntry> = None;
    let mut fallback: Option<NetrcEntry> = None;
    // Entry currently being read, and whether it is for `host` (true) or the default (false).
    let mut current: Option<(bool, String, String)> = None;

    let finish = |entry: Option<(bool, String, String)>,
                  matched: &mut Option<NetrcEntry>,
                  fallback: &mut Option<NetrcEntry>| {
        if let Some((is_host, login, password)) = entry {
            let slot = if is_host { matched } else { fallback };
            if slot.is_none() && !login.is_empty() {
                *slot = Some(NetrcEntry { login, password });
            }
        }
    };

    while let Some(token) = tokens.next() {
        match token {
            "machine" => {
                finish(current.take(), &mut matched, &mut fallback);
                let name = tokens.next().unwrap_or_default();
                if name == host {
                    current = Some((true, String::new(), String::new()));
                }
            }
            "default" => {
                finish(current.take(), &mut matched, &mut fallback);
                current = Some((false, String::new(), String::new()));
            }
            "login" => {
                let value = tokens.next().unwrap_or_default();
                if let Some((_, login, _)) = current.as_mut() {
                    *login = value.to_string();
                }
            }
            "password" => {
                let value = tokens.next().unwrap_or_default();
                if let Some((_, _, password)) = current.as_mut() {
                    *password = value.to_string();
                }
            }
            "account" | "macdef" => {
                tokens.next();
            }
            _ => {}
        }
    }
    finish(current, &mut matched, &mut fallback);
    matched.or(fallback)
}

/// Location of the user's netrc file: `$NETRC`, else `$HOME/.netrc`.
pub fn netrc_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os("NETRC") {
        return Some(PathBuf::from(path));
    }
    env::var_os("HOME").map(|home| PathBuf::from(home).join(".netrc"))
}

/// Credentials for `host`, or [`StitchError::MissingCredentials`] if there are none.
pub fn ensure_credentials(host: &str) -> Result<NetrcEntry> {
    let path = netrc_path();
    let display = path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "~/.netrc".to_string());
    let missing = || StitchError::MissingCredentials {
        host: host.to_string(),
        path: display.clone(),
    };

    let contents = match path {
        Some(path) => fs::read_to_string(path).map_err(|_| missing())?,
        None => return Err(missing()),
    };
    let entry = find_netrc_entry(&contents, host).ok_or_else(missing)?;
    debug!(host, login = %entry.login, "Found netrc credentials");
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_machine_entry() {
        let netrc = "machine example.com login a password b\n\
                     machine urs.earthdata.nasa.gov\n  login user\n  password secret\n";
        let entry = find_netrc_entry(netrc, "urs.earthdata.nasa.gov").unwrap();
        assert_eq!(entry.login, "user");
        assert_eq!(entry.password, "secret");
    }

    #[test]
    fn test_default_entry_is_fallback() {
        let netrc = "machine other.host login a password b\ndefault login anon password guest";
        let entry = find_netrc_entry(netrc, "urs.earthdata.nasa.gov").unwrap();
        assert_eq!(entry.login, "anon");

        let netrc = "default login anon password guest\nmachine urs.earthdata.nasa.gov login me password pw";
        assert_eq!(find_netrc_entry(netrc, "urs.earthdata.nasa.gov").unwrap().login, "me");
    }

    #[test]
    fn test_missing_entry() {
        assert!(find_netrc_entry("machine other.host login a password b", "urs.earthdata.nasa.gov").is_none());
        assert!(find_netrc_entry("", "urs.earthdata.nasa.gov").is_none());
    }

    #[test]
    fn test_password_is_redacted() {
        let entry = NetrcEntry {
            login: "user".to_string(),
            password: "secret".to_string(),
        };
        assert!(!format!("{:?}", entry).contains("secret"));
    }
}
