//! Credentials for the archive host.
//!
//! Credentials are resolved once, up front, and passed explicitly to the
//! backend; nothing downstream reads the netrc file or the environment.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Login host of the Earthdata single sign-on used by the ASF archive.
pub const EARTHDATA_HOST: &str = "urs.earthdata.nasa.gov";

/// Username and password for one host.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Host the credentials are meant for; they are also sent to the
    /// archive's own host.
    pub host: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("host", &self.host)
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            host: EARTHDATA_HOST.to_string(),
        }
    }

    /// Look `host` up in a netrc file. `Ok(None)` when the file has no entry
    /// for it and no `default` entry.
    pub fn from_netrc(path: &Path, host: &str) -> Result<Option<Self>> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Ok(parse_netrc(&text, host).map(|(username, password)| Self {
            username,
            password,
            host: host.to_string(),
        }))
    }
}

/// Resolve credentials from explicit values or the user's netrc file.
///
/// Both or neither of `username` / `password` must be given. When neither is
/// given the netrc file (`$NETRC`, else `~/.netrc`) is consulted; a missing
/// file or entry yields `None` and the run continues unauthenticated.
pub fn resolve_credentials(
    username: Option<String>,
    password: Option<String>,
    netrc: Option<PathBuf>,
) -> Result<Option<Credentials>> {
    match (username, password) {
        (Some(user), Some(pwd)) => Ok(Some(Credentials::new(user, pwd))),
        (None, None) => {
            let Some(path) = netrc.or_else(default_netrc_path) else {
                warn!("no home directory, continuing without credentials");
                return Ok(None);
            };
            if !path.is_file() {
                warn!(path = %path.display(), "netrc file not found, continuing without credentials");
                return Ok(None);
            }
            let creds = Credentials::from_netrc(&path, EARTHDATA_HOST)?;
            match &creds {
                Some(c) => debug!(user = %c.username, "credentials loaded from netrc"),
                None => warn!(
                    path = %path.display(),
                    host = EARTHDATA_HOST,
                    "no netrc entry for host, continuing without credentials"
                ),
            }
            Ok(creds)
        }
        _ => Err(Error::auth(
            EARTHDATA_HOST,
            "both username and password must be provided",
        )),
    }
}

fn default_netrc_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("NETRC") {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".netrc"))
}

/// Minimal netrc reader: `machine`, `default`, `login`, `password`, `account`
/// and `macdef` (whose body is skipped up to the next blank line).
fn parse_netrc(text: &str, host: &str) -> Option<(String, String)> {
    #[derive(PartialEq)]
    enum Scope {
        Matching,
        Other,
        Default,
    }

    let mut tokens: Vec<&str> = Vec::new();
    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        for word in line.split_whitespace() {
            if word.starts_with('#') {
                break;
            }
            if word == "macdef" {
                for body in lines.by_ref() {
                    if body.trim().is_empty() {
                        break;
                    }
                }
                break;
            }
            tokens.push(word);
        }
    }

    let mut scope = Scope::Other;
    let mut found: Option<(Option<String>, Option<String>)> = None;
    let mut default: Option<(Option<String>, Option<String>)> = None;
    let mut iter = tokens.into_iter();

    while let Some(token) = iter.next() {
        match token {
            "machine" => {
                let name = iter.next().unwrap_or_default();
                scope = if name.eq_ignore_ascii_case(host) && found.is_none() {
                    found = Some((None, None));
                    Scope::Matching
                } else {
                    Scope::Other
                };
            }
            "default" => {
                scope = Scope::Default;
                default.get_or_insert((None, None));
            }
            "login" | "password" => {
                let value = iter.next().map(str::to_string);
                let entry = match scope {
                    Scope::Matching => found.as_mut(),
                    Scope::Default => default.as_mut(),
                    Scope::Other => None,
                };
                if let Some((login, password)) = entry {
                    if token == "login" {
                        *login = value;
                    } else {
                        *password = value;
                    }
                }
            }
            "account" => {
                iter.next();
            }
            _ => {}
        }
    }

    let (login, password) = found.or(default)?;
    Some((login?, password.unwrap_or_default()))
}
