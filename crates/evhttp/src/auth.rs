//! Credential verification capability.
//!
//! The server only ever asks one question: does this username/password pair
//! log in (or register) successfully? The answer comes from a
//! [`UserVerifier`] handed to the server at construction time.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use tracing::debug;

/// `verify(username, password, is_login) -> bool`
///
/// With `is_login == false` the call is a registration attempt.
pub trait UserVerifier: Send + Sync {
    fn verify(&self, username: &str, password: &str, is_login: bool) -> bool;
}

impl<F> UserVerifier for F
where
    F: Fn(&str, &str, bool) -> bool + Send + Sync,
{
    fn verify(&self, username: &str, password: &str, is_login: bool) -> bool {
        self(username, password, is_login)
    }
}

/// In-process user table.
///
/// - Empty username or password never verifies.
/// - Login succeeds iff the stored password matches.
/// - Registration succeeds iff the name is unused, and records the user.
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<String, String>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users<I, U, P>(users: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: Into<String>,
    {
        let users = users
            .into_iter()
            .map(|(u, p)| (u.into(), p.into()))
            .collect();
        Self { users: Mutex::new(users) }
    }

    /// Load `user:password` lines. Blank lines and `#` comments are skipped.
    pub fn load(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        let users = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once(':'))
            .map(|(u, p)| (u.trim().to_string(), p.trim().to_string()));
        Ok(Self::with_users(users))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UserVerifier for MemoryUserStore {
    fn verify(&self, username: &str, password: &str, is_login: bool) -> bool {
        if username.is_empty() || password.is_empty() {
            return false;
        }
        let mut users = self.lock();
        if is_login {
            let ok = users.get(username).is_some_and(|stored| stored == password);
            debug!(username, ok, "login");
            ok
        } else if users.contains_key(username) {
            debug!(username, "register: name already used");
            false
        } else {
            users.insert(username.to_string(), password.to_string());
            debug!(username, "register");
            true
        }
    }
}
