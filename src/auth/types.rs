//! Authentication Types

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::AccessError;

/// What a successful handshake entitles the client to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessGrant {
    /// Subscribe to the relayed stream
    Stream,
    /// Receive the sourcetable, then disconnect
    SourceTable,
}

/// Credentials a client must present
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Compare against presented credentials without short-circuiting
    pub fn matches(&self, username: &str, password: &str) -> bool {
        let user_ok = constant_time_eq(self.username.as_bytes(), username.as_bytes());
        let pass_ok = constant_time_eq(self.password.as_bytes(), password.as_bytes());
        user_ok & pass_ok
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"****")
            .finish()
    }
}

/// Byte comparison whose running time depends only on the input lengths
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}

/// Handshake outcome counters
#[derive(Debug, Default)]
pub struct AuthStats {
    granted: AtomicU64,
    sourcetables: AtomicU64,
    unauthorized: AtomicU64,
    unknown_mountpoint: AtomicU64,
    bad_request: AtomicU64,
    unavailable: AtomicU64,
}

/// Point-in-time copy of [`AuthStats`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuthStatsSnapshot {
    pub granted: u64,
    pub sourcetables: u64,
    pub unauthorized: u64,
    pub unknown_mountpoint: u64,
    pub bad_request: u64,
    pub unavailable: u64,
}

impl AuthStats {
    pub fn record_grant(&self, grant: AccessGrant) {
        let counter = match grant {
            AccessGrant::Stream => &self.granted,
            AccessGrant::SourceTable => &self.sourcetables,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self, error: &AccessError) {
        let counter = match error {
            AccessError::Unauthorized => &self.unauthorized,
            AccessError::UnknownMountpoint(_) => &self.unknown_mountpoint,
            AccessError::BadRequest(_) => &self.bad_request,
            AccessError::Unavailable => &self.unavailable,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AuthStatsSnapshot {
        AuthStatsSnapshot {
            granted: self.granted.load(Ordering::Relaxed),
            sourcetables: self.sourcetables.load(Ordering::Relaxed),
            unauthorized: self.unauthorized.load(Ordering::Relaxed),
            unknown_mountpoint: self.unknown_mountpoint.load(Ordering::Relaxed),
            bad_request: self.bad_request.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
        }
    }
}
