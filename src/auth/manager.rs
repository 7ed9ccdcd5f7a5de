//! Authentication Manager

use super::{AccessGrant, AuthStats, AuthStatsSnapshot, Credentials};
use crate::config::Config;
use crate::error::AccessError;
use crate::protocol::{decode_basic_credentials, NtripRequest};
use std::net::SocketAddr;
use tracing::{debug, warn};

/// Checks downstream handshakes against the configured mountpoint and credentials
pub struct AuthManager {
    mountpoint: String,
    credentials: Option<Credentials>,
    stats: AuthStats,
}

impl AuthManager {
    /// Create a new authentication manager
    pub fn new(config: &Config) -> Self {
        let credentials = config
            .client_auth_required()
            .then(|| Credentials::new(&config.server.username, &config.server.password));

        Self {
            mountpoint: config.accepted_mountpoint().to_string(),
            credentials,
            stats: AuthStats::default(),
        }
    }

    /// Mountpoint clients must request
    pub fn mountpoint(&self) -> &str {
        &self.mountpoint
    }

    pub fn auth_required(&self) -> bool {
        self.credentials.is_some()
    }

    /// Decide what a parsed request is allowed to do
    pub fn authorize(&self, request: &NtripRequest, peer: SocketAddr) -> Result<AccessGrant, AccessError> {
        let result = self.check(request);
        match &result {
            Ok(grant) => {
                debug!("Access granted to {}: {:?}", peer, grant);
                self.stats.record_grant(*grant);
            }
            Err(e) => {
                warn!("Rejected client {}: {}", peer, e);
                self.stats.record_rejection(e);
            }
        }
        result
    }

    /// Count a rejection that happened before authorization (parse errors, client limit)
    pub fn record_rejection(&self, error: &AccessError) {
        self.stats.record_rejection(error);
    }

    fn check(&self, request: &NtripRequest) -> Result<AccessGrant, AccessError> {
        let requested = request.mountpoint();
        if requested.is_empty() {
            return Ok(AccessGrant::SourceTable);
        }
        if requested != self.mountpoint {
            return Err(AccessError::UnknownMountpoint(requested.to_string()));
        }

        if let Some(expected) = &self.credentials {
            let (username, password) = request
                .authorization()
                .and_then(decode_basic_credentials)
                .ok_or(AccessError::Unauthorized)?;
            if !expected.matches(&username, &password) {
                return Err(AccessError::Unauthorized);
            }
        }

        Ok(AccessGrant::Stream)
    }

    pub fn stats(&self) -> AuthStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{basic_credentials, Head};
    use bytes::Bytes;

    fn request(path: &str, authorization: Option<&str>) -> NtripRequest {
        let mut text = format!("GET {} HTTP/1.1\r\nNtrip-Version: Ntrip/2.0", path);
        if let Some(value) = authorization {
            text.push_str(&format!("\r\nAuthorization: {}", value));
        }
        NtripRequest::parse(&Head {
            text,
            leftover: Bytes::new(),
        })
        .unwrap()
    }

    fn manager(username: &str, password: &str) -> AuthManager {
        let mut config = Config::default();
        config.upstream.mountpoint = "RTCM4".to_string();
        config.server.username = username.to_string();
        config.server.password = password.to_string();
        AuthManager::new(&config)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_open_caster_accepts_without_credentials() {
        let auth = manager("", "");
        assert!(!auth.auth_required());
        assert_eq!(auth.authorize(&request("/RTCM4", None), peer()), Ok(AccessGrant::Stream));
    }

    #[test]
    fn test_credentials_required() {
        let auth = manager("local", "pw");
        let good = basic_credentials("local", "pw");
        let bad = basic_credentials("local", "nope");

        assert_eq!(auth.authorize(&request("/RTCM4", Some(&good)), peer()), Ok(AccessGrant::Stream));
        assert_eq!(
            auth.authorize(&request("/RTCM4", Some(&bad)), peer()),
            Err(AccessError::Unauthorized)
        );
        assert_eq!(
            auth.authorize(&request("/RTCM4", None), peer()),
            Err(AccessError::Unauthorized)
        );
        assert_eq!(
            auth.authorize(&request("/RTCM4", Some("Basic ???")), peer()),
            Err(AccessError::Unauthorized)
        );

        let stats = auth.stats();
        assert_eq!(stats.granted, 1);
        assert_eq!(stats.unauthorized, 3);
    }

    #[test]
    fn test_unknown_mountpoint_is_checked_first() {
        let auth = manager("local", "pw");
        assert_eq!(
            auth.authorize(&request("/OTHER", None), peer()),
            Err(AccessError::UnknownMountpoint("OTHER".to_string()))
        );
        assert_eq!(auth.stats().unknown_mountpoint, 1);
    }

    #[test]
    fn test_root_path_gets_sourcetable() {
        let auth = manager("local", "pw");
        assert_eq!(auth.authorize(&request("/", None), peer()), Ok(AccessGrant::SourceTable));
        assert_eq!(auth.stats().sourcetables, 1);
    }
}
