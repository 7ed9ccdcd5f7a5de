//! NTRIP Protocol Types

use bytes::Bytes;

use crate::error::AccessError;
use crate::protocol::constants::*;

/// Protocol revision a client speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtripVersion {
    V1,
    V2,
}

/// A request or response head, split from whatever followed it
#[derive(Debug, Clone)]
pub struct Head {
    /// Text up to (not including) the blank-line terminator
    pub text: String,
    /// Bytes read past the terminator
    pub leftover: Bytes,
}

impl Head {
    /// First line of the head
    pub fn first_line(&self) -> &str {
        self.text.lines().next().unwrap_or("").trim_end_matches('\r')
    }

    /// Header lines after the first line
    pub fn header_lines(&self) -> impl Iterator<Item = &str> {
        self.text
            .lines()
            .skip(1)
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
    }
}

/// A parsed client request
#[derive(Debug, Clone, PartialEq)]
pub struct NtripRequest {
    pub method: String,
    pub path: String,
    pub protocol: String,
    pub headers: Vec<(String, String)>,
}

impl NtripRequest {
    /// Parse a request head
    pub fn parse(head: &Head) -> Result<Self, AccessError> {
        let request_line = head.first_line();
        let mut parts = request_line.split_whitespace();
        let (method, path, protocol) = match (parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(path), Some(protocol)) if parts.next().is_none() => {
                (method, path, protocol)
            }
            _ => {
                return Err(AccessError::BadRequest(format!(
                    "malformed request line: {:?}",
                    request_line
                )))
            }
        };

        if method != "GET" {
            return Err(AccessError::BadRequest(format!("unsupported method {}", method)));
        }
        if !path.starts_with('/') {
            return Err(AccessError::BadRequest(format!("invalid path {}", path)));
        }
        if !protocol.starts_with("HTTP/") {
            return Err(AccessError::BadRequest(format!("unsupported protocol {}", protocol)));
        }

        let headers = head
            .header_lines()
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();

        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            protocol: protocol.to_string(),
            headers,
        })
    }

    /// Requested mountpoint, without the leading slash or any query string.
    /// Empty for a sourcetable request.
    pub fn mountpoint(&self) -> &str {
        let path = self.path.split('?').next().unwrap_or("");
        path.trim_start_matches('/')
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn version(&self) -> NtripVersion {
        match self.header(NTRIP_VERSION_HEADER) {
            Some(value) if value.contains("2.0") => NtripVersion::V2,
            _ => NtripVersion::V1,
        }
    }

    pub fn authorization(&self) -> Option<&str> {
        self.header("Authorization")
    }
}

/// Classification of a caster's status line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    SourceTable,
    Unauthorized,
    NotFound,
    ServerError,
    Unexpected,
}

impl ResponseStatus {
    /// Classify a status line such as `ICY 200 OK` or `HTTP/1.1 401 Unauthorized`
    pub fn classify(status_line: &str) -> Self {
        let mut parts = status_line.split_whitespace();
        let protocol = parts.next().unwrap_or("");
        let code = parts.next().and_then(|c| c.parse::<u16>().ok());

        if protocol == "SOURCETABLE" {
            return match code {
                Some(200) => ResponseStatus::SourceTable,
                _ => ResponseStatus::Unexpected,
            };
        }
        if protocol != "ICY" && !protocol.starts_with("HTTP/") {
            return ResponseStatus::Unexpected;
        }

        match code {
            Some(200) => ResponseStatus::Success,
            Some(401) | Some(403) => ResponseStatus::Unauthorized,
            Some(404) => ResponseStatus::NotFound,
            Some(500..=599) => ResponseStatus::ServerError,
            _ => ResponseStatus::Unexpected,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == ResponseStatus::Success
    }

    /// Human-readable diagnosis
    pub fn describe(&self) -> &'static str {
        match self {
            ResponseStatus::Success => "stream started",
            ResponseStatus::SourceTable => "caster returned its sourcetable; mountpoint does not exist",
            ResponseStatus::Unauthorized => "authentication failed, check username/password",
            ResponseStatus::NotFound => "mountpoint not found",
            ResponseStatus::ServerError => "caster internal error",
            ResponseStatus::Unexpected => "unexpected response from caster",
        }
    }
}

/// Responses the local caster sends
#[derive(Debug, Clone, PartialEq)]
pub enum NtripResponse {
    /// Handshake accepted; raw stream follows
    Stream(NtripVersion),
    SourceTable { version: NtripVersion, body: String },
    Unauthorized { realm: String },
    NotFound,
    BadRequest,
    Unavailable,
}

impl NtripResponse {
    /// Failure response for a refused handshake
    pub fn rejection(error: &AccessError, realm: &str) -> Self {
        match error {
            AccessError::Unauthorized => NtripResponse::Unauthorized {
                realm: realm.to_string(),
            },
            AccessError::UnknownMountpoint(_) => NtripResponse::NotFound,
            AccessError::BadRequest(_) => NtripResponse::BadRequest,
            AccessError::Unavailable => NtripResponse::Unavailable,
        }
    }

    pub fn status_line(&self) -> &'static str {
        match self {
            NtripResponse::Stream(NtripVersion::V1) => ICY_OK,
            NtripResponse::Stream(NtripVersion::V2) => HTTP_OK,
            NtripResponse::SourceTable {
                version: NtripVersion::V1,
                ..
            } => SOURCETABLE_OK,
            NtripResponse::SourceTable {
                version: NtripVersion::V2,
                ..
            } => HTTP_OK,
            NtripResponse::Unauthorized { .. } => HTTP_UNAUTHORIZED,
            NtripResponse::NotFound => HTTP_NOT_FOUND,
            NtripResponse::BadRequest => HTTP_BAD_REQUEST,
            NtripResponse::Unavailable => HTTP_UNAVAILABLE,
        }
    }

    /// Wire bytes of the full response head (and body, for a sourcetable)
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(self.status_line());
        out.push_str("\r\n");

        match self {
            NtripResponse::Stream(NtripVersion::V1) => {}
            NtripResponse::Stream(NtripVersion::V2) => {
                push_header(&mut out, NTRIP_VERSION_HEADER, NTRIP_VERSION_2);
                push_header(&mut out, "Server", SERVER_NAME);
                push_header(&mut out, "Content-Type", CONTENT_TYPE_GNSS_DATA);
                push_header(&mut out, "Cache-Control", "no-store, no-cache, max-age=0");
                push_header(&mut out, "Pragma", "no-cache");
                push_header(&mut out, "Connection", "close");
            }
            NtripResponse::SourceTable { version, body } => {
                if *version == NtripVersion::V2 {
                    push_header(&mut out, NTRIP_VERSION_HEADER, NTRIP_VERSION_2);
                    push_header(&mut out, "Content-Type", CONTENT_TYPE_SOURCETABLE);
                } else {
                    push_header(&mut out, "Content-Type", "text/plain");
                }
                push_header(&mut out, "Server", SERVER_NAME);
                push_header(&mut out, "Content-Length", &body.len().to_string());
                push_header(&mut out, "Connection", "close");
                out.push_str("\r\n");
                out.push_str(body);
                return out.into_bytes();
            }
            NtripResponse::Unauthorized { realm } => {
                push_header(&mut out, "Server", SERVER_NAME);
                push_header(&mut out, "WWW-Authenticate", &format!("Basic realm=\"/{}\"", realm));
                push_header(&mut out, "Content-Length", "0");
                push_header(&mut out, "Connection", "close");
            }
            NtripResponse::NotFound | NtripResponse::BadRequest | NtripResponse::Unavailable => {
                push_header(&mut out, "Server", SERVER_NAME);
                push_header(&mut out, "Content-Length", "0");
                push_header(&mut out, "Connection", "close");
            }
        }

        out.push_str("\r\n");
        out.into_bytes()
    }
}

fn push_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str("\r\n");
}

/// Sourcetable body listing a single stream
pub fn sourcetable_body(mountpoint: &str, auth_required: bool) -> String {
    let authentication = if auth_required { "B" } else { "N" };
    format!(
        "STR;{mp};{mp};RTCM 3;;2;GNSS;ntrip-relay;;0.00;0.00;0;0;ntrip-relay;none;{auth};N;0;\r\n{end}\r\n",
        mp = mountpoint,
        auth = authentication,
        end = END_SOURCETABLE,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(text: &str) -> Head {
        Head {
            text: text.to_string(),
            leftover: Bytes::new(),
        }
    }

    #[test]
    fn test_parse_v2_request() {
        let request = NtripRequest::parse(&head(
            "GET /RTCM4 HTTP/1.1\r\nHost: localhost\r\nNtrip-Version: Ntrip/2.0\r\nauthorization: Basic dTpw",
        ))
        .unwrap();

        assert_eq!(request.mountpoint(), "RTCM4");
        assert_eq!(request.version(), NtripVersion::V2);
        assert_eq!(request.authorization(), Some("Basic dTpw"));
        assert_eq!(request.header("host"), Some("localhost"));
    }

    #[test]
    fn test_parse_v1_request_and_root_path() {
        let request = NtripRequest::parse(&head("GET / HTTP/1.0\nUser-Agent: NTRIP test")).unwrap();
        assert_eq!(request.mountpoint(), "");
        assert_eq!(request.version(), NtripVersion::V1);
        assert_eq!(request.authorization(), None);
    }

    #[test]
    fn test_reject_malformed_requests() {
        for text in ["POST /RTCM HTTP/1.1", "GET RTCM HTTP/1.1", "GET /RTCM", "garbage", ""] {
            assert!(
                matches!(NtripRequest::parse(&head(text)), Err(AccessError::BadRequest(_))),
                "{:?} should be rejected",
                text
            );
        }
    }

    #[test]
    fn test_classify_status_lines() {
        assert_eq!(ResponseStatus::classify("ICY 200 OK"), ResponseStatus::Success);
        assert_eq!(ResponseStatus::classify("HTTP/1.1 200 OK"), ResponseStatus::Success);
        assert_eq!(ResponseStatus::classify("HTTP/1.0 200 OK"), ResponseStatus::Success);
        assert_eq!(ResponseStatus::classify("SOURCETABLE 200 OK"), ResponseStatus::SourceTable);
        assert_eq!(ResponseStatus::classify("HTTP/1.1 401 Unauthorized"), ResponseStatus::Unauthorized);
        assert_eq!(ResponseStatus::classify("HTTP/1.1 403 Forbidden"), ResponseStatus::Unauthorized);
        assert_eq!(ResponseStatus::classify("HTTP/1.1 404 Not Found"), ResponseStatus::NotFound);
        assert_eq!(ResponseStatus::classify("HTTP/1.1 503 Busy"), ResponseStatus::ServerError);
        assert_eq!(ResponseStatus::classify("HTTP/1.1 302 Found"), ResponseStatus::Unexpected);
        assert_eq!(ResponseStatus::classify("hello"), ResponseStatus::Unexpected);
    }

    #[test]
    fn test_encode_responses() {
        assert_eq!(NtripResponse::Stream(NtripVersion::V1).encode(), b"ICY 200 OK\r\n\r\n");

        let v2 = String::from_utf8(NtripResponse::Stream(NtripVersion::V2).encode()).unwrap();
        assert!(v2.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(v2.contains("Content-Type: gnss/data\r\n"));
        assert!(v2.ends_with("\r\n\r\n"));

        let unauthorized = String::from_utf8(
            NtripResponse::rejection(&AccessError::Unauthorized, "RTCM4").encode(),
        )
        .unwrap();
        assert!(unauthorized.starts_with("HTTP/1.1 401"));
        assert!(unauthorized.contains("WWW-Authenticate: Basic realm=\"/RTCM4\""));

        let not_found = NtripResponse::rejection(&AccessError::UnknownMountpoint("X".into()), "RTCM4");
        assert_eq!(not_found.status_line(), HTTP_NOT_FOUND);
    }

    #[test]
    fn test_sourcetable_response() {
        let body = sourcetable_body("RTCM4", true);
        let response = NtripResponse::SourceTable {
            version: NtripVersion::V1,
            body: body.clone(),
        };
        let text = String::from_utf8(response.encode()).unwrap();

        assert!(text.starts_with("SOURCETABLE 200 OK\r\n"));
        assert!(text.contains(&format!("Content-Length: {}\r\n", body.len())));
        assert!(text.contains("STR;RTCM4;RTCM4;RTCM 3;"));
        assert!(text.ends_with("ENDSOURCETABLE\r\n"));
    }
}
