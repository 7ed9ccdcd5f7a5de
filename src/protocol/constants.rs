//! NTRIP Protocol Constants

// Protocol version header
pub const NTRIP_VERSION_HEADER: &str = "Ntrip-Version";
pub const NTRIP_VERSION_2: &str = "Ntrip/2.0";

// Head framing
pub const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";
pub const HEAD_TERMINATOR_BARE: &[u8] = b"\n\n";
pub const MAX_HEAD_LEN: usize = 64 * 1024;
pub const HEAD_READ_CHUNK: usize = 1024;

// Status lines
pub const ICY_OK: &str = "ICY 200 OK";
pub const HTTP_OK: &str = "HTTP/1.1 200 OK";
pub const SOURCETABLE_OK: &str = "SOURCETABLE 200 OK";
pub const HTTP_BAD_REQUEST: &str = "HTTP/1.1 400 Bad Request";
pub const HTTP_UNAUTHORIZED: &str = "HTTP/1.1 401 Unauthorized";
pub const HTTP_NOT_FOUND: &str = "HTTP/1.1 404 Not Found";
pub const HTTP_UNAVAILABLE: &str = "HTTP/1.1 503 Service Unavailable";

// Content types
pub const CONTENT_TYPE_GNSS_DATA: &str = "gnss/data";
pub const CONTENT_TYPE_SOURCETABLE: &str = "gnss/sourcetable";

pub const END_SOURCETABLE: &str = "ENDSOURCETABLE";

/// Value of the `Server` header on local responses
pub const SERVER_NAME: &str = concat!("NTRIP ntrip-relay/", env!("CARGO_PKG_VERSION"));
