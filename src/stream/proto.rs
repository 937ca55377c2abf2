//! NTRIP request rendering and response head parsing.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};

use crate::config::{ClientConfig, NtripVersion};

/// Marker header that selects NTRIP 2.0 framing on the caster.
pub const NTRIP_VERSION_HEADER: &str = "Ntrip-Version: Ntrip/2.0";
/// Content type a caster uses when it answers with its mountpoint listing.
pub const SOURCETABLE_CONTENT_TYPE: &str = "gnss/sourcetable";

/// Renders the request a caster expects for the configured version.
pub fn render_request(config: &ClientConfig) -> String {
    let path = format!("/{}", config.mountpoint());
    let mut lines = Vec::with_capacity(8);

    match config.version() {
        NtripVersion::V2 => {
            lines.push(format!("GET {path} HTTP/1.1"));
            lines.push(format!("Host: {}:{}", config.host(), config.port()));
            lines.push(NTRIP_VERSION_HEADER.to_string());
        }
        NtripVersion::V1 => {
            lines.push(format!("GET {path} HTTP/1.0"));
        }
    }

    lines.push(format!("User-Agent: {}", config.user_agent()));
    lines.push("Accept: */*".to_string());
    if config.version() == NtripVersion::V2 {
        lines.push("Connection: close".to_string());
    }
    if let Some(credentials) = config.basic_credentials() {
        lines.push(format!(
            "Authorization: Basic {}",
            BASE64_STANDARD.encode(credentials)
        ));
    }

    let mut request = lines.join("\r\n");
    request.push_str("\r\n\r\n");
    request
}

/// First line of a caster response, e.g. `ICY 200 OK` or
/// `HTTP/1.1 401 Unauthorized`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatusLine {
    pub protocol: String,
    pub code: u16,
    pub reason: String,
}

impl StatusLine {
    /// Parses `<protocol> <code> [reason]`; `None` when the line does not have
    /// that shape.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.trim().splitn(3, ' ');
        let protocol = parts.next().filter(|p| !p.is_empty())?;
        let code = parts.next()?.parse::<u16>().ok()?;
        if !(100..=999).contains(&code) {
            return None;
        }
        let reason = parts.next().unwrap_or("").trim().to_string();

        Some(Self {
            protocol: protocol.to_string(),
            code,
            reason,
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_http(&self) -> bool {
        self.protocol.starts_with("HTTP/")
    }

    pub fn is_icy(&self) -> bool {
        self.protocol == "ICY"
    }

    pub fn is_sourcetable(&self) -> bool {
        self.protocol == "SOURCETABLE"
    }
}

/// Response head: the status line plus any header lines that followed it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResponseHead {
    pub lines: Vec<String>,
}

impl ResponseHead {
    /// Splits raw head bytes into trimmed, non-empty lines.
    pub fn parse(raw: &[u8]) -> Self {
        let lines = String::from_utf8_lossy(raw)
            .split('\n')
            .map(|line| line.trim_end_matches('\r').to_string())
            .filter(|line| !line.trim().is_empty())
            .collect();
        Self { lines }
    }

    pub fn status_line(&self) -> Option<&str> {
        self.lines.first().map(String::as_str)
    }

    /// Case-insensitive header lookup; returns the trimmed value of the first
    /// match.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.lines.iter().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then_some(value.trim())
        })
    }

    pub fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .map(|value| {
                value
                    .split(',')
                    .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
            })
            .unwrap_or(false)
    }

    pub fn is_sourcetable(&self) -> bool {
        self.header("Content-Type")
            .map(|value| {
                value
                    .split(';')
                    .next()
                    .unwrap_or("")
                    .trim()
                    .eq_ignore_ascii_case(SOURCETABLE_CONTENT_TYPE)
            })
            .unwrap_or(false)
    }
}

/// Locates the end of an HTTP-style header block.
///
/// Returns `(head_len, body_start)` where `head_len` excludes the blank line.
/// Accepts the lenient bare `\n\n` form some casters emit.
pub fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = find(buf, b"\r\n\r\n").map(|pos| (pos, pos + 4));
    let lf = find(buf, b"\n\n").map(|pos| (pos, pos + 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Locates the end of the first line; returns `(line_len, rest_start)`.
pub fn find_line_end(buf: &[u8]) -> Option<(usize, usize)> {
    let pos = buf.iter().position(|byte| *byte == b'\n')?;
    let line_len = if pos > 0 && buf[pos - 1] == b'\r' {
        pos - 1
    } else {
        pos
    };
    Some((line_len, pos + 1))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;
    use crate::config::{ClientConfig, NtripVersion};

    #[test]
    fn v2_request_without_credentials() {
        let config = ClientConfig::builder("caster.example.org", "RTCM3")
            .user_agent("NTRIP test/1.0")
            .build()
            .expect("config");

        assert_eq!(
            render_request(&config),
            "GET /RTCM3 HTTP/1.1\r\n\
             Host: caster.example.org:2101\r\n\
             Ntrip-Version: Ntrip/2.0\r\n\
             User-Agent: NTRIP test/1.0\r\n\
             Accept: */*\r\n\
             Connection: close\r\n\r\n"
        );
    }

    #[test]
    fn v2_request_carries_basic_auth() {
        let config = ClientConfig::builder("caster", "MOUNT")
            .credentials("user", Some(SecretString::new("pass".to_string())))
            .build()
            .expect("config");

        let request = render_request(&config);
        assert!(request.contains("\r\nAuthorization: Basic dXNlcjpwYXNz\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn v1_request_is_bare() {
        let config = ClientConfig::builder("caster", "MOUNT")
            .version(NtripVersion::V1)
            .user_agent("NTRIP test/1.0")
            .credentials("user", None)
            .build()
            .expect("config");

        let request = render_request(&config);
        assert!(request.starts_with("GET /MOUNT HTTP/1.0\r\n"));
        assert!(!request.contains("Ntrip-Version"));
        assert!(!request.contains("Host:"));
        assert!(request.contains("Authorization: Basic dXNlcjo=\r\n"));
    }

    #[test]
    fn status_lines_parse() {
        let icy = StatusLine::parse("ICY 200 OK").expect("icy");
        assert!(icy.is_icy() && icy.is_success());

        let denied = StatusLine::parse("HTTP/1.1 401 Unauthorized").expect("http");
        assert_eq!(denied.code, 401);
        assert_eq!(denied.reason, "Unauthorized");
        assert!(denied.is_http() && !denied.is_success());

        assert!(StatusLine::parse("SOURCETABLE 200 OK")
            .expect("sourcetable")
            .is_sourcetable());
        assert_eq!(StatusLine::parse("<html><body>"), None);
        assert_eq!(StatusLine::parse("HTTP/1.1 abc"), None);
        assert_eq!(StatusLine::parse(""), None);
    }

    #[test]
    fn head_lookup_is_case_insensitive() {
        let head = ResponseHead::parse(
            b"HTTP/1.1 200 OK\r\ncontent-type: gnss/sourcetable; charset=utf-8\r\nTransfer-Encoding: Chunked\r\n",
        );
        assert_eq!(head.status_line(), Some("HTTP/1.1 200 OK"));
        assert!(head.is_sourcetable());
        assert!(head.is_chunked());
        assert_eq!(head.header("missing"), None);
    }

    #[test]
    fn header_end_prefers_earliest_terminator() {
        assert_eq!(find_header_end(b"ICY 200 OK\r\n\r\n\xd3"), Some((10, 14)));
        assert_eq!(find_header_end(b"HTTP/1.1 200 OK\n\nrest"), Some((15, 17)));
        assert_eq!(find_header_end(b"HTTP/1.1 200 OK\r\nHost: x\r\n"), None);
    }

    #[test]
    fn line_end_strips_carriage_return() {
        assert_eq!(find_line_end(b"ICY 200 OK\r\n\xd3\x00"), Some((10, 12)));
        assert_eq!(find_line_end(b"ICY 200 OK\n"), Some((10, 11)));
        assert_eq!(find_line_end(b"ICY 200"), None);
    }
}
