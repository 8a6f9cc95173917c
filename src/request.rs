//! Reading a request line and its headers off a connection.

use std::io::{self, BufRead, Read};

use crate::auth::Credentials;
use crate::text::trim;

/// Longest request or header line accepted.
const MAX_LINE_LEN: u64 = 8192;

/// Most header lines read for one request.
const MAX_HEADER_LINES: usize = 256;

/// The request headers the server acts on. Everything else is ignored.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Headers {
    pub host: Option<String>,
    pub connection: Option<String>,
    pub content_length: Option<u64>,
    pub user_agent: Option<String>,
    pub accept: Option<String>,
    pub cookie: Option<String>,
    pub if_modified_since: Option<String>,
    pub content_type: Option<String>,
    pub authorization: Option<String>,
    pub referer: Option<String>,
}

impl Headers {
    /// Record a `Name: value` line. Names are matched case-insensitively.
    fn add_line(&mut self, line: &str) {
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (trim(name), trim(value).to_string()),
            None => return,
        };
        let field = match name.to_ascii_lowercase().as_str() {
            "host" => &mut self.host,
            "connection" => &mut self.connection,
            "content-length" => {
                self.content_length = value.parse().ok();
                if self.content_length.is_none() {
                    log::debug!("ignoring invalid content length {:?}", value);
                }
                return;
            }
            "user-agent" => &mut self.user_agent,
            "accept" => &mut self.accept,
            "cookie" => &mut self.cookie,
            "if-modified-since" => &mut self.if_modified_since,
            "content-type" => &mut self.content_type,
            "authorization" => &mut self.authorization,
            "referer" => &mut self.referer,
            _ => return,
        };
        *field = Some(value);
    }
}

/// A parsed request head. Rebuilt for every request on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// The request line as received, for the access log.
    pub line: String,
    pub method: String,
    /// Request target exactly as sent.
    pub target: String,
    pub protocol: Option<String>,
    pub headers: Headers,
    pub credentials: Option<Credentials>,
}

impl Request {
    fn from_lines(line: String, header_lines: &[String]) -> Self {
        let mut tokens = line.split(' ').filter(|token| !token.is_empty());
        let method = tokens.next().unwrap_or("").to_ascii_uppercase();
        let target = tokens.next().unwrap_or("").to_string();
        let protocol = tokens.next().map(str::to_string);

        let mut headers = Headers::default();
        for header_line in header_lines {
            headers.add_line(header_line);
        }
        let credentials = headers
            .authorization
            .as_deref()
            .and_then(Credentials::from_header);
        Self {
            line,
            method,
            target,
            protocol,
            headers,
            credentials,
        }
    }

    /// A request needs at least a method and a target, and the target must be a path.
    pub fn is_well_formed(&self) -> bool {
        !self.method.is_empty() && self.target.starts_with('/')
    }

    /// Protocol to answer with.
    pub fn protocol(&self) -> &str {
        self.protocol.as_deref().unwrap_or("HTTP/1.0")
    }

    /// Target up to the query string or fragment, still percent-encoded.
    pub fn script_name(&self) -> &str {
        match self.target.find(|c| c == '?' || c == '#') {
            Some(end) => &self.target[..end],
            None => &self.target,
        }
    }

    /// Everything after the first `?`, or an empty string.
    pub fn query_string(&self) -> &str {
        self.target.split_once('?').map_or("", |(_, query)| query)
    }

    pub fn wants_keep_alive(&self) -> bool {
        self.headers
            .connection
            .as_deref()
            .map_or(false, |connection| connection.eq_ignore_ascii_case("keep-alive"))
    }

    pub fn content_length(&self) -> u64 {
        self.headers.content_length.unwrap_or(0)
    }
}

/// Read one line ending in LF or CRLF, without the line ending.
///
/// Returns `None` at EOF before any byte was read.
pub(crate) fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Option<String>> {
    let mut buf = Vec::new();
    let read = reader.by_ref().take(MAX_LINE_LEN).read_until(b'\n', &mut buf)?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if read as u64 == MAX_LINE_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "request line too long"));
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Read a request line and its headers.
///
/// Returns `None` when the client closed the connection or sent an empty request line.
pub fn read_request<R: BufRead>(reader: &mut R) -> io::Result<Option<Request>> {
    let line = match read_line(reader)? {
        Some(line) if !line.is_empty() => line,
        _ => return Ok(None),
    };
    let mut header_lines = Vec::new();
    while let Some(header_line) = read_line(reader)? {
        if header_line.is_empty() {
            break;
        }
        if header_lines.len() == MAX_HEADER_LINES {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "too many header lines"));
        }
        header_lines.push(header_line);
    }
    log::debug!("request: {:?} headers: {:?}", line, header_lines);
    Ok(Some(Request::from_lines(line, &header_lines)))
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    fn parse(data: &[u8]) -> Option<Request> {
        read_request(&mut &data[..]).unwrap()
    }

    #[test]
    fn read_request_works() {
        let request = parse(
            b"get /cgi/test.cgi/extra?a=1&b=2 HTTP/1.1\r\n\
              Host: localhost\r\n\
              Connection: Keep-Alive\r\n\
              Content-Length: 12\r\n\
              Authorization: Basic YWxpY2U6c2VjcmV0\r\n\
              \r\n\
              body follows",
        )
        .unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.target, "/cgi/test.cgi/extra?a=1&b=2");
        assert_eq!(request.protocol(), "HTTP/1.1");
        assert_eq!(request.script_name(), "/cgi/test.cgi/extra");
        assert_eq!(request.query_string(), "a=1&b=2");
        assert!(request.wants_keep_alive());
        assert_eq!(request.content_length(), 12);
        assert_eq!(request.headers.host.as_deref(), Some("localhost"));
        assert_eq!(request.credentials.as_ref().unwrap().user, "alice");
        assert!(request.is_well_formed());
    }

    #[test_case("Content-Length: 7" ; "title case")]
    #[test_case("content-length: 7" ; "lower case")]
    #[test_case("CONTENT-LENGTH:7" ; "upper case without space")]
    fn header_names_are_case_insensitive(header: &str) {
        let data = format!("POST / HTTP/1.0\n{}\n\n", header);
        assert_eq!(parse(data.as_bytes()).unwrap().content_length(), 7);
    }

    #[test]
    fn lf_only_lines_and_missing_protocol() {
        let request = parse(b"HEAD /index.html\nReferer: http://a/\nX-Other: 1\n\n").unwrap();
        assert_eq!(request.method, "HEAD");
        assert_eq!(request.protocol, None);
        assert_eq!(request.protocol(), "HTTP/1.0");
        assert_eq!(request.headers.referer.as_deref(), Some("http://a/"));
        assert!(!request.wants_keep_alive());
        assert_eq!(request.query_string(), "");
    }

    #[test_case("GET /a/b?x=/../.. HTTP/1.1\n\n", "/a/b" ; "query")]
    #[test_case("GET /a/../b#frag HTTP/1.1\n\n", "/a/../b" ; "fragment")]
    #[test_case("GET /a%3Fb?c HTTP/1.1\n\n", "/a%3Fb" ; "encoded question mark")]
    fn script_name_stops_at_query_or_fragment(data: &str, expected: &str) {
        assert_eq!(parse(data.as_bytes()).unwrap().script_name(), expected);
    }

    #[test_case(b"GET\r\n\r\n" ; "missing target")]
    #[test_case(b"GET index.html HTTP/1.1\r\n\r\n" ; "relative target")]
    fn malformed_requests_are_flagged(data: &[u8]) {
        assert!(!parse(data).unwrap().is_well_formed());
    }

    #[test]
    fn closed_or_empty_request_ends_connection() {
        assert_eq!(parse(b""), None);
        assert_eq!(parse(b"\r\nGET / HTTP/1.1\r\n\r\n"), None);
    }

    #[test]
    fn overlong_line_is_an_error() {
        let data = vec![b'a'; MAX_LINE_LEN as usize + 10];
        assert!(read_request(&mut &data[..]).is_err());
    }

    #[test]
    fn successive_requests_are_read_separately() {
        let data = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let mut reader = &data[..];
        assert_eq!(read_request(&mut reader).unwrap().unwrap().target, "/a");
        assert_eq!(read_request(&mut reader).unwrap().unwrap().target, "/b");
        assert_eq!(read_request(&mut reader).unwrap(), None);
    }
}
