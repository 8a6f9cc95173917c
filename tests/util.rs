#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::{create_dir_all, File};
use std::io;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

#[macro_export]
macro_rules! map {
    ($($k:expr => $v:expr),* $(,)?) => {
        vec![$(($k, $v),)*].into_iter().collect::<std::collections::HashMap<_, _>>()
    };
}

const BASE64_TABLE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Encode data as base64, for `Authorization` headers.
pub struct Base64Encoded<'a>(pub &'a [u8]);

impl<'a> std::fmt::Display for Base64Encoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for chunk in self.0.chunks(3) {
            let mut triple: u32 = 0;
            for i in 0..3 {
                triple <<= 8;
                triple += *chunk.get(i).unwrap_or(&0) as u32;
            }
            for i in (0..4).rev().take(chunk.len() + 1) {
                let index = (triple as usize >> (i * 6)) & 0x3F;
                write!(f, "{}", BASE64_TABLE[index] as char)?;
            }
            for _ in 0..(3 - chunk.len()) {
                write!(f, "=")?;
            }
        }
        Ok(())
    }
}

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("127.0.0.1", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(5));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

/// Document root that can be populated before the server starts.
pub struct Root(TempDir);

impl Root {
    pub fn new() -> Self {
        Root(tempdir().expect("failed to create tempdir"))
    }
    pub fn path(&self) -> &Path {
        self.0.path()
    }
    pub fn create_dir(&self, name: &str) {
        create_dir_all(self.path().join(name)).expect("failed to create directory");
    }
    pub fn write_file(&self, name: &str, contents: &str) {
        let mut file = File::create(self.path().join(name)).expect("failed to create file");
        file.write_all(contents.as_bytes())
            .expect("failed to write file");
    }
    pub fn write_script(&self, name: &str, contents: &str) {
        self.write_file(name, contents);
        let path = self.path().join(name);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to make script executable");
    }
}

pub struct Server {
    _child: ScopedChild,
    port: u16,
    root: Root,
}
impl Server {
    pub fn with_args(args: &[&str]) -> Self {
        Self::start(Root::new(), args)
    }
    pub fn start(root: Root, args: &[&str]) -> Self {
        // Get an unused port. Assumes the port won't be reused before the server starts.
        let port = get_unused_port().expect("failed to get unused port");

        let child = Command::new(env!("CARGO_BIN_EXE_tinyhttpd-rs"))
            .args(&[
                "--root",
                root.path().to_str().expect("path is not valid UTF-8"),
                "--port",
                &format!("{}", port),
                "--addr",
                "127.0.0.1",
            ])
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn server")
            .into();

        // Wait until the socket is open.
        assert!(wait_for_port(port), "failed to connect to server");

        Self {
            _child: child,
            port,
            root,
        }
    }
    /// Start with a config file written into the document root.
    pub fn with_config(root: Root, config: &str) -> Self {
        root.write_file("server.ini", config);
        let config_path = root.path().join("server.ini");
        let config_path = config_path.to_str().expect("path is not valid UTF-8").to_string();
        Self::start(root, &["--config", &config_path])
    }
    pub fn root(&self) -> &Root {
        &self.root
    }
    pub fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("127.0.0.1", self.port)).expect("failed to connect to server");
        // Set timeouts to prevent tests from hanging
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
    /// Send raw request bytes on a new connection and read one response.
    pub fn request(&self, request: &str) -> Response {
        let mut stream = self.stream();
        stream.write_all(request.as_bytes()).unwrap();
        Response::from_reader(&mut stream).expect("failed to read response")
    }
    pub fn get(&self, path: &str, headers: HashMap<&str, &str>) -> Response {
        let mut request = format!("GET {} HTTP/1.1\r\n", path);
        for (header_name, header_value) in headers {
            request.push_str(&format!("{}: {}\r\n", header_name, header_value));
        }
        request.push_str("\r\n");
        self.request(&request)
    }
}

/// HTTP response from the server.
pub struct Response {
    response_line: String,
    headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}
impl Response {
    /// Read a response. The body is read by `Content-Length`, or until EOF when the server
    /// closes the connection without declaring a length.
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut response = Self::head_from_reader(reader)?;
        response.body = match response.headers.get("Content-Length") {
            Some(length) => {
                let length = length.parse::<usize>().expect("invalid content length");
                Some(Self::read_body(reader, length)?)
            }
            None if response.header("Connection") == Some("close") => {
                let mut body = Vec::new();
                reader.read_to_end(&mut body)?;
                Some(body)
            }
            None => None,
        };
        Ok(response)
    }
    /// Read only the status line and headers.
    pub fn head_from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let response_line = Self::read_header(reader)?;
        let headers = Self::read_headers(reader)?;
        Ok(Self {
            response_line,
            headers,
            body: None,
        })
    }
    fn read_headers<R: Read>(reader: &mut R) -> io::Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        loop {
            let header_line = Self::read_header(reader)?;
            if header_line.is_empty() {
                break;
            }
            let mut header = header_line.splitn(2, ": ");
            let key = header.next().expect("invalid header").to_string();
            let value = header.next().expect("invalid header").to_string();
            headers.insert(key, value);
        }
        Ok(headers)
    }
    fn read_header<R: Read>(reader: &mut R) -> io::Result<String> {
        read_until_slice(reader, b"\r\n")
            .map(|vec| String::from_utf8(vec).expect("response header is not valid UTF-8"))
    }
    fn read_body<R: Read>(reader: &mut R, content_length: usize) -> io::Result<Vec<u8>> {
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body)?;
        Ok(body)
    }
    pub fn status(&self) -> &str {
        self.response_line
            .splitn(2, ' ')
            .nth(1)
            .expect("invalid response line")
    }
    pub fn protocol(&self) -> &str {
        self.response_line
            .split(' ')
            .next()
            .expect("invalid response line")
    }
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|name| name.as_str())
    }
    pub fn text(&self) -> Option<&str> {
        self.body
            .as_ref()
            .map(|body| std::str::from_utf8(body).expect("body is not valid UTF-8"))
    }
}

fn read_until_slice<R: Read>(reader: &mut R, separator: &[u8]) -> io::Result<Vec<u8>> {
    let mut byte = [0; 1];
    let mut buf = Vec::new();
    loop {
        reader.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if buf.as_slice().ends_with(separator) {
            buf.truncate(buf.len() - separator.len());
            return Ok(buf);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn base_64_encoded_works() {
        assert_eq!(Base64Encoded(b"").to_string(), "");
        assert_eq!(Base64Encoded(b"M").to_string(), "TQ==");
        assert_eq!(Base64Encoded(b"Ma").to_string(), "TWE=");
        assert_eq!(Base64Encoded(b"user:pass").to_string(), "dXNlcjpwYXNz");
    }
}
