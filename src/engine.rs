//! The request engine: one instance owns an accepted connection for its whole lifetime.
//!
//! Each iteration of the keep-alive loop reads a request, routes it to exactly one kind of
//! response, writes that response and records it in the access log. Any error while handling a
//! request becomes a 500 unless a status line was already sent, in which case the connection is
//! closed.

use std::fs::{self, DirEntry};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};

use crate::auth::{authorize, Decision};
use crate::gateway::{self, ResourceHandle};
use crate::logging::AccessRecord;
use crate::path::{canonicalize, encode_path};
use crate::request::{read_line, read_request, Request};
use crate::text::{
    strip_prefix_ignore_case, trim, url_decode, HtmlEscaped, HttpDate, ListingDate, ListingSize,
    LogEncoded, UrlEncoded,
};
use crate::Server;

const BUFFER_SIZE: usize = 1 << 14;

/// An accepted socket and where it came from.
#[derive(Debug)]
pub struct ConnectionContext {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// Index of the listener that accepted the connection.
    pub listener: usize,
}

/// Serve requests on a connection until it closes.
pub fn run(server: &Server, context: ConnectionContext) {
    let peer = context.peer;
    if let Err(e) = serve(server, context) {
        log::debug!("connection from {} ended: {:#}", peer, e);
    }
}

fn serve(server: &Server, context: ConnectionContext) -> Result<()> {
    let writer = context
        .stream
        .try_clone()
        .context("failed to clone socket")?;
    let mut conn = Connection {
        server,
        reader: BufReader::new(context.stream),
        writer,
        peer: context.peer,
        listener: context.listener,
    };
    conn.keep_alive_loop();
    conn.writer.shutdown(Shutdown::Both).ok();
    Ok(())
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        301 => "Moved Permanently",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Mutable state of the request being answered.
#[derive(Debug)]
struct Exchange {
    protocol: String,
    head_only: bool,
    keep_alive: bool,
    /// Zero until a status line has been sent.
    status: u16,
    /// Body bytes written to the client.
    bytes_sent: u64,
    /// Request body bytes not yet read off the socket.
    unread_body: u64,
    user: Option<String>,
}

impl Exchange {
    fn new(request: &Request) -> Self {
        Self {
            protocol: request.protocol().to_string(),
            head_only: request.method == "HEAD",
            keep_alive: request.wants_keep_alive(),
            unread_body: request.content_length(),
            ..Self::closing()
        }
    }

    /// An HTTP/1.0 exchange that ends the connection, for requests that could not be parsed.
    fn closing() -> Self {
        Self {
            protocol: "HTTP/1.0".to_string(),
            head_only: false,
            keep_alive: false,
            status: 0,
            bytes_sent: 0,
            unread_body: 0,
            user: None,
        }
    }
}

/// A generated response.
#[derive(Debug)]
struct Reply {
    status: u16,
    headers: String,
    content_type: String,
    body: String,
}

impl Reply {
    fn error(status: u16, explanation: &str) -> Self {
        Self {
            status,
            headers: String::new(),
            content_type: "text/plain".to_string(),
            body: format!("{} {}\n{}\n", status, reason_phrase(status), explanation),
        }
    }

    fn unauthorized(challenge: &str) -> Self {
        let mut reply = Self::error(401, "Access denied due to invalid credentials.");
        reply.headers = format!("WWW-Authenticate: {}\r\n", challenge);
        reply
    }

    fn redirect(location: String) -> Self {
        Self {
            status: 301,
            body: format!(
                "<html><head><title>301 Moved Permanently</title></head><body>\n\
                <h1>Moved Permanently</h1>\n\
                Moved to: <a href=\"{}\">{}</a>\n\
                </body></html>\n",
                HtmlEscaped(&location),
                HtmlEscaped(&location),
            ),
            headers: format!("Location: {}\r\n", location),
            content_type: "text/html".to_string(),
        }
    }
}

/// A CGI script found on the request path.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Script {
    path: PathBuf,
    interpreter: Option<String>,
    /// Request path of the script itself.
    name: String,
    /// Whatever followed the script on the request path.
    path_info: String,
}

/// What a request resolves to.
#[derive(Debug)]
enum Route {
    Reply(Reply),
    Listing { dir: PathBuf, request_path: String },
    Static { path: PathBuf, request_path: String },
    Gateway(Script),
}

/// One row of a directory listing.
#[derive(Debug)]
struct ListEntry {
    name: String,
    size: u64,
    is_dir: bool,
    modified: SystemTime,
}

impl ListEntry {
    fn from_dir_entry(entry: &DirEntry) -> Option<Self> {
        // follow symlinks so linked directories list as directories
        let metadata = fs::metadata(entry.path()).ok()?;
        Some(Self {
            name: entry.file_name().to_string_lossy().into_owned(),
            size: metadata.len(),
            is_dir: metadata.is_dir(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        })
    }
}

/// Directory listing page.
struct Listing<'a> {
    title: &'a str,
    entries: &'a [ListEntry],
}

impl<'a> std::fmt::Display for Listing<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "<html><head><title>Index of {}</title></head><body>\n\
            <h1>Index of {}</h1>\n\
            <table>\n\
            <tr><th>Name</th><th>Last modified</th><th>Size</th></tr>",
            HtmlEscaped(self.title),
            HtmlEscaped(self.title)
        )?;
        for entry in self.entries {
            let slash = if entry.is_dir { "/" } else { "" };
            write!(
                f,
                "<tr><td><a href=\"{}{}\">{}{}</a></td><td>{}</td>",
                UrlEncoded(&entry.name),
                slash,
                HtmlEscaped(&entry.name),
                slash,
                ListingDate(entry.modified)
            )?;
            if entry.is_dir {
                writeln!(f, "<td>[DIR]</td></tr>")?;
            } else {
                writeln!(f, "<td>{}</td></tr>", ListingSize(entry.size))?;
            }
        }
        writeln!(
            f,
            "</table>\n<hr>\n{}/{}\n</body></html>",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        )
    }
}

struct Connection<'a> {
    server: &'a Server,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    peer: SocketAddr,
    listener: usize,
}

impl<'a> Connection<'a> {
    fn keep_alive_loop(&mut self) {
        loop {
            let request = match read_request(&mut self.reader) {
                Ok(Some(request)) => request,
                Ok(None) => return,
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    log::debug!("{}: {}", self.peer, e);
                    let mut exchange = Exchange::closing();
                    self.send_reply(&mut exchange, Reply::error(400, "Request too large."))
                        .ok();
                    return;
                }
                Err(e) => {
                    log::debug!("{}: failed to read request: {}", self.peer, e);
                    return;
                }
            };
            log::info!("{} \"{}\"", self.peer, LogEncoded(&request.line));

            let mut exchange = Exchange::new(&request);
            if let Err(e) = self.respond(&request, &mut exchange) {
                log::warn!("{} \"{}\": {:#}", self.peer, LogEncoded(&request.line), e);
                exchange.keep_alive = false;
                if exchange.status == 0 {
                    let reply = Reply::error(500, "The server encountered an internal error.");
                    self.send_reply(&mut exchange, reply).ok();
                }
            }
            self.log_access(&request, &exchange);

            if exchange.keep_alive && exchange.unread_body > 0 {
                exchange.keep_alive = self.drain(exchange.unread_body);
            }
            if !exchange.keep_alive {
                return;
            }
        }
    }

    fn log_access(&self, request: &Request, exchange: &Exchange) {
        if exchange.status == 0 {
            return;
        }
        self.server.access_log.record(&AccessRecord {
            client: self.peer.ip(),
            user: exchange.user.as_deref(),
            request_line: &request.line,
            status: exchange.status,
            bytes_sent: exchange.bytes_sent,
            referer: request.headers.referer.as_deref(),
            user_agent: request.headers.user_agent.as_deref(),
        });
    }

    /// Discard unread request body bytes. Returns false if the connection cannot be reused.
    fn drain(&mut self, count: u64) -> bool {
        match io::copy(&mut self.reader.by_ref().take(count), &mut io::sink()) {
            Ok(drained) if drained == count => true,
            Ok(drained) => {
                log::debug!("{}: body ended after {} of {} bytes", self.peer, drained, count);
                false
            }
            Err(e) => {
                log::debug!("{}: failed to drain body: {}", self.peer, e);
                false
            }
        }
    }

    fn respond(&mut self, request: &Request, exchange: &mut Exchange) -> Result<()> {
        match self.route(request, exchange) {
            Route::Reply(reply) => self.send_reply(exchange, reply),
            Route::Listing { dir, request_path } => {
                self.send_listing(exchange, &dir, &request_path)
            }
            Route::Static { path, request_path } => {
                self.send_file(request, exchange, &path, &request_path)
            }
            Route::Gateway(script) => self.run_gateway(request, exchange, &script),
        }
    }

    fn peer_allowed(&self) -> bool {
        let allowed = &self.server.config.accept_ips;
        if allowed.is_empty() {
            return true;
        }
        let ip = match self.peer.ip() {
            IpAddr::V6(ip) => ip.to_ipv4_mapped().map_or(IpAddr::V6(ip), IpAddr::V4),
            ip => ip,
        };
        allowed
            .iter()
            .any(|address| address.parse::<IpAddr>().map_or(false, |address| address == ip))
    }

    /// Decide how to answer a request.
    fn route(&self, request: &Request, exchange: &mut Exchange) -> Route {
        let config = &self.server.config;
        let root = &self.server.root;

        if !self.peer_allowed() {
            log::info!("refusing {}: not in allow list", self.peer.ip());
            exchange.keep_alive = false;
            return Route::Reply(Reply::error(403, "You are not allowed to access this server."));
        }
        if !request.is_well_formed() {
            exchange.keep_alive = false;
            return Route::Reply(Reply::error(
                400,
                "You sent a request that the server couldn't understand.",
            ));
        }
        if !matches!(request.method.as_str(), "GET" | "HEAD" | "POST") {
            exchange.keep_alive = false;
            return Route::Reply(Reply::error(
                400,
                "The method you specified is not supported.",
            ));
        }

        let script_name = request.script_name();
        let script_name = match config.aliases.get(script_name) {
            Some(alias) => {
                log::debug!("alias {} -> {}", script_name, alias);
                alias.as_str()
            }
            None => script_name,
        };
        let decoded = match String::from_utf8(url_decode(script_name)) {
            Ok(decoded) => decoded,
            Err(_) => {
                return Route::Reply(Reply::error(400, "The requested path is not valid UTF-8."))
            }
        };
        let request_path = canonicalize(&decoded);
        if request_path != decoded {
            return Route::Reply(Reply::redirect(with_query(
                encode_path(&request_path),
                request.query_string(),
            )));
        }

        match authorize(
            &config.basic_auths,
            &config.accept_lists,
            &request.method,
            &request_path,
            request.credentials.as_ref(),
        ) {
            Decision::Allowed => {
                exchange.user = request.credentials.as_ref().map(|c| c.user.clone());
            }
            Decision::Unauthorized(challenge) => {
                return Route::Reply(Reply::unauthorized(&challenge));
            }
        }

        let path = root.join(&request_path);
        if !root.contains(&path) {
            log::info!("refusing {}: resolves outside the document root", request_path);
            return Route::Reply(Reply::error(403, "You don't have permission to access this."));
        }
        if let Some(script) = self.find_script(&request_path) {
            return Route::Gateway(script);
        }

        match fs::metadata(&path) {
            Ok(metadata) if metadata.is_dir() => {
                if !request_path.ends_with('/') {
                    return Route::Reply(Reply::redirect(with_query(
                        format!("{}/", encode_path(&request_path)),
                        request.query_string(),
                    )));
                }
                for page in &config.index_pages {
                    let index_path = format!("{}{}", request_path, page);
                    let candidate = root.join(&index_path);
                    if !candidate.is_file() || !root.contains(&candidate) {
                        continue;
                    }
                    if let Some(script) = self.find_script(&index_path) {
                        return Route::Gateway(script);
                    }
                    return Route::Static {
                        path: candidate,
                        request_path: index_path,
                    };
                }
                Route::Listing {
                    dir: path,
                    request_path,
                }
            }
            Ok(metadata) if metadata.is_file() => Route::Static { path, request_path },
            _ => Route::Reply(Reply::error(
                404,
                "The URL you requested was not found.",
            )),
        }
    }

    /// Walk down the request path and return the first regular file if it is a CGI script.
    fn find_script(&self, request_path: &str) -> Option<Script> {
        let config = &self.server.config;
        let mut name = String::with_capacity(request_path.len());
        for segment in request_path.split('/').filter(|segment| !segment.is_empty()) {
            name.push('/');
            name.push_str(segment);
            let path = self.server.root.join(&name);
            let metadata = fs::metadata(&path).ok()?;
            if metadata.is_dir() {
                continue;
            }
            if !metadata.is_file() {
                return None;
            }
            let interpreter = match config.mime_map.cgi_interpreter(&name) {
                Some(interpreter) => interpreter.map(str::to_string),
                None if config.spawn_executable && metadata.permissions().mode() & 0o111 != 0 => {
                    None
                }
                None => return None,
            };
            let path_info = request_path[name.len()..].to_string();
            return Some(Script {
                path,
                interpreter,
                name,
                path_info,
            });
        }
        None
    }

    /// Send the status line and headers. `headers` holds complete lines ending in CRLF.
    fn write_head(
        &mut self,
        exchange: &mut Exchange,
        status: u16,
        reason: &str,
        headers: &str,
    ) -> Result<()> {
        exchange.status = status;
        let head = format!(
            "{} {} {}\r\n\
            Date: {}\r\n\
            Server: {}/{}\r\n\
            {}\
            {}\
            \r\n",
            exchange.protocol,
            status,
            reason,
            HttpDate(SystemTime::now()),
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            headers,
            self.keep_alive_header(exchange.keep_alive),
        );
        self.writer
            .write_all(head.as_bytes())
            .context("failed to send response head")
    }

    fn keep_alive_header(&self, keep_alive: bool) -> String {
        if !keep_alive {
            return "Connection: close\r\n".to_string();
        }
        match self.server.config.timeout {
            Some(timeout) => format!(
                "Connection: keep-alive\r\nKeep-Alive: timeout={}\r\n",
                timeout.as_secs()
            ),
            None => "Connection: keep-alive\r\n".to_string(),
        }
    }

    fn write_body(&mut self, exchange: &mut Exchange, body: &[u8]) -> Result<()> {
        if exchange.head_only {
            return Ok(());
        }
        self.writer
            .write_all(body)
            .context("failed to send response body")?;
        exchange.bytes_sent += body.len() as u64;
        Ok(())
    }

    /// Copy `reader` to the client, at most `limit` bytes when given.
    fn stream_body<R: Read>(
        &mut self,
        exchange: &mut Exchange,
        reader: &mut R,
        limit: Option<u64>,
    ) -> Result<u64> {
        if exchange.head_only {
            return Ok(0);
        }
        let copied = match limit {
            Some(limit) => io::copy(&mut reader.take(limit), &mut self.writer),
            None => io::copy(reader, &mut self.writer),
        }
        .context("failed to send response body")?;
        exchange.bytes_sent += copied;
        Ok(copied)
    }

    fn send_reply(&mut self, exchange: &mut Exchange, reply: Reply) -> Result<()> {
        let headers = format!(
            "{}Content-Type: {}\r\nContent-Length: {}\r\n",
            reply.headers,
            reply.content_type,
            reply.body.len()
        );
        self.write_head(exchange, reply.status, reason_phrase(reply.status), &headers)?;
        self.write_body(exchange, reply.body.as_bytes())
    }

    fn send_listing(
        &mut self,
        exchange: &mut Exchange,
        dir: &Path,
        request_path: &str,
    ) -> Result<()> {
        let mut entries: Vec<ListEntry> = fs::read_dir(dir)
            .with_context(|| format!("failed to list directory {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| ListEntry::from_dir_entry(&entry))
            .collect();
        if request_path != "/" {
            if let Ok(metadata) = fs::metadata(dir.join("..")) {
                entries.push(ListEntry {
                    name: "..".to_string(),
                    size: metadata.len(),
                    is_dir: true,
                    modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        log::debug!("listing {} entries of {}", entries.len(), dir.display());

        let body = Listing {
            title: request_path,
            entries: &entries,
        }
        .to_string();
        let headers = format!(
            "Content-Type: text/html; charset={}\r\nContent-Length: {}\r\n",
            self.server.config.charset,
            body.len()
        );
        self.write_head(exchange, 200, "OK", &headers)?;
        self.write_body(exchange, body.as_bytes())
    }

    fn send_file(
        &mut self,
        request: &Request,
        exchange: &mut Exchange,
        path: &Path,
        request_path: &str,
    ) -> Result<()> {
        let mut handle = match ResourceHandle::open(path) {
            Ok(handle) => handle,
            Err(e) => {
                log::debug!("failed to open {}: {}", path.display(), e);
                let reply = Reply::error(404, "The URL you requested was not found.");
                return self.send_reply(exchange, reply);
            }
        };
        let modified = fs::metadata(path)
            .and_then(|metadata| metadata.modified())
            .with_context(|| format!("failed to stat {}", path.display()))?;
        let last_modified = HttpDate(modified).to_string();

        if request.headers.if_modified_since.as_deref() == Some(last_modified.as_str()) {
            return self.write_head(exchange, 304, reason_phrase(304), "");
        }

        let size = handle.size().unwrap_or(0);
        let headers = format!(
            "Content-Type: {}\r\n\
            Content-Length: {}\r\n\
            Last-Modified: {}\r\n",
            self.server.config.mime_map.content_type(request_path),
            size,
            last_modified
        );
        self.write_head(exchange, 200, "OK", &headers)?;
        if exchange.head_only {
            return Ok(());
        }

        let sent = handle.send_file(self.writer.as_raw_fd(), size);
        exchange.bytes_sent += sent;
        if sent < size {
            let copied = self.stream_body(exchange, &mut handle, Some(size - sent))?;
            if sent + copied < size {
                // the file shrank; the client is still waiting for the rest
                exchange.keep_alive = false;
            }
        }
        Ok(())
    }

    fn cgi_environment(
        &self,
        request: &Request,
        exchange: &Exchange,
        script: &Script,
    ) -> Vec<(String, String)> {
        let server = self.server;
        let config = &server.config;
        let mut env: Vec<(String, String)> = vec![
            (
                "SERVER_SOFTWARE".to_string(),
                format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            ),
            ("SERVER_PROTOCOL".to_string(), "HTTP/1.1".to_string()),
            (
                "SERVER_NAME".to_string(),
                config.host.clone().unwrap_or_else(|| server.hostname.clone()),
            ),
            (
                "SERVER_ADDR".to_string(),
                server.addresses.get(self.listener).cloned().unwrap_or_default(),
            ),
            ("SERVER_PORT".to_string(), config.port.to_string()),
            ("REMOTE_ADDR".to_string(), self.peer.ip().to_string()),
            ("REMOTE_PORT".to_string(), self.peer.port().to_string()),
            ("REQUEST_METHOD".to_string(), request.method.clone()),
            ("REQUEST_URI".to_string(), request.target.clone()),
            (
                "SCRIPT_FILENAME".to_string(),
                script.path.to_string_lossy().into_owned(),
            ),
            ("SCRIPT_NAME".to_string(), script.name.clone()),
            ("QUERY_STRING".to_string(), request.query_string().to_string()),
            ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
            ("REDIRECT_STATUS".to_string(), "1".to_string()),
        ];
        let mut add = |name: &str, value: Option<&str>| {
            if let Some(value) = value {
                env.push((name.to_string(), value.to_string()));
            }
        };
        add("REMOTE_USER", exchange.user.as_deref());
        add(
            "PATH_INFO",
            Some(script.path_info.as_str()).filter(|info| !info.is_empty()),
        );
        let inherited_path = std::env::var("PATH").ok();
        add("PATH", config.cgi_path.as_deref().or(inherited_path.as_deref()));

        let headers = &request.headers;
        add("HTTP_HOST", headers.host.as_deref());
        add("HTTP_USER_AGENT", headers.user_agent.as_deref());
        add("HTTP_CONNECTION", headers.connection.as_deref());
        add("HTTP_AUTHORIZATION", headers.authorization.as_deref());
        add("HTTP_COOKIE", headers.cookie.as_deref());
        add("HTTP_REFERER", headers.referer.as_deref());
        add("HTTP_ACCEPT", headers.accept.as_deref());
        if request.method == "POST" {
            add("CONTENT_TYPE", headers.content_type.as_deref());
            let content_length = request.content_length().to_string();
            add("CONTENT_LENGTH", Some(content_length.as_str()));
        }
        for (name, value) in &config.environment {
            add(name.as_str(), Some(value.as_str()));
        }
        env
    }

    fn run_gateway(
        &mut self,
        request: &Request,
        exchange: &mut Exchange,
        script: &Script,
    ) -> Result<()> {
        let env = self.cgi_environment(request, exchange, script);
        let mut argv: Vec<String> = script.interpreter.iter().cloned().collect();
        argv.push(script.path.to_string_lossy().into_owned());
        let query = request.query_string();
        if !query.is_empty() && !query.contains('=') {
            argv.extend(
                query
                    .split('+')
                    .map(|arg| String::from_utf8_lossy(&url_decode(arg)).into_owned()),
            );
        }
        if self.server.config.verbosity >= 4 {
            log::trace!("spawning {:?} with environment {:?}", argv, env);
        }

        let dir = script.path.parent().unwrap_or(self.server.root.path());
        let mut handle = gateway::spawn(
            &self.server.reaper,
            &argv,
            &env,
            dir,
            self.server.config.timeout,
        )?;
        log::debug!("started {} as process {:?}", script.path.display(), handle.pid());

        if !self.feed_body(exchange, &mut handle) {
            drop(handle);
            exchange.keep_alive = false;
            let reply = Reply::error(400, "The request body was shorter than announced.");
            return self.send_reply(exchange, reply);
        }
        handle.close_writer();

        let mut output = BufReader::new(handle);
        let first_byte = output
            .fill_buf()
            .context("failed to read script output")?
            .first()
            .copied();
        if first_byte == Some(b'<') {
            // no header block: pass the output through untouched
            log::debug!("{} sent no headers", script.path.display());
            exchange.status = 200;
            exchange.keep_alive = false;
            self.stream_body(exchange, &mut output, None)?;
            return Ok(());
        }

        let preamble = read_preamble(&mut output)?;
        exchange.keep_alive = exchange.keep_alive
            && preamble.keep_alive
            && preamble.content_length.is_some();
        self.write_head(exchange, preamble.status, &preamble.reason, &preamble.headers)?;
        let copied = self.stream_body(exchange, &mut output, preamble.content_length)?;
        if let Some(content_length) = preamble.content_length {
            if !exchange.head_only && copied < content_length {
                exchange.keep_alive = false;
            }
        }
        Ok(())
    }

    /// Copy the request body into the script's stdin. Returns false if the client sent less
    /// than it announced.
    fn feed_body(&mut self, exchange: &mut Exchange, handle: &mut ResourceHandle) -> bool {
        let mut buf = [0; BUFFER_SIZE];
        let mut script_reading = true;
        while exchange.unread_body > 0 {
            let want = exchange.unread_body.min(buf.len() as u64) as usize;
            let read = match self.reader.read(&mut buf[..want]) {
                Ok(0) => return false,
                Ok(read) => read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("{}: failed to read request body: {}", self.peer, e);
                    return false;
                }
            };
            exchange.unread_body -= read as u64;
            if script_reading {
                if let Err(e) = handle.write_all(&buf[..read]) {
                    // keep consuming the body so the connection stays in sync
                    log::debug!("script stopped reading its input: {}", e);
                    script_reading = false;
                }
            }
        }
        true
    }
}

fn with_query(location: String, query: &str) -> String {
    if query.is_empty() {
        location
    } else {
        format!("{}?{}", location, query)
    }
}

/// Header block a CGI script writes before its body.
#[derive(Debug, PartialEq, Eq)]
struct Preamble {
    status: u16,
    reason: String,
    /// Header lines to forward, each ending in CRLF.
    headers: String,
    keep_alive: bool,
    content_length: Option<u64>,
}

fn read_preamble<R: BufRead>(output: &mut R) -> Result<Preamble> {
    let mut preamble = Preamble {
        status: 200,
        reason: reason_phrase(200).to_string(),
        headers: String::new(),
        keep_alive: false,
        content_length: None,
    };
    let mut status_given = false;
    let mut basic_challenge = false;

    while let Some(line) = read_line(output).context("failed to read script headers")? {
        if line.is_empty() {
            break;
        }
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (trim(name), trim(value)),
            None => {
                log::debug!("ignoring script header line {:?}", line);
                continue;
            }
        };
        match name.to_ascii_lowercase().as_str() {
            "status" => {
                let (code, reason) = value.split_once(' ').unwrap_or((value, ""));
                match code.parse::<u16>() {
                    Ok(code) if (100..1000).contains(&code) => {
                        preamble.status = code;
                        preamble.reason = match trim(reason) {
                            "" => reason_phrase(code).to_string(),
                            reason => reason.to_string(),
                        };
                        status_given = true;
                    }
                    _ => log::debug!("ignoring invalid script status {:?}", value),
                }
                continue;
            }
            "connection" => {
                preamble.keep_alive = value.eq_ignore_ascii_case("keep-alive");
                continue;
            }
            "content-length" => preamble.content_length = value.parse().ok(),
            "www-authenticate" => {
                basic_challenge |= strip_prefix_ignore_case(value, "basic").is_some()
            }
            _ => {}
        }
        preamble.headers.push_str(name);
        preamble.headers.push_str(": ");
        preamble.headers.push_str(value);
        preamble.headers.push_str("\r\n");
    }

    if basic_challenge && !status_given {
        preamble.status = 401;
        preamble.reason = reason_phrase(401).to_string();
    }
    Ok(preamble)
}
