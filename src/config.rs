//! Server configuration: command line flags, the INI config file, and credential files.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::auth::{AcceptList, BasicAuthRule};
use crate::logging::LogTarget;
use crate::text::{split_list, trim};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_CHARSET: &str = "utf-8";
const DEFAULT_MIME_TYPE: &str = "application/octet-stream";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_INDEX_PAGES: &[&str] = &["index.html", "index.php", "index.rb", "index.cgi"];

/// Interpreters used for script extensions when no config file is given.
const DEFAULT_CGI_HANDLERS: &[(&str, &str)] = &[
    ("cgi", "@/usr/bin/perl"),
    ("php", "@/usr/bin/php-cgi"),
    ("rb", "@/usr/bin/ruby"),
];

const DEFAULT_EXTENSIONS_MAP: &[&str] = &[
    "application/pdf         pdf",
    "application/wasm        wasm",
    "application/x-javascript js",
    "application/zip         zip",
    "image/gif               gif",
    "image/jpeg              jpeg jpe jpg",
    "image/png               png",
    "image/svg+xml           svg",
    "text/css                css",
    "text/html               html htm",
    "text/plain              txt asc",
    "text/xml                xml xsl",
    "video/mp4               mp4",
];

/// What to do with files of a given extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handler {
    /// Serve the file with this content type.
    Static(String),
    /// Run the file as a CGI script, through an interpreter or directly when `None`.
    Executable(Option<String>),
}

impl Handler {
    /// Parse a `mime/types` value: a content type, or `@` optionally followed by an interpreter.
    pub fn parse(value: &str) -> Self {
        match value.strip_prefix('@') {
            Some("") => Self::Executable(None),
            Some(interpreter) => Self::Executable(Some(interpreter.to_string())),
            None => Self::Static(value.to_string()),
        }
    }
}

/// Extension to handler table.
#[derive(Debug, Clone)]
pub struct MimeMap {
    handlers: HashMap<String, Handler>,
    default_mimetype: String,
}

impl MimeMap {
    /// Add line from an extension map.
    fn add_mimetype_line(&mut self, line: &str) {
        let mut fields = line
            .split(|c| matches!(c, ' ' | '\t'))
            .filter(|field| !field.is_empty());
        let mimetype = match fields.next() {
            Some(mimetype) => mimetype,
            None => return, // empty line
        };
        if mimetype.starts_with('#') {
            return; // comment
        }
        for extension in fields {
            self.insert(extension, Handler::Static(mimetype.to_string()));
        }
    }

    pub fn insert(&mut self, extension: &str, handler: Handler) {
        self.handlers.insert(extension.to_ascii_lowercase(), handler);
    }

    /// Handler for a file name or path, by its extension.
    pub fn handler(&self, name: &str) -> Option<&Handler> {
        let file_name = name.rsplit('/').next().unwrap_or(name);
        let (_, extension) = file_name.rsplit_once('.')?;
        self.handlers.get(&extension.to_ascii_lowercase())
    }

    /// Interpreter setting when `name` has a CGI extension.
    pub fn cgi_interpreter(&self, name: &str) -> Option<Option<&str>> {
        match self.handler(name)? {
            Handler::Executable(interpreter) => Some(interpreter.as_deref()),
            Handler::Static(_) => None,
        }
    }

    /// Content type to serve `name` with.
    pub fn content_type(&self, name: &str) -> &str {
        match self.handler(name) {
            Some(Handler::Static(mimetype)) => mimetype,
            _ => &self.default_mimetype,
        }
    }
}

impl Default for MimeMap {
    /// Create MimeMap using the default extension map.
    fn default() -> Self {
        let mut mime_map = Self {
            handlers: HashMap::new(),
            default_mimetype: DEFAULT_MIME_TYPE.to_string(),
        };
        for line in DEFAULT_EXTENSIONS_MAP {
            mime_map.add_mimetype_line(line);
        }
        mime_map
    }
}

/// Which address family to listen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// Any family; IPv4 only when no host is given.
    Unspecified,
    Inet,
    Inet6,
}

/// Everything the listener and request engine need. Immutable once the server starts.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub root: PathBuf,
    pub host: Option<String>,
    pub port: u16,
    pub family: AddressFamily,
    pub index_pages: Vec<String>,
    pub mime_map: MimeMap,
    /// Request path to replacement path, matched exactly.
    pub aliases: HashMap<String, String>,
    /// Extra variables passed to every CGI script.
    pub environment: BTreeMap<String, String>,
    pub basic_auths: Vec<BasicAuthRule>,
    pub accept_lists: Vec<AcceptList>,
    /// Client addresses allowed to connect; empty allows everyone.
    pub accept_ips: Vec<String>,
    pub charset: String,
    pub verbosity: u32,
    /// Run any executable file under the root as a CGI script.
    pub spawn_executable: bool,
    pub timeout: Option<Duration>,
    pub chroot: Option<PathBuf>,
    pub user: Option<String>,
    /// `PATH` handed to CGI scripts; the server's own `PATH` when unset.
    pub cgi_path: Option<String>,
    pub log_target: LogTarget,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            host: None,
            port: DEFAULT_PORT,
            family: AddressFamily::Unspecified,
            index_pages: DEFAULT_INDEX_PAGES.iter().map(|s| s.to_string()).collect(),
            mime_map: MimeMap::default(),
            aliases: HashMap::new(),
            environment: BTreeMap::new(),
            basic_auths: Vec::new(),
            accept_lists: Vec::new(),
            accept_ips: Vec::new(),
            charset: DEFAULT_CHARSET.to_string(),
            verbosity: 0,
            spawn_executable: false,
            timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            chroot: None,
            user: None,
            cgi_path: None,
            log_target: LogTarget::Stdout,
        }
    }
}

impl ServerConfig {
    /// Build the configuration from command line arguments (without the program name).
    ///
    /// Returns `None` when `--help` was requested. Settings from a config file given with
    /// `--config` are applied after the flags and take precedence over them.
    pub fn from_args<I>(args: I) -> Result<Option<Self>>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = Self::default();
        let mut config_file = None;
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-p" | "--port" => {
                    let number = args.next().context("missing number after --port")?;
                    config.port = number
                        .parse()
                        .with_context(|| format!("port number {} is invalid", number))?;
                }
                "-d" | "--root" => {
                    config.root = PathBuf::from(args.next().context("missing directory after --root")?);
                }
                "-c" | "--config" => {
                    config_file = Some(PathBuf::from(
                        args.next().context("missing filename after --config")?,
                    ));
                }
                "-a" | "--addr" => {
                    config.host = Some(args.next().context("missing host after --addr")?);
                }
                "-v" | "--verbose" => config.verbosity += 1,
                "-x" | "--spawn-exec" => config.spawn_executable = true,
                "--ipv4" => config.family = AddressFamily::Inet,
                "--ipv6" => config.family = AddressFamily::Inet6,
                "--timeout" => {
                    let number = args.next().context("missing number after --timeout")?;
                    config.timeout = parse_timeout(&number)?;
                }
                "--log" => {
                    config.log_target = LogTarget::File(PathBuf::from(
                        args.next().context("missing filename after --log")?,
                    ));
                }
                "--syslog" => config.log_target = LogTarget::Syslog,
                "-h" | "--help" => return Ok(None),
                // -vv, -vvv
                verbose
                    if verbose.len() > 1
                        && verbose.starts_with('-')
                        && verbose[1..].chars().all(|c| c == 'v') =>
                {
                    config.verbosity += verbose.len() as u32 - 1;
                }
                _ => {
                    return Err(anyhow!("unknown argument `{}'", arg));
                }
            }
        }

        match config_file {
            Some(path) => {
                let ini = Ini::load(&path)?;
                config.apply_ini(&ini, path.parent().unwrap_or_else(|| Path::new(".")))?;
            }
            None => {
                for (extension, handler) in DEFAULT_CGI_HANDLERS {
                    config.mime_map.insert(extension, Handler::parse(handler));
                }
            }
        }
        Ok(Some(config))
    }

    /// Apply settings from a parsed config file. Relative credential file paths are resolved
    /// against `base_dir`.
    pub fn apply_ini(&mut self, ini: &Ini, base_dir: &Path) -> Result<()> {
        if let Some(root) = ini.get("global", "root") {
            self.root = PathBuf::from(root);
        }
        if let Some(port) = ini.get("global", "port") {
            self.port = port
                .parse()
                .with_context(|| format!("port number {} is invalid", port))?;
        }
        if let Some(host) = ini.get("global", "host") {
            self.host = Some(host.to_string());
        }
        if let Some(pages) = ini.get("global", "indexpages") {
            self.index_pages = split_list(pages);
        }
        if let Some(charset) = ini.get("global", "charset") {
            self.charset = charset.to_string();
        }
        if let Some(chroot) = ini.get("global", "chroot") {
            self.chroot = Some(PathBuf::from(chroot));
        }
        if let Some(user) = ini.get("global", "user") {
            self.user = Some(user.to_string());
        }
        match ini.get("global", "debug") {
            Some("on") => self.verbosity = 1,
            Some(level) => {
                self.verbosity = level
                    .parse()
                    .with_context(|| format!("debug level {} is invalid", level))?
            }
            None => {}
        }
        if ini.get("global", "spawnexec") == Some("on") {
            self.spawn_executable = true;
        }
        if let Some(path) = ini.get("global", "path") {
            self.cgi_path = Some(path.to_string());
        }
        if let Some(timeout) = ini.get("global", "timeout") {
            self.timeout = parse_timeout(timeout)?;
        }

        for (path, replacement) in ini.section("request/aliases") {
            self.aliases.insert(path.clone(), replacement.clone());
        }
        for (extension, handler) in ini.section("mime/types") {
            self.mime_map.insert(extension, Handler::parse(handler));
        }
        for (name, value) in ini.section("request/environments") {
            self.environment.insert(name.clone(), value.clone());
        }
        for (target, value) in ini.section("authentication") {
            self.basic_auths
                .push(parse_auth_rule(target, value, base_dir)?);
        }
        for (prefix, users) in ini.section("authentication/accepts") {
            self.accept_lists.push(AcceptList {
                prefix: prefix.clone(),
                users: split_list(users),
            });
        }
        if let Some(ips) = ini.get("access/ips", "allow") {
            self.accept_ips = split_list(ips);
        }
        Ok(())
    }
}

fn parse_timeout(number: &str) -> Result<Option<Duration>> {
    let timeout_secs = number
        .parse::<u64>()
        .with_context(|| format!("timeout number {} is invalid", number))?;
    Ok(match timeout_secs {
        0 => None,
        timeout_secs => Some(Duration::from_secs(timeout_secs)),
    })
}

/// Parse an `authentication` entry: `target=methods,realm,credentials-file`.
fn parse_auth_rule(target: &str, value: &str, base_dir: &Path) -> Result<BasicAuthRule> {
    let mut fields = value.splitn(3, ',').map(trim);
    let methods = fields.next().unwrap_or("");
    let realm = fields.next().unwrap_or("");
    let users = match fields.next().filter(|file| !file.is_empty()) {
        Some(file) => load_credentials(&base_dir.join(file))?,
        None => Vec::new(),
    };
    Ok(BasicAuthRule {
        target: target.to_string(),
        methods: methods
            .split('/')
            .map(trim)
            .filter(|method| !method.is_empty())
            .map(|method| method.to_ascii_uppercase())
            .collect(),
        realm: realm.to_string(),
        users,
    })
}

/// Read `user:password` lines.
pub fn load_credentials(path: &Path) -> Result<Vec<(String, String)>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open credentials file {}", path.display()))?;
    let mut users = Vec::new();
    for line in BufReader::new(file).lines() {
        let line =
            line.with_context(|| format!("failed to read credentials file {}", path.display()))?;
        let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
        if line.is_empty() {
            continue;
        }
        match line.split_once(':') {
            Some((user, password)) => users.push((user.to_string(), password.to_string())),
            None => log::warn!("ignoring credentials line without ':' in {}", path.display()),
        }
    }
    Ok(users)
}

/// An INI-style file: `[section]` headers and `key=value` lines. Keys before the first header
/// belong to `global`; lines starting with `;` or `#` are comments. Entries keep file order.
#[derive(Debug, Default)]
pub struct Ini {
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl Ini {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let mut ini = Self::default();
        let mut section = "global".to_string();
        for line in text.lines() {
            let line = trim(line);
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = trim(name).to_string();
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                ini.entries_mut(&section)
                    .push((trim(key).to_string(), trim(value).to_string()));
            }
        }
        ini
    }

    fn entries_mut(&mut self, section: &str) -> &mut Vec<(String, String)> {
        let index = match self.sections.iter().position(|(name, _)| name == section) {
            Some(index) => index,
            None => {
                self.sections.push((section.to_string(), Vec::new()));
                self.sections.len() - 1
            }
        };
        &mut self.sections[index].1
    }

    /// Entries of a section in file order; empty when the section is missing.
    pub fn section(&self, name: &str) -> &[(String, String)] {
        self.sections
            .iter()
            .find(|(section, _)| section == name)
            .map(|(_, entries)| entries.as_slice())
            .unwrap_or(&[])
    }

    /// Last value for `key` in `section`.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section)
            .iter()
            .rev()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}
