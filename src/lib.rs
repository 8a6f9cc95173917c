pub mod auth;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod listener;
pub mod logging;
pub mod path;
pub mod request;
pub mod text;

use anyhow::{Context, Result};

use crate::config::ServerConfig;
use crate::gateway::Reaper;
use crate::logging::AccessLog;
use crate::path::DocumentRoot;

/// State shared by every connection thread. Read-only once the server is running, apart from
/// the access log and the reaper, which synchronize internally.
#[derive(Debug)]
pub struct Server {
    pub config: ServerConfig,
    pub root: DocumentRoot,
    pub reaper: Reaper,
    pub access_log: AccessLog,
    /// This machine's name, used when no host is configured.
    pub hostname: String,
    /// Address of each listener, by listener index.
    pub addresses: Vec<String>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        access_log: AccessLog,
        hostname: String,
        addresses: Vec<String>,
    ) -> Result<Self> {
        let root = DocumentRoot::new(&config.root).with_context(|| {
            format!("failed to resolve document root {}", config.root.display())
        })?;
        Ok(Self {
            config,
            root,
            reaper: Reaper::start()?,
            access_log,
            hostname,
            addresses,
        })
    }
}
