use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::{chdir, chroot, setgid, setgroups, setuid, User};

use tinyhttpd_rs::config::ServerConfig;
use tinyhttpd_rs::listener;
use tinyhttpd_rs::logging::{self, AccessLog, LogSink};
use tinyhttpd_rs::Server;

const COPYRIGHT: &str = "copyright (c) 2021 tinyhttpd-rs contributors";

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

fn main() -> Result<()> {
    println!(
        "{}/{}, {}.",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        COPYRIGHT,
    );

    let mut args = std::env::args();
    let name = args.next().unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
    let mut config = match ServerConfig::from_args(args)? {
        Some(config) => config,
        None => {
            usage(&name);
            return Ok(());
        }
    };

    logging::init(config.verbosity)?;
    if config.verbosity >= 4 {
        log::trace!("arguments: {:?}", std::env::args().collect::<Vec<_>>());
        log::trace!("environment: {:?}", std::env::vars().collect::<Vec<_>>());
    }
    log::debug!(
        "root {}, port {}, {} auth rules",
        config.root.display(),
        config.port,
        config.basic_auths.len()
    );

    let listeners = listener::bind(&config)?;
    let addresses = listeners
        .iter()
        .map(|listener| listener.addr.ip().to_string())
        .collect();
    let hostname = listener::hostname();
    let log_sink = LogSink::open(&config.log_target)?;

    // set signal handlers
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;

    // Look the user up while /etc/passwd is still reachable.
    let user = config
        .user
        .as_deref()
        .map(|name| {
            User::from_name(name)
                .context("getpwnam failed")?
                .with_context(|| format!("no such user: `{}'", name))
        })
        .transpose()?;

    if let Some(jail) = config.chroot.clone() {
        // Force reading the local timezone before chroot makes this impossible.
        Local::now();

        let jail = fs::canonicalize(&jail)
            .with_context(|| format!("failed to resolve chroot directory {}", jail.display()))?;
        let root = fs::canonicalize(&config.root).with_context(|| {
            format!("failed to resolve document root {}", config.root.display())
        })?;
        chdir(jail.as_path())
            .with_context(|| format!("failed to change working directory to {}", jail.display()))?;
        chroot(jail.as_path())
            .with_context(|| format!("failed to change root directory to {}", jail.display()))?;
        println!("chrooted to `{}'", jail.display());
        config.root = root_inside_jail(&root, &jail)?;
    }

    if let Some(user) = user {
        setgroups(&[user.gid])
            .with_context(|| format!("failed to set supplementary group IDs to [{}]", user.gid))?;
        setgid(user.gid).with_context(|| format!("failed to set group ID to {}", user.gid))?;
        println!("set gid to {}", user.gid);
        setuid(user.uid).with_context(|| format!("failed to set user ID to {}", user.uid))?;
        println!("set uid to {}", user.uid);
    }

    let server = Arc::new(Server::new(
        config,
        AccessLog::new(log_sink),
        hostname,
        addresses,
    )?);
    log::info!("serving {}", server.root.path().display());

    // main loop
    listener::serve(&listeners, server, is_running)?;

    println!("shutting down");
    Ok(())
}

/// Express `root` as a path inside `jail`.
fn root_inside_jail(root: &Path, jail: &Path) -> Result<PathBuf> {
    let inside = root.strip_prefix(jail).map_err(|_| {
        anyhow!(
            "document root {} is outside chroot directory {}",
            root.display(),
            jail.display()
        )
    })?;
    Ok(Path::new("/").join(inside))
}

fn usage(argv0: &str) {
    print!(
        "usage:\t{} [flags]\n\n\
        flags:\t-p, --port number (default: 8080)\n\
        \t\tSpecifies which port to listen on for connections.\n\n\
        \t-d, --root directory (default: current directory)\n\
        \t\tServe files from this directory.\n\n\
        \t-c, --config filename\n\
        \t\tRead settings from an INI file. They override flags.\n\n\
        \t-a, --addr host\n\
        \t\tListen on every address the host resolves to.\n\n\
        \t--ipv4, --ipv6\n\
        \t\tOnly listen on addresses of this family.\n\n\
        \t-x, --spawn-exec\n\
        \t\tRun any executable file as a CGI script.\n\n\
        \t--timeout secs (default: 30)\n\
        \t\tSocket send and receive timeout. 0 disables it.\n\n\
        \t--log filename (default: stdout)\n\
        \t\tSpecifies which file to append the request log to.\n\n\
        \t--syslog\n\
        \t\tUse syslog for request log.\n\n\
        \t-v, --verbose\n\
        \t\tLog more. Repeat for more detail.\n\n",
        argv0
    );
}
