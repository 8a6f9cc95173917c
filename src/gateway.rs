//! Byte sources for responses: plain files and CGI subprocesses.
//!
//! A [`ResourceHandle`] is released when it is dropped, so every exit path of the request engine
//! closes the file or both pipe ends exactly once. Spawned children are handed to the
//! [`Reaper`], which owns their process identity from then on.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd::pipe2;

/// How often the reaper polls children that are still running.
const REAP_INTERVAL: Duration = Duration::from_millis(100);

/// Microseconds a child sleeps between fork and exec.
const SPAWN_YIELD_USECS: libc::c_uint = 500;

/// A readable (and, for subprocesses, writable) response source.
#[derive(Debug)]
pub enum ResourceHandle {
    File { file: File, size: u64 },
    Process(ProcessPipes),
}

/// Both ends of a CGI subprocess: its stdin, and its merged stdout/stderr.
#[derive(Debug)]
pub struct ProcessPipes {
    pid: u32,
    stdin: Option<ChildStdin>,
    output: File,
    write_timeout: Option<Duration>,
}

impl ResourceHandle {
    /// Open a regular file for reading.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self::File { file, size })
    }

    /// Total size when known in advance; `None` means read until EOF.
    pub fn size(&self) -> Option<u64> {
        match self {
            Self::File { size, .. } => Some(*size),
            Self::Process(_) => None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::File { .. } => None,
            Self::Process(pipes) => Some(pipes.pid),
        }
    }

    /// Feed bytes to the subprocess's stdin.
    ///
    /// The pipe is non-blocking; when it is full this waits for the child to drain it, for at
    /// most the configured timeout per wait.
    pub fn write_all(&mut self, mut data: &[u8]) -> io::Result<()> {
        let pipes = match self {
            Self::File { .. } => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "cannot write to a file resource",
                ))
            }
            Self::Process(pipes) => pipes,
        };
        let stdin = pipes.stdin.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "subprocess stdin already closed")
        })?;
        while !data.is_empty() {
            match stdin.write(data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => data = &data[written..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_writable(stdin.as_raw_fd(), pipes.write_timeout)?
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Close the subprocess's stdin so it sees EOF. Does nothing for files.
    pub fn close_writer(&mut self) {
        if let Self::Process(pipes) = self {
            pipes.stdin = None;
        }
    }

    /// Release the handle. Equivalent to dropping it.
    pub fn close(self) {}

    /// Copy up to `count` bytes straight from the file to `out_fd` with `sendfile`.
    ///
    /// Returns the number of bytes sent; zero when the handle is not a file or the kernel
    /// refuses, in which case the caller copies through a buffer instead.
    pub fn send_file(&mut self, out_fd: RawFd, count: u64) -> u64 {
        let file = match self {
            Self::File { file, .. } => file,
            Self::Process(_) => return 0,
        };
        let mut total = 0;
        while total < count {
            let chunk = usize::try_from(count - total)
                .unwrap_or(usize::MAX)
                .min(SENDFILE_SIZE_LIMIT);
            match sendfile64(out_fd, file.as_raw_fd(), None, chunk) {
                Ok(0) => break,
                Ok(sent) => total += sent as u64,
                Err(nix::Error::Sys(Errno::EINTR)) => {}
                Err(e) => {
                    log::debug!("sendfile failed after {} bytes: {}", total, e);
                    break;
                }
            }
        }
        total
    }
}

impl Read for ResourceHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::File { file, .. } => file.read(buf),
            Self::Process(pipes) => pipes.output.read(buf),
        }
    }
}

// Limit size per syscall.
const SENDFILE_SIZE_LIMIT: usize = 1 << 20;

/// Safe wrapper for `libc::sendfile64`.
fn sendfile64(
    out_fd: RawFd,
    in_fd: RawFd,
    offset: Option<&mut libc::off64_t>,
    count: usize,
) -> nix::Result<usize> {
    let offset = offset
        .map(|offset| offset as *mut _)
        .unwrap_or(std::ptr::null_mut());
    let ret = unsafe { libc::sendfile64(out_fd, in_fd, offset, count) };
    Errno::result(ret).map(|r| r as usize)
}

/// Block until `fd` accepts writes, or fail with `TimedOut`.
///
/// Uses `poll` because pipe descriptors of busy servers go past `FD_SETSIZE`.
fn wait_writable(fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
    let timeout_ms = timeout.map_or(-1, |timeout| {
        libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX)
    });
    let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
    match poll(&mut fds, timeout_ms) {
        Ok(0) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "timed out writing to subprocess",
        )),
        Ok(_) | Err(nix::Error::Sys(Errno::EINTR)) => Ok(()),
        Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
    }
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Spawn `argv` with exactly the environment `env`, running in `dir`.
///
/// The child gets its own session, reads the request body from a pipe, and writes stdout and
/// stderr into a single pipe that the returned handle reads.
pub fn spawn(
    reaper: &Reaper,
    argv: &[String],
    env: &[(String, String)],
    dir: &Path,
    write_timeout: Option<Duration>,
) -> Result<ResourceHandle> {
    let (program, args) = argv.split_first().context("empty command line")?;

    let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC).context("failed to create pipe")?;
    let output = unsafe { File::from_raw_fd(read_fd) };
    let stdout_writer = unsafe { File::from_raw_fd(write_fd) };
    let stderr_writer = stdout_writer
        .try_clone()
        .context("failed to duplicate pipe")?;

    let child = {
        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(env.iter().map(|(name, value)| (name, value)))
            .current_dir(dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(stdout_writer))
            .stderr(Stdio::from(stderr_writer));
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                // Give the parent a moment before the program starts.
                libc::usleep(SPAWN_YIELD_USECS);
                Ok(())
            });
        }
        command
            .spawn()
            .with_context(|| format!("failed to spawn {}", program))?
        // dropping `command` closes our copies of the output pipe's write end
    };

    let pid = child.id();
    let (child, stdin) = take_stdin(child);
    reaper.adopt(child);
    let stdin = stdin.context("subprocess has no stdin")?;
    set_nonblocking(stdin.as_raw_fd()).context("failed to make subprocess stdin non-blocking")?;

    Ok(ResourceHandle::Process(ProcessPipes {
        pid,
        stdin: Some(stdin),
        output,
        write_timeout,
    }))
}

fn take_stdin(mut child: Child) -> (Child, Option<ChildStdin>) {
    let stdin = child.stdin.take();
    (child, stdin)
}

/// Collects exited children so they never linger as zombies.
///
/// A dedicated thread owns every spawned [`Child`] and polls each with a non-blocking wait, so a
/// long-running script never delays reaping another one.
#[derive(Debug)]
pub struct Reaper {
    children: Mutex<Sender<Child>>,
}

impl Reaper {
    pub fn start() -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        thread::Builder::new()
            .name("reaper".to_string())
            .spawn(move || reap(receiver))
            .context("failed to start reaper thread")?;
        Ok(Self {
            children: Mutex::new(sender),
        })
    }

    /// Take ownership of a running child.
    pub fn adopt(&self, child: Child) {
        let sent = match self.children.lock() {
            Ok(children) => children.send(child),
            Err(poisoned) => poisoned.into_inner().send(child),
        };
        if let Err(mpsc::SendError(mut child)) = sent {
            log::warn!("reaper is gone; waiting for process {} inline", child.id());
            thread::spawn(move || child.wait());
        }
    }
}

fn reap(receiver: Receiver<Child>) {
    let mut children: Vec<Child> = Vec::new();
    let mut disconnected = false;
    loop {
        let received = if disconnected {
            thread::sleep(REAP_INTERVAL);
            Err(RecvTimeoutError::Disconnected)
        } else if children.is_empty() {
            receiver.recv().map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            receiver.recv_timeout(REAP_INTERVAL)
        };
        match received {
            Ok(child) => children.push(child),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => disconnected = true,
        }

        children.retain_mut(|child| match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                log::trace!("process {} exited: {}", child.id(), status);
                false
            }
            Err(e) => {
                log::warn!("failed to wait for process {}: {}", child.id(), e);
                false
            }
        });

        if disconnected && children.is_empty() {
            return;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::Instant;

    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    use tempfile::tempdir;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn path_env() -> Vec<(String, String)> {
        vec![("PATH".to_string(), "/usr/bin:/bin".to_string())]
    }

    fn read_to_string(handle: &mut ResourceHandle) -> String {
        let mut output = String::new();
        handle.read_to_string(&mut output).unwrap();
        output
    }

    #[test]
    fn file_handle_knows_its_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.txt");
        std::fs::write(&path, b"hello").unwrap();
        let mut handle = ResourceHandle::open(&path).unwrap();
        assert_eq!(handle.size(), Some(5));
        assert_eq!(handle.pid(), None);
        assert_eq!(read_to_string(&mut handle), "hello");
        assert!(handle.write_all(b"x").is_err());
    }

    #[test]
    fn process_reads_body_and_merges_stderr() {
        let reaper = Reaper::start().unwrap();
        let dir = tempdir().unwrap();
        let mut handle = spawn(
            &reaper,
            &sh("cat; echo err >&2"),
            &path_env(),
            dir.path(),
            Some(Duration::from_secs(5)),
        )
        .unwrap();
        assert!(handle.pid().is_some());
        assert_eq!(handle.size(), None);
        handle.write_all(b"hello\n").unwrap();
        handle.close_writer();
        assert_eq!(read_to_string(&mut handle), "hello\nerr\n");
    }

    #[test]
    fn process_sees_only_given_environment_and_directory() {
        let reaper = Reaper::start().unwrap();
        let dir = tempdir().unwrap();
        let env = vec![("GREETING".to_string(), "hi".to_string())];
        let mut handle = spawn(
            &reaper,
            &sh("echo $GREETING; echo ${HOME:-unset}; pwd"),
            &env,
            dir.path(),
            None,
        )
        .unwrap();
        handle.close_writer();
        let output = read_to_string(&mut handle);
        let expected_dir = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(
            output,
            format!("hi\nunset\n{}\n", expected_dir.to_str().unwrap())
        );
    }

    #[test]
    fn large_body_waits_for_child_to_drain_pipe() {
        let reaper = Reaper::start().unwrap();
        let dir = tempdir().unwrap();
        let mut handle = spawn(
            &reaper,
            &sh("wc -c"),
            &path_env(),
            dir.path(),
            Some(Duration::from_secs(5)),
        )
        .unwrap();
        handle.write_all(&vec![b'x'; 1 << 20]).unwrap();
        handle.close_writer();
        assert_eq!(read_to_string(&mut handle).trim(), "1048576");
    }

    /// Raise the soft descriptor limit to at least `wanted`, if the hard limit allows it.
    fn raise_fd_limit(wanted: libc::rlim_t) -> bool {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
            return false;
        }
        if limit.rlim_cur >= wanted {
            return true;
        }
        if limit.rlim_max < wanted {
            return false;
        }
        limit.rlim_cur = wanted;
        unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) == 0 }
    }

    #[test]
    fn full_pipe_with_high_descriptor_numbers() {
        if !raise_fd_limit(4096) {
            eprintln!("skipping: descriptor limit too low");
            return;
        }
        // push the pipe descriptors past FD_SETSIZE
        let _filler: Vec<File> = (0..1100)
            .map(|_| File::open("/dev/null").unwrap())
            .collect();
        let reaper = Reaper::start().unwrap();
        let dir = tempdir().unwrap();
        let mut handle = spawn(
            &reaper,
            &sh("sleep 1; wc -c"),
            &path_env(),
            dir.path(),
            Some(Duration::from_secs(10)),
        )
        .unwrap();
        handle.write_all(&vec![b'x'; 1 << 20]).unwrap();
        handle.close_writer();
        assert_eq!(read_to_string(&mut handle).trim(), "1048576");
    }

    #[test]
    fn silent_process_reads_eof() {
        let reaper = Reaper::start().unwrap();
        let dir = tempdir().unwrap();
        let mut handle = spawn(&reaper, &sh("exit 0"), &path_env(), dir.path(), None).unwrap();
        handle.close_writer();
        let mut buf = [0; 16];
        assert_eq!(handle.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let reaper = Reaper::start().unwrap();
        let dir = tempdir().unwrap();
        let argv = vec!["/nonexistent/interpreter".to_string()];
        assert!(spawn(&reaper, &argv, &[], dir.path(), None).is_err());
    }

    #[test]
    fn exited_children_are_reaped() {
        let reaper = Reaper::start().unwrap();
        let dir = tempdir().unwrap();
        let mut handle = spawn(&reaper, &sh("exit 3"), &path_env(), dir.path(), None).unwrap();
        let pid = Pid::from_raw(handle.pid().unwrap() as i32);
        handle.close_writer();
        read_to_string(&mut handle);
        handle.close();

        // A zombie still answers kill(pid, 0); a reaped process does not.
        let deadline = Instant::now() + Duration::from_secs(5);
        while kill(pid, None).is_ok() {
            assert!(Instant::now() < deadline, "process {} was not reaped", pid);
            thread::sleep(Duration::from_millis(10));
        }
    }
}
