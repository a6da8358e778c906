//! Child process launch
//!
//! [`spawn`] forks the command with its standard output and standard error
//! each wired to a fresh channel, either an anonymous pipe or a
//! pseudo-terminal pair. A pseudo-terminal makes the child believe it writes
//! to an interactive terminal, so programs that fully buffer into pipes
//! line-buffer instead and their output shows up as it is produced.
//!
//! ```text
//!       <- flow direction <-
//!   read end  (channel)  write end
//! Parent [==============] Child
//!  ChildProcess.stdout     fd 1
//!  ChildProcess.stderr     fd 2
//! ```
//!
//! Exec failure is detected through a third, close-on-exec pipe: a
//! successful exec closes it with nothing written, a failed exec writes the
//! errno before the child exits.

use std::ffi::{CString, OsString};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::ptr;

use thiserror::Error;
use tracing::{debug, warn};

/// Exit code of a child whose exec failed (sysexits `EX_OSERR`).
const EXEC_FAILED: libc::c_int = 71;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("{op} failed")]
    Resource {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("cannot execute command")]
    Exec(#[source] io::Error),

    #[error("argument contains a NUL byte: {0:?}")]
    InvalidArgument(OsString),

    #[error("no command given")]
    EmptyCommand,
}

pub type Result<T> = std::result::Result<T, LaunchError>;

fn resource(op: &'static str) -> LaunchError {
    LaunchError::Resource {
        op,
        source: io::Error::last_os_error(),
    }
}

/// Which of the child's output streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub const ALL: [Stream; 2] = [Stream::Stdout, Stream::Stderr];

    /// Position in [`Stream::ALL`].
    pub fn index(self) -> usize {
        match self {
            Stream::Stdout => 0,
            Stream::Stderr => 1,
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => f.write_str("stdout"),
            Stream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Kind of channel carrying the child's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Pipe,
    Pty,
}

/// A unidirectional byte channel: the child writes, the parent reads.
struct Channel {
    read: OwnedFd,
    write: OwnedFd,
}

impl Channel {
    /// Open a channel whose ends are not inherited by other children.
    /// `dup2` in the child clears the flag on the standard descriptors.
    fn open(kind: ChannelKind) -> Result<Self> {
        let channel = match kind {
            ChannelKind::Pipe => Self::pipe()?,
            ChannelKind::Pty => Self::pty()?,
        };
        set_cloexec(channel.read.as_raw_fd())?;
        set_cloexec(channel.write.as_raw_fd())?;
        Ok(channel)
    }

    fn pipe() -> Result<Self> {
        let mut fds: [RawFd; 2] = [-1; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(resource("pipe"));
        }
        // SAFETY: pipe() succeeded, both descriptors are fresh and owned here
        Ok(unsafe {
            Self {
                read: OwnedFd::from_raw_fd(fds[0]),
                write: OwnedFd::from_raw_fd(fds[1]),
            }
        })
    }

    fn pty() -> Result<Self> {
        let mut master: RawFd = -1;
        let mut slave: RawFd = -1;
        let result = unsafe {
            libc::openpty(
                &mut master,
                &mut slave,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        if result != 0 {
            return Err(resource("openpty"));
        }
        // SAFETY: openpty() succeeded, both descriptors are fresh and owned here
        Ok(unsafe {
            Self {
                read: OwnedFd::from_raw_fd(master),
                write: OwnedFd::from_raw_fd(slave),
            }
        })
    }
}

fn set_fd_flag(fd: RawFd, get: libc::c_int, set: libc::c_int, flag: libc::c_int) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, get) };
    if flags == -1 || unsafe { libc::fcntl(fd, set, flags | flag) } == -1 {
        return Err(resource("fcntl"));
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    set_fd_flag(fd, libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC)
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    set_fd_flag(fd, libc::F_GETFL, libc::F_SETFL, libc::O_NONBLOCK)
}

/// Parent-side handles of a spawned command.
pub struct ChildProcess {
    pid: libc::pid_t,
    stdout: File,
    stderr: File,
    kind: ChannelKind,
    status: Option<ExitStatus>,
}

impl ChildProcess {
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn raw_fd(&self, stream: Stream) -> RawFd {
        match stream {
            Stream::Stdout => self.stdout.as_raw_fd(),
            Stream::Stderr => self.stderr.as_raw_fd(),
        }
    }

    /// Reader over one of the child's output streams.
    pub fn reader(&self, stream: Stream) -> OutputReader<'_> {
        match stream {
            Stream::Stdout => OutputReader(&self.stdout),
            Stream::Stderr => OutputReader(&self.stderr),
        }
    }

    /// Reap the child if it has exited, without blocking.
    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }

        let mut status: libc::c_int = 0;
        match unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) } {
            -1 => Err(io::Error::last_os_error()),
            0 => Ok(None),
            _ => {
                let status = ExitStatus::from_raw(status);
                self.status = Some(status);
                Ok(Some(status))
            }
        }
    }
}

/// Reads a parent-side channel end.
///
/// Once every slave descriptor of a pseudo-terminal is closed, reading the
/// master fails with `EIO` on Linux. That is reported as end of stream.
pub struct OutputReader<'a>(&'a File);

impl Read for OutputReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self.0;
        match file.read(buf) {
            Err(e) if e.raw_os_error() == Some(libc::EIO) => Ok(0),
            other => other,
        }
    }
}

/// Launch `argv` with its standard output and standard error captured.
///
/// Returns once the child has either replaced its image with the command
/// or reported why it could not.
pub fn spawn(argv: &[OsString], kind: ChannelKind) -> Result<ChildProcess> {
    if argv.is_empty() {
        return Err(LaunchError::EmptyCommand);
    }

    // Everything the child needs is allocated before fork
    let args = argv
        .iter()
        .map(|arg| {
            CString::new(arg.as_bytes()).map_err(|_| LaunchError::InvalidArgument(arg.clone()))
        })
        .collect::<Result<Vec<_>>>()?;
    let mut arg_ptrs: Vec<*const libc::c_char> = args.iter().map(|arg| arg.as_ptr()).collect();
    arg_ptrs.push(ptr::null());

    let stdout = Channel::open(kind)?;
    let stderr = Channel::open(kind)?;

    let report = Channel::open(ChannelKind::Pipe)?;

    let pid = unsafe { libc::fork() };
    match pid {
        -1 => return Err(resource("fork")),
        // SAFETY: the child only makes async-signal-safe calls until exec
        0 => unsafe { exec_child(&stdout, &stderr, report.write.as_raw_fd(), &arg_ptrs) },
        _ => {}
    }

    // The child's copy must be the only write end left, so that a successful
    // exec leaves the report pipe at end of file
    let Channel {
        read: report_read,
        write: report_write,
    } = report;
    drop(report_write);
    drop(stdout.write);
    drop(stderr.write);

    let mut errno = [0u8; 4];
    match File::from(report_read).read_exact(&mut errno) {
        Ok(()) => {
            let mut status: libc::c_int = 0;
            unsafe { libc::waitpid(pid, &mut status, 0) };
            let error = io::Error::from_raw_os_error(i32::from_ne_bytes(errno));
            debug!(pid, %error, "exec failed in child");
            return Err(LaunchError::Exec(error));
        }
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {}
        Err(e) => {
            warn!(pid, error = %e, "could not read exec report");
            return Err(LaunchError::Resource {
                op: "read",
                source: e,
            });
        }
    }

    set_nonblocking(stdout.read.as_raw_fd())?;
    set_nonblocking(stderr.read.as_raw_fd())?;

    debug!(pid, ?kind, "child running");
    Ok(ChildProcess {
        pid,
        stdout: File::from(stdout.read),
        stderr: File::from(stderr.read),
        kind,
        status: None,
    })
}

/// Duplicate `fd` onto `target`, retrying while interrupted by a signal.
unsafe fn become_fd(fd: RawFd, target: RawFd) {
    while libc::dup2(fd, target) == -1
        && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted
    {}
}

unsafe fn exec_child(
    stdout: &Channel,
    stderr: &Channel,
    report: RawFd,
    argv: &[*const libc::c_char],
) -> ! {
    become_fd(stdout.write.as_raw_fd(), libc::STDOUT_FILENO);
    become_fd(stderr.write.as_raw_fd(), libc::STDERR_FILENO);

    for fd in [
        stdout.read.as_raw_fd(),
        stdout.write.as_raw_fd(),
        stderr.read.as_raw_fd(),
        stderr.write.as_raw_fd(),
    ] {
        if fd > libc::STDERR_FILENO {
            libc::close(fd);
        }
    }

    libc::execvp(argv[0], argv.as_ptr());

    let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
    let bytes = errno.to_ne_bytes();
    libc::write(report, bytes.as_ptr().cast(), bytes.len());
    libc::_exit(EXEC_FAILED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn argv(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    /// Collect a stream until end of file, riding out the non-blocking descriptor.
    fn drain(child: &ChildProcess, stream: Stream) -> Vec<u8> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut reader = child.reader(stream);
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => return out,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    assert!(Instant::now() < deadline, "timed out reading {}", stream);
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("read failed: {}", e),
            }
        }
    }

    fn wait(child: &mut ChildProcess) -> ExitStatus {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(status) = child.try_wait().unwrap() {
                return status;
            }
            assert!(Instant::now() < deadline, "child did not exit");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_pipes_separate_streams() {
        let mut child = spawn(&argv(&["sh", "-c", "echo out; echo err >&2"]), ChannelKind::Pipe).unwrap();
        assert_eq!(child.kind(), ChannelKind::Pipe);
        assert_eq!(drain(&child, Stream::Stdout), b"out\n");
        assert_eq!(drain(&child, Stream::Stderr), b"err\n");
        assert!(wait(&mut child).success());
    }

    #[test]
    fn test_pty_child_sees_a_terminal() {
        let mut child = spawn(
            &argv(&["sh", "-c", "if [ -t 1 ]; then echo tty; else echo pipe; fi"]),
            ChannelKind::Pty,
        )
        .unwrap();
        let out = drain(&child, Stream::Stdout);
        assert_eq!(String::from_utf8_lossy(&out).trim_end(), "tty");
        wait(&mut child);
    }

    #[test]
    fn test_missing_program_is_exec_error() {
        let started = Instant::now();
        let result = spawn(&argv(&["/nonexistent/tach-test-program"]), ChannelKind::Pipe);
        match result {
            Err(LaunchError::Exec(e)) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("spawn of a missing program succeeded"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_nonzero_exit_is_not_a_launch_error() {
        let mut child = spawn(&argv(&["sh", "-c", "exit 3"]), ChannelKind::Pipe).unwrap();
        assert_eq!(wait(&mut child).code(), Some(3));
        // Reaped status is remembered
        assert_eq!(child.try_wait().unwrap().and_then(|s| s.code()), Some(3));
    }

    #[test]
    fn test_rejects_bad_argv() {
        assert!(matches!(spawn(&[], ChannelKind::Pipe), Err(LaunchError::EmptyCommand)));

        let bad = vec![OsString::from("echo"), OsString::from("a\0b")];
        assert!(matches!(
            spawn(&bad, ChannelKind::Pipe),
            Err(LaunchError::InvalidArgument(_))
        ));
    }
}
