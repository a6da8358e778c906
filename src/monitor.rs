//! The control loop.
//!
//! [`Monitor`] owns one [`LineAccumulator`] per output stream and all display
//! state. It is fed wakeups (stream readable, idle timeout, resize) and turns
//! line boundaries into timed rows. [`run`] drives a monitor from a single
//! `poll` over the child's output and the signal notification descriptors.
//!
//! # Row lifecycle
//!
//! ```text
//! read → draw row (running time, text, '\r'; blank column after a wrap)
//!          │  idle timeout: redraw running time in the column
//!          ▼
//! next read on any stream:
//!   row ended in '\n'     → stamp elapsed time, count line, '\n'
//!   row filled up (wrap)  → blank column, '\n'
//!   other stream, partial → blank column, '\n' (row kept for its stream)
//! ```
//!
//! The very first boundary is never drawn or counted. Timing runs from
//! launch, so the first line's duration includes the wait for the first
//! output.

use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::clock::{elapsed, Clock};
use crate::linebuf::{LineAccumulator, Terminator};
use crate::process::{ChildProcess, Stream};
use crate::render::{Renderer, Stamp};
use crate::signals::{Notice, Notifier};

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("waiting for readiness failed")]
    Poll(#[source] io::Error),

    #[error("reading child {stream} failed")]
    Read {
        stream: Stream,
        #[source]
        source: io::Error,
    },

    #[error("writing to the terminal failed")]
    Render(#[source] io::Error),

    #[error("reading signal notification failed")]
    Signal(#[source] io::Error),

    #[error("waiting for the child failed")]
    Wait(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, MonitorError>;

/// Loop behavior knobs.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// No idle redraw of the running timestamp
    pub slow: bool,
    /// Upper bound on every readiness wait
    pub refresh: Duration,
    /// Gaps at or below this are drawn in the fast style
    pub fast_threshold: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            slow: false,
            refresh: Duration::from_millis(17),
            fast_threshold: Duration::from_millis(1),
        }
    }
}

/// Final run statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub total: Duration,
    pub lines: u64,
    pub max: Duration,
}

/// The terminal row the cursor sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Row {
    /// Nothing drawn yet
    Empty,
    /// Drawn from `stream`'s accumulator
    Drawn {
        stream: Stream,
        terminator: Terminator,
        wrapped: bool,
    },
}

/// Display state machine over the child's two output streams.
pub struct Monitor<W: Write, C: Clock> {
    stdout: LineAccumulator,
    stderr: LineAccumulator,
    renderer: Renderer<W>,
    clock: C,
    settings: Settings,
    row: Row,
    /// No boundary seen yet
    first: bool,
    /// Per stream: its current logical line already wrapped onto a new row
    continuation: [bool; 2],
    lines: u64,
    max: Duration,
    last: Instant,
    start: Instant,
}

impl<W: Write, C: Clock> Monitor<W, C> {
    /// Start timing now, with rows of `capacity` bytes.
    pub fn new(renderer: Renderer<W>, clock: C, settings: Settings, capacity: usize) -> Self {
        let start = clock.now();
        Self {
            stdout: LineAccumulator::new(capacity),
            stderr: LineAccumulator::new(capacity),
            renderer,
            clock,
            settings,
            row: Row::Empty,
            first: true,
            continuation: [false; 2],
            lines: 0,
            max: Duration::ZERO,
            last: start,
            start,
        }
    }

    pub fn refresh(&self) -> Duration {
        self.settings.refresh
    }

    fn accumulator(&mut self, stream: Stream) -> &mut LineAccumulator {
        match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        }
    }

    fn stamp_for(&self, duration: Duration) -> Stamp {
        Stamp::Elapsed {
            duration,
            fast: duration <= self.settings.fast_threshold,
        }
    }

    /// Account a completed line that took `duration`.
    fn record(&mut self, duration: Duration, now: Instant) {
        self.max = self.max.max(duration);
        self.last = now;
        self.lines += 1;
    }

    /// Finish the current row if the incoming output on `stream` starts a new one.
    fn advance_row(&mut self, stream: Stream, now: Instant) -> Result<()> {
        let Row::Drawn {
            stream: owner,
            terminator,
            wrapped,
        } = self.row
        else {
            if self.first {
                // The wait before the first output belongs to the first line
                trace!("first boundary");
                self.first = false;
            }
            return Ok(());
        };

        let diff = elapsed(self.last, now);
        if terminator == Terminator::Newline {
            let stamp = self.stamp_for(diff);
            self.renderer.close_row(owner, stamp).map_err(MonitorError::Render)?;
            self.record(diff, now);
            self.accumulator(owner).reset();
            self.continuation[owner.index()] = false;
        } else if wrapped {
            self.renderer
                .close_row(owner, Stamp::Blank)
                .map_err(MonitorError::Render)?;
            self.accumulator(owner).reset();
            self.continuation[owner.index()] = true;
        } else if owner != stream {
            // Not a line boundary: the row is only broken so the other stream
            // gets its own. No count, no timing. The interrupted stream's
            // partial text is kept for when it resumes.
            debug!(from = %owner, to = %stream, "stream switch breaks partial row");
            self.renderer
                .close_row(owner, Stamp::Blank)
                .map_err(MonitorError::Render)?;
        } else {
            return Ok(());
        }

        self.row = Row::Empty;
        Ok(())
    }

    /// Process one readiness unit from `stream`, then any fragments it left
    /// pending. Returns `false` once the stream is at end of file.
    pub fn on_readable<R: Read + ?Sized>(&mut self, stream: Stream, source: &mut R) -> Result<bool> {
        if !self.step(stream, source)? {
            return Ok(false);
        }
        while self.accumulator(stream).has_pending() {
            if !self.step(stream, source)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn step<R: Read + ?Sized>(&mut self, stream: Stream, source: &mut R) -> Result<bool> {
        let now = self.clock.now();
        self.advance_row(stream, now)?;

        let column = if self.continuation[stream.index()] {
            Stamp::Blank
        } else {
            Stamp::Elapsed {
                duration: elapsed(self.last, now),
                fast: false,
            }
        };
        let acc = match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        };
        let terminator = match acc.read(source) {
            Ok(Some(segment)) => {
                trace!(%stream, bytes = segment.text.len(), terminator = ?segment.terminator, "read");
                segment.terminator
            }
            Ok(None) => {
                debug!(%stream, "end of stream");
                return Ok(false);
            }
            Err(e) => return Err(MonitorError::Read { stream, source: e }),
        };
        let wrapped = acc.is_full();

        self.renderer
            .row(stream, column, acc.line())
            .map_err(MonitorError::Render)?;
        self.row = Row::Drawn {
            stream,
            terminator,
            wrapped,
        };
        Ok(true)
    }

    /// Nothing happened within the refresh period.
    pub fn on_idle(&mut self) -> Result<()> {
        if self.first || self.settings.slow {
            return Ok(());
        }
        let Row::Drawn { stream, .. } = self.row else {
            return Ok(());
        };

        let running = elapsed(self.last, self.clock.now());
        self.renderer
            .idle(stream, running)
            .map_err(MonitorError::Render)
    }

    /// The display width changed. Rows in flight are dropped.
    pub fn resize(&mut self, capacity: usize) {
        debug!(capacity, "resizing rows");
        self.stdout.resize(capacity);
        self.stderr.resize(capacity);
    }

    /// Stamp the last row and print the statistics.
    pub fn finish(mut self) -> Result<Summary> {
        let now = self.clock.now();
        let diff = elapsed(self.last, now);

        if let Row::Drawn {
            stream,
            terminator,
            wrapped,
        } = self.row
        {
            if terminator == Terminator::Newline {
                let stamp = self.stamp_for(diff);
                self.renderer.stamp(stream, stamp).map_err(MonitorError::Render)?;
                self.record(diff, now);
            } else if !wrapped {
                self.renderer
                    .stamp(
                        stream,
                        Stamp::Elapsed {
                            duration: diff,
                            fast: false,
                        },
                    )
                    .map_err(MonitorError::Render)?;
            }
        }

        let summary = Summary {
            total: elapsed(self.start, now),
            lines: self.lines,
            max: self.max,
        };
        self.renderer
            .summary(summary.total, summary.lines, summary.max)
            .map_err(MonitorError::Render)?;
        Ok(summary)
    }
}

fn pollfd(fd: RawFd) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}

/// Block until something in `fds` is ready or `timeout` passes.
fn wait(fds: &mut [libc::pollfd], timeout: Duration) -> io::Result<usize> {
    let timeout = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    loop {
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if ready >= 0 {
            return Ok(ready as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Drive `monitor` until the child is done or the user interrupts.
///
/// The loop ends on an interrupt, on end of file on both streams, or on the
/// first quiet refresh period after the child exited. `capacity` is asked
/// for the new row capacity whenever the terminal is resized.
pub fn run<W, C, F>(
    mut monitor: Monitor<W, C>,
    child: &mut ChildProcess,
    notifier: &Notifier,
    capacity: F,
) -> Result<Summary>
where
    W: Write,
    C: Clock,
    F: Fn() -> usize,
{
    let notices = notifier.descriptors();
    let mut open = [true; 2];
    let mut exited = false;
    let mut fds: Vec<libc::pollfd> = Vec::with_capacity(Stream::ALL.len() + notices.len());

    'wakeup: loop {
        fds.clear();
        for (stream, is_open) in Stream::ALL.iter().zip(open) {
            // Negative descriptors are skipped by poll
            fds.push(pollfd(if is_open { child.raw_fd(*stream) } else { -1 }));
        }
        fds.extend(notices.iter().map(|&(_, fd)| pollfd(fd)));

        let ready = wait(&mut fds, monitor.refresh()).map_err(MonitorError::Poll)?;
        if ready == 0 {
            if exited {
                debug!("child exited and its output is drained");
                break;
            }
            monitor.on_idle()?;
            continue;
        }

        for (slot, &(notice, _)) in fds[Stream::ALL.len()..].iter().zip(&notices) {
            if slot.revents == 0 {
                continue;
            }
            notifier.take(notice).map_err(MonitorError::Signal)?;
            match notice {
                Notice::Interrupt => {
                    info!("interrupted");
                    break 'wakeup;
                }
                Notice::Resize => monitor.resize(capacity()),
                Notice::ChildExit => {
                    if let Some(status) = child.try_wait().map_err(MonitorError::Wait)? {
                        info!(pid = child.pid(), %status, "child exited");
                        exited = true;
                    }
                }
            }
        }

        for (index, stream) in Stream::ALL.into_iter().enumerate() {
            let revents = fds[index].revents;
            if revents & libc::POLLIN != 0 {
                if !monitor.on_readable(stream, &mut child.reader(stream))? {
                    open[index] = false;
                }
            } else if revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
                debug!(%stream, revents, "stream hung up");
                open[index] = false;
            }
        }

        if !open.contains(&true) {
            debug!("both streams closed");
            break;
        }
    }

    monitor.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, MonotonicClock, TIMESTAMP_WIDTH};
    use crate::process::{spawn, ChannelKind};
    use crate::render::Palette;
    use crate::signals::raise_lock;
    use signal_hook::consts::{SIGINT, SIGWINCH};
    use signal_hook::low_level::raise;
    use std::cell::Cell;
    use std::ffi::OsString;
    use std::thread;

    fn monitor<'a>(
        out: &'a mut Vec<u8>,
        clock: &'a ManualClock,
        capacity: usize,
    ) -> Monitor<&'a mut Vec<u8>, &'a ManualClock> {
        Monitor::new(
            Renderer::new(out, Palette::default()),
            clock,
            Settings::default(),
            capacity,
        )
    }

    fn feed<W: Write, C: Clock>(monitor: &mut Monitor<W, C>, stream: Stream, mut data: &[u8]) -> bool {
        monitor.on_readable(stream, &mut data).unwrap()
    }

    #[test]
    fn test_two_lines_with_gap() {
        let clock = ManualClock::new();
        let mut out = Vec::new();
        let mut m = monitor(&mut out, &clock, 80);

        feed(&mut m, Stream::Stdout, b"alpha\n");
        clock.advance(Duration::from_millis(50));
        feed(&mut m, Stream::Stdout, b"beta\n");
        clock.advance(Duration::from_millis(1));
        let summary = m.finish().unwrap();

        assert_eq!(summary.lines, 2);
        assert_eq!(summary.max, Duration::from_millis(50));
        assert!(summary.total >= summary.max);
        assert_eq!(summary.total, Duration::from_millis(51));

        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("alpha"));
        assert!(text.contains("       0.050"));
        assert!(text.contains("across 2 lines"));
    }

    #[test]
    fn test_first_boundary_is_not_drawn() {
        let clock = ManualClock::new();
        let mut out = Vec::new();
        let mut m = monitor(&mut out, &clock, 80);

        clock.advance(Duration::from_secs(2));
        feed(&mut m, Stream::Stdout, b"solo\n");
        let summary = m.finish().unwrap();

        assert_eq!(summary.lines, 1);
        assert_eq!(summary.max, Duration::from_secs(2));
        assert_eq!(summary.total, Duration::from_secs(2));
        // No blank row ahead of the first line, which runs from launch
        assert!(out.starts_with(b"       2.000"));
    }

    #[test]
    fn test_first_line_includes_wait_for_output() {
        let clock = ManualClock::new();
        let mut out = Vec::new();
        let mut m = monitor(&mut out, &clock, 80);

        clock.advance(Duration::from_secs(2));
        feed(&mut m, Stream::Stdout, b"a\n");
        clock.advance(Duration::from_millis(10));
        feed(&mut m, Stream::Stdout, b"b\n");
        let summary = m.finish().unwrap();

        assert_eq!(summary.lines, 2);
        assert_eq!(summary.max, Duration::from_millis(2010));
        assert_eq!(summary.total, Duration::from_millis(2010));
        assert!(String::from_utf8_lossy(&out).contains("       2.010"));
    }

    #[test]
    fn test_wrap_is_not_counted() {
        let clock = ManualClock::new();
        let mut out = Vec::new();
        let mut m = monitor(&mut out, &clock, 10);

        let mut source: &[u8] = b"0123456789XYZ\n";
        assert!(m.on_readable(Stream::Stdout, &mut source).unwrap());
        assert!(matches!(m.row, Row::Drawn { wrapped: true, .. }));

        clock.advance(Duration::from_millis(20));
        assert!(m.on_readable(Stream::Stdout, &mut source).unwrap());
        // The continuation row has no running time
        assert!(m.continuation[Stream::Stdout.index()]);
        assert!(matches!(
            m.row,
            Row::Drawn {
                terminator: Terminator::Newline,
                wrapped: false,
                ..
            }
        ));
        let summary = m.finish().unwrap();

        assert_eq!(summary.lines, 1);
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("0123456789"));
        assert!(text.contains("XYZ"));
    }

    #[test]
    fn test_chunk_with_several_lines_is_drained() {
        let clock = ManualClock::new();
        let mut out = Vec::new();
        let mut m = monitor(&mut out, &clock, 80);

        feed(&mut m, Stream::Stdout, b"a\nb\nc\n");
        assert!(!m.stdout.has_pending());
        let summary = m.finish().unwrap();

        assert_eq!(summary.lines, 3);
    }

    #[test]
    fn test_carriage_return_is_not_a_line() {
        let clock = ManualClock::new();
        let mut out = Vec::new();
        let mut m = monitor(&mut out, &clock, 80);

        feed(&mut m, Stream::Stdout, b"10%\r");
        feed(&mut m, Stream::Stdout, b"50%\r");
        feed(&mut m, Stream::Stdout, b"done\n");
        let summary = m.finish().unwrap();

        assert_eq!(summary.lines, 1);
        assert_eq!(last_row_text(&out), "done");
    }

    /// Text of the last drawn row.
    fn last_row_text(out: &[u8]) -> String {
        let text = String::from_utf8_lossy(out);
        let last_row = text.rsplit('\r').nth(1).unwrap_or_default();
        last_row.rsplit(' ').next().unwrap_or_default().to_string()
    }

    #[test]
    fn test_stream_switch_keeps_partial_text() {
        let clock = ManualClock::new();
        let mut out = Vec::new();
        let mut m = monitor(&mut out, &clock, 80);

        feed(&mut m, Stream::Stdout, b"abc");
        feed(&mut m, Stream::Stderr, b"err\n");
        feed(&mut m, Stream::Stdout, b"def\n");
        assert_eq!(m.stdout.line(), b"abcdef");
        let summary = m.finish().unwrap();

        assert_eq!(summary.lines, 2);
        assert!(String::from_utf8_lossy(&out).contains("abcdef"));
    }

    /// Rows as drawn, split at every return and line feed.
    fn drawn_rows(out: &[u8]) -> Vec<String> {
        String::from_utf8_lossy(out)
            .split(|c| c == '\r' || c == '\n')
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_wrap_continuation_belongs_to_its_stream() {
        let clock = ManualClock::new();
        let mut out = Vec::new();
        let mut m = monitor(&mut out, &clock, 4);

        feed(&mut m, Stream::Stdout, b"abcd");
        feed(&mut m, Stream::Stdout, b"ef");
        feed(&mut m, Stream::Stderr, b"err\n");
        feed(&mut m, Stream::Stdout, b"gh");
        drop(m);

        let blank = " ".repeat(TIMESTAMP_WIDTH);
        let rows = drawn_rows(&out);
        let err = rows.iter().find(|row| row.ends_with("err")).unwrap();
        assert!(!err.starts_with(&blank));
        assert!(err.starts_with("       0.000"));
        let resumed = rows.iter().find(|row| row.ends_with("efgh")).unwrap();
        assert!(resumed.starts_with(&blank));
    }

    #[test]
    fn test_end_of_stream() {
        let clock = ManualClock::new();
        let mut out = Vec::new();
        let mut m = monitor(&mut out, &clock, 80);

        assert!(!feed(&mut m, Stream::Stderr, b""));
        let summary = m.finish().unwrap();
        assert_eq!(summary.lines, 0);
    }

    #[test]
    fn test_idle_refresh() {
        let clock = ManualClock::new();
        let mut out = Vec::new();
        let mut m = monitor(&mut out, &clock, 80);

        // Nothing to refresh before the first output
        m.on_idle().unwrap();
        feed(&mut m, Stream::Stdout, b"working");
        clock.advance(Duration::from_millis(1500));
        m.on_idle().unwrap();
        m.finish().unwrap();

        assert!(String::from_utf8_lossy(&out).contains("       1.500"));
    }

    #[test]
    fn test_slow_mode_skips_idle_refresh() {
        let clock = ManualClock::new();
        let mut out = Vec::new();
        let settings = Settings {
            slow: true,
            ..Settings::default()
        };
        let mut m = Monitor::new(Renderer::new(&mut out, Palette::default()), &clock, settings, 80);

        feed(&mut m, Stream::Stdout, b"working");
        clock.advance(Duration::from_millis(1500));
        m.on_idle().unwrap();
        drop(m);

        assert!(!String::from_utf8_lossy(&out).contains("1.500"));
    }

    #[test]
    fn test_resize_drops_row_in_flight() {
        let clock = ManualClock::new();
        let mut out = Vec::new();
        let mut m = monitor(&mut out, &clock, 80);

        feed(&mut m, Stream::Stdout, b"partial");
        m.resize(20);
        assert_eq!(m.stdout.capacity(), 20);
        assert!(m.stdout.line().is_empty());

        feed(&mut m, Stream::Stdout, b" rest\n");
        assert_eq!(m.stdout.line(), b" rest");
    }

    #[test]
    fn test_run_real_child() {
        let _guard = raise_lock();
        let notifier = Notifier::install().unwrap();
        let mut child = spawn(
            &argv(&["sh", "-c", "echo alpha; sleep 0.05; echo beta >&2"]),
            ChannelKind::Pipe,
        )
        .unwrap();

        let mut out = Vec::new();
        let summary = run(live_monitor(&mut out), &mut child, &notifier, || 200).unwrap();

        assert_eq!(summary.lines, 2);
        assert!(summary.max >= Duration::from_millis(40));
        assert!(summary.total >= summary.max);

        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("alpha"));
        assert!(text.contains("beta"));
    }

    #[test]
    fn test_run_stops_on_interrupt() {
        let _guard = raise_lock();
        let notifier = Notifier::install().unwrap();
        let mut child = spawn(&argv(&["sh", "-c", "echo a; sleep 5"]), ChannelKind::Pipe).unwrap();

        let raiser = thread::spawn(|| {
            thread::sleep(Duration::from_millis(200));
            raise(SIGINT).unwrap();
        });
        let started = Instant::now();
        let mut out = Vec::new();
        let summary = run(live_monitor(&mut out), &mut child, &notifier, || 200).unwrap();
        raiser.join().unwrap();
        kill(&mut child);

        // Shut down long before the child would have exited
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(summary.lines, 1);
        assert!(summary.total >= Duration::from_millis(150));
        assert!(String::from_utf8_lossy(&out).contains("across 1 lines"));
    }

    #[test]
    fn test_run_resize_is_not_a_line() {
        let _guard = raise_lock();
        let notifier = Notifier::install().unwrap();
        let mut child = spawn(
            &argv(&["sh", "-c", "echo a; sleep 0.3; echo b"]),
            ChannelKind::Pipe,
        )
        .unwrap();

        let raiser = thread::spawn(|| {
            thread::sleep(Duration::from_millis(100));
            raise(SIGWINCH).unwrap();
        });
        let asked = Cell::new(0);
        let mut out = Vec::new();
        let summary = run(live_monitor(&mut out), &mut child, &notifier, || {
            asked.set(asked.get() + 1);
            50
        })
        .unwrap();
        raiser.join().unwrap();

        assert!(asked.get() >= 1);
        assert_eq!(summary.lines, 2);
    }

    fn argv(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    fn live_monitor(out: &mut Vec<u8>) -> Monitor<&mut Vec<u8>, MonotonicClock> {
        Monitor::new(
            Renderer::new(out, Palette::default()),
            MonotonicClock,
            Settings::default(),
            200,
        )
    }

    fn kill(child: &mut ChildProcess) {
        unsafe { libc::kill(child.pid(), libc::SIGKILL) };
        let deadline = Instant::now() + Duration::from_secs(5);
        while child.try_wait().unwrap().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }
}
