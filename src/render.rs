//! Row rendering.
//!
//! Every row is a fixed-width timestamp column, a colored separator whose
//! color tells stdout from stderr, and the raw bytes of the line:
//!
//! ```text
//!        0.412 ▌ compiling foo
//!        2.042 ▌ compiling bar
//!              ▌ a continuation of a row wider than the terminal
//! ```
//!
//! The row being filled ends in `\r` instead of a line break, so the idle
//! refresh can overwrite its timestamp column in place. The child's bytes
//! are written untouched; escape sequences are not interpreted.

use std::io::{self, IsTerminal, Write};
use std::time::Duration;

use crossterm::queue;
use crossterm::style::{Color, Print, ResetColor, SetBackgroundColor, SetForegroundColor};

use crate::clock::{format_precise, format_timestamp, TIMESTAMP_WIDTH};
use crate::config::StyleConfig;
use crate::process::Stream;

/// Columns taken by the separator: space, colored block, space.
pub const SEPARATOR_WIDTH: usize = 3;

/// Row capacity when the output is not a terminal.
pub const UNBOUNDED_CAPACITY: usize = 4096;

/// Bytes of line text that fit beside the timestamp and separator.
pub fn capacity_for(columns: u16) -> usize {
    match columns {
        0 => UNBOUNDED_CAPACITY,
        columns => (columns as usize)
            .saturating_sub(TIMESTAMP_WIDTH + SEPARATOR_WIDTH)
            .max(1),
    }
}

/// Row capacity for the terminal on standard output.
pub fn terminal_capacity() -> usize {
    if !io::stdout().is_terminal() {
        return UNBOUNDED_CAPACITY;
    }
    match crossterm::terminal::size() {
        Ok((columns, _)) => capacity_for(columns),
        Err(_) => UNBOUNDED_CAPACITY,
    }
}

/// Colors used for separators and fast timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Palette {
    pub stdout: Color,
    pub stderr: Color,
    pub fast: Color,
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            stdout: Color::Grey,
            stderr: Color::Red,
            fast: Color::DarkGrey,
        }
    }
}

impl Palette {
    pub fn from_style(style: &StyleConfig) -> Self {
        let base = Self::default();
        Self {
            stdout: style.stdout_separator.map_or(base.stdout, |c| c.to_crossterm()),
            stderr: style.stderr_separator.map_or(base.stderr, |c| c.to_crossterm()),
            fast: style.fast.map_or(base.fast, |c| c.to_crossterm()),
        }
    }
}

/// What goes in the timestamp column of a row being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stamp {
    /// A completed line and how long it took
    Elapsed { duration: Duration, fast: bool },
    /// A wrapped or interrupted row, no timing
    Blank,
}

/// Draws rows onto a writer.
pub struct Renderer<W: Write> {
    out: W,
    palette: Palette,
}

impl<W: Write> Renderer<W> {
    pub fn new(out: W, palette: Palette) -> Self {
        Self { out, palette }
    }

    fn separator(&mut self, stream: Stream) -> io::Result<()> {
        let color = match stream {
            Stream::Stdout => self.palette.stdout,
            Stream::Stderr => self.palette.stderr,
        };
        queue!(
            self.out,
            ResetColor,
            Print(' '),
            SetBackgroundColor(color),
            Print(' '),
            ResetColor,
            Print(' ')
        )
    }

    fn column(&mut self, stamp: Stamp) -> io::Result<()> {
        match stamp {
            Stamp::Elapsed { duration, fast } => {
                if fast {
                    queue!(self.out, SetForegroundColor(self.palette.fast))?;
                }
                queue!(self.out, Print(format_timestamp(duration)))
            }
            Stamp::Blank => queue!(self.out, Print(format!("{:1$}", "", TIMESTAMP_WIDTH))),
        }
    }

    /// Draw the row being filled and return to its first column.
    pub fn row(&mut self, stream: Stream, stamp: Stamp, text: &[u8]) -> io::Result<()> {
        self.column(stamp)?;
        self.separator(stream)?;
        self.out.write_all(text)?;
        queue!(self.out, Print('\r'))?;
        self.out.flush()
    }

    /// Overwrite the timestamp column of the current row with a running time.
    pub fn idle(&mut self, stream: Stream, running: Duration) -> io::Result<()> {
        queue!(self.out, ResetColor)?;
        self.column(Stamp::Elapsed {
            duration: running,
            fast: false,
        })?;
        self.separator(stream)?;
        queue!(self.out, Print('\r'))?;
        self.out.flush()
    }

    /// Stamp the current row, leaving the cursor after its separator.
    pub fn stamp(&mut self, stream: Stream, stamp: Stamp) -> io::Result<()> {
        self.column(stamp)?;
        self.separator(stream)
    }

    /// Stamp the current row and move to a fresh one.
    pub fn close_row(&mut self, stream: Stream, stamp: Stamp) -> io::Result<()> {
        self.stamp(stream, stamp)?;
        queue!(self.out, Print('\n'))?;
        self.out.flush()
    }

    /// Move past the current row and print the run statistics.
    pub fn summary(&mut self, total: Duration, lines: u64, max: Duration) -> io::Result<()> {
        queue!(self.out, ResetColor, Print('\n'))?;
        writeln!(self.out, "Total: {} across {} lines", format_precise(total), lines)?;
        writeln!(self.out, "Max:   {}", format_precise(max))?;
        self.out.flush()
    }
}
