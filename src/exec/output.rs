//! Instance-prefixed, colored forwarding of subprocess output.

use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};

use owo_colors::{OwoColorize, Style};

/// Number of distinct prefix colors before assignments wrap around.
pub const PALETTE_SIZE: usize = 6;

/// Position in the prefix palette assigned to one instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ColorSlot(usize);

impl ColorSlot {
    /// Wraps `index` into the palette.
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index.rem_euclid(PALETTE_SIZE))
    }

    /// Returns the palette index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }

    /// Returns the style used for prefixes in this slot.
    #[must_use]
    pub fn style(self) -> Style {
        match self.0 {
            0 => Style::new().cyan(),
            1 => Style::new().green(),
            2 => Style::new().yellow(),
            3 => Style::new().magenta(),
            4 => Style::new().blue(),
            _ => Style::new().red(),
        }
    }
}

/// Monotonic counter handing out palette slots to instances.
///
/// One counter lives in each dispatch context, so concurrently running
/// instances draw distinct colors until the palette wraps.
#[derive(Debug, Default)]
pub struct ColorCounter(AtomicUsize);

impl ColorCounter {
    /// Creates a counter starting at the first palette entry.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// Returns the next slot.
    pub fn next_slot(&self) -> ColorSlot {
        ColorSlot::new(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Which stream a line came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputStream {
    /// Child standard output.
    Stdout,
    /// Child standard error.
    Stderr,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Mode {
    Silent,
    Raw,
    Prefixed { label: String, slot: ColorSlot },
}

/// Writes subprocess lines to the operator's terminal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutputPrefixer {
    mode: Mode,
}

impl OutputPrefixer {
    /// Discards every line. Used for readiness probes.
    #[must_use]
    pub const fn silent() -> Self {
        Self { mode: Mode::Silent }
    }

    /// Forwards lines unchanged (machine-readable mode).
    #[must_use]
    pub const fn raw() -> Self {
        Self { mode: Mode::Raw }
    }

    /// Prefixes every line with `label` in the color of `slot`.
    #[must_use]
    pub fn prefixed(label: impl Into<String>, slot: ColorSlot) -> Self {
        Self {
            mode: Mode::Prefixed {
                label: label.into(),
                slot,
            },
        }
    }

    /// Returns the assigned color slot, if lines are prefixed.
    #[must_use]
    pub const fn slot(&self) -> Option<ColorSlot> {
        match self.mode {
            Mode::Prefixed { slot, .. } => Some(slot),
            Mode::Silent | Mode::Raw => None,
        }
    }

    /// Renders `line` as it would be written, or `None` when silent.
    #[must_use]
    pub fn format_line(&self, line: &str) -> Option<String> {
        match self.mode {
            Mode::Silent => None,
            Mode::Raw => Some(line.to_owned()),
            Mode::Prefixed { ref label, slot } => {
                let prefix = format!("{label}:");
                Some(format!("{} {line}", prefix.style(slot.style())))
            }
        }
    }

    /// Writes one line to the stream it came from.
    pub fn line(&self, stream: OutputStream, line: &str) {
        let Some(rendered) = self.format_line(line) else {
            return;
        };
        // A closed terminal must not fail the remote operation.
        match stream {
            OutputStream::Stdout => writeln!(io::stdout().lock(), "{rendered}").ok(),
            OutputStream::Stderr => writeln!(io::stderr().lock(), "{rendered}").ok(),
        };
    }
}
