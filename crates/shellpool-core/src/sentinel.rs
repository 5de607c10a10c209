//! Completion markers appended to every submitted command.
//!
//! A command `cmd` is sent as `cmd ; echo <marker>$?`. The terminal first echoes
//! that line verbatim, where the marker is followed by `$?`. Once the command
//! exits, the shell prints the marker followed by the decimal exit code. Only
//! the latter counts as a completion.

use std::fmt::Write;

use rand::Rng;

pub const MARKER_PREFIX: &str = "__SP_DONE_";
pub const MARKER_SUFFIX: &str = "__";
const RANDOM_BYTES: usize = 16;

/// Single-use completion marker carrying 128 random bits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sentinel {
    marker: String,
}

impl Sentinel {
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; RANDOM_BYTES];
        rand::rng().fill(&mut bytes);
        let mut marker =
            String::with_capacity(MARKER_PREFIX.len() + RANDOM_BYTES * 2 + MARKER_SUFFIX.len());
        marker.push_str(MARKER_PREFIX);
        for b in bytes {
            let _ = write!(marker, "{b:02x}");
        }
        marker.push_str(MARKER_SUFFIX);
        Self { marker }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.marker
    }

    /// The text the terminal echoes back for the marker part of the command line.
    #[must_use]
    pub fn echo_form(&self) -> String {
        format!("{}$?", self.marker)
    }
}

impl std::fmt::Display for Sentinel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.marker)
    }
}

/// A recognized completion line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub exit_code: i32,
    /// Byte offset of the start of the line holding the marker.
    pub line_start: usize,
    /// Byte offset just past the exit code digits.
    pub end: usize,
}

fn runs_in_background(command: &str) -> bool {
    command.ends_with('&') && !command.ends_with("&&")
}

/// Build the augmented command line for `user_command` with a fresh sentinel.
#[must_use]
pub fn build_command(user_command: &str) -> (String, Sentinel) {
    let sentinel = Sentinel::generate();
    (command_line(user_command, &sentinel), sentinel)
}

/// The line typed into the shell for `user_command` completed by `sentinel`.
#[must_use]
pub fn command_line(user_command: &str, sentinel: &Sentinel) -> String {
    let mut command = user_command.trim_end();
    if !command.ends_with(";;")
        && let Some(stripped) = command.strip_suffix(';')
    {
        command = stripped.trim_end();
    }

    let echo = format!("echo {}", sentinel.echo_form());
    if command.is_empty() {
        return echo;
    }
    // A comment would swallow the rest of the line, a lone `;` after `&` is a syntax error.
    let separator = if command.contains('\n') || command.contains('#') {
        "\n"
    } else if runs_in_background(command) {
        " "
    } else {
        " ; "
    };
    format!("{command}{separator}{echo}")
}

/// Find the last valid completion line for `sentinel` in `buffer`.
///
/// A match requires the marker to be followed immediately by at least one
/// ASCII digit. Exit codes that do not fit in `i32` invalidate the match.
#[must_use]
pub fn extract_completion(buffer: &str, sentinel: &Sentinel) -> Option<Completion> {
    let marker = sentinel.as_str();
    let mut found = None;
    let mut from = 0;
    while let Some(pos) = buffer[from..].find(marker) {
        let start = from + pos;
        let digits_start = start + marker.len();
        let digits = buffer[digits_start..]
            .bytes()
            .take_while(u8::is_ascii_digit)
            .count();
        let end = digits_start + digits;
        if digits > 0
            && let Ok(exit_code) = buffer[digits_start..end].parse::<i32>()
        {
            let line_start = buffer[..start].rfind('\n').map_or(0, |i| i + 1);
            found = Some(Completion {
                exit_code,
                line_start,
                end,
            });
        }
        from = digits_start;
    }
    found
}

/// Offset just past the line that echoes the submitted command, if it is visible.
#[must_use]
pub fn echo_line_end(buffer: &str, sentinel: &Sentinel) -> Option<usize> {
    let pos = buffer.find(&sentinel.echo_form())?;
    Some(
        buffer[pos..]
            .find('\n')
            .map_or(buffer.len(), |nl| pos + nl + 1),
    )
}
