//! Removal of terminal protocol noise from captured output.
//!
//! Shell-integration markers, working-directory and title reports, and
//! bracketed-paste toggles are stripped. Color, style and cursor sequences are
//! kept so a downstream renderer can still display them.

use std::sync::LazyLock;

use regex::Regex;

use crate::sentinel::{MARKER_PREFIX, MARKER_SUFFIX, Sentinel, echo_line_end};

const PROMPT: &str = "$ ";

static NOISE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\x1b\](?:133|633|1337|7|0|1|2)(?:;[^\x07\x1b\n]*)?(?:\x07|\x1b\\)|\x1b\[\?2004[hl]",
    )
    .unwrap()
});

static SENTINEL_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"{}[0-9a-f]{{32}}{}\d",
        regex::escape(MARKER_PREFIX),
        regex::escape(MARKER_SUFFIX)
    ))
    .unwrap()
});

/// Keep what a terminal would finally show for a line overwritten with `\r`.
fn resolve_carriage_returns(line: &str) -> &str {
    if line.contains('\r') {
        line.rsplit('\r').find(|s| !s.is_empty()).unwrap_or("")
    } else {
        line
    }
}

fn strip_noise(line: &str) -> String {
    let mut current = line.to_owned();
    loop {
        let next = NOISE_RE.replace_all(&current, "");
        if next == current {
            return current;
        }
        current = next.into_owned();
    }
}

/// Strip protocol noise and sentinel lines, collapse blank runs and trim.
///
/// `clean(clean(x)) == clean(x)` for any input.
#[must_use]
pub fn clean(raw: &str) -> String {
    let normalized = raw.replace("\r\n", "\n");

    let mut lines: Vec<String> = Vec::new();
    for line in normalized.split('\n') {
        let line = resolve_carriage_returns(line);
        let stripped = strip_noise(line);
        if stripped.len() != line.len() && stripped.trim().is_empty() {
            continue;
        }
        if SENTINEL_LINE_RE.is_match(&stripped) {
            continue;
        }
        lines.push(stripped);
    }

    let mut result = String::with_capacity(normalized.len());
    let mut prev_blank = false;
    for line in &lines {
        let is_blank = line.trim().is_empty();
        if is_blank && prev_blank {
            continue;
        }
        prev_blank = is_blank;
        result.push_str(if is_blank { "" } else { line });
        result.push('\n');
    }

    result.trim().to_owned()
}

/// Drop the terminal echo of the submitted command: every line up to and
/// including the one showing the sentinel's `$?` placeholder.
#[must_use]
pub fn strip_command_echo<'a>(text: &'a str, sentinel: &Sentinel) -> &'a str {
    match echo_line_end(text, sentinel) {
        Some(end) => &text[end..],
        None => text,
    }
}

/// Drop an echo of `sent` the terminal has only partly printed.
///
/// Leading lines are removed while they still spell a prefix of `sent`. The
/// first may carry the `$ ` prompt.
#[must_use]
pub fn strip_partial_echo<'a>(text: &'a str, sent: &str) -> &'a str {
    let mut rest = sent;
    let mut consumed = 0;
    for (i, line) in text.split_inclusive('\n').enumerate() {
        let body = line.trim_end_matches(['\n', '\r']);
        let body = if i == 0 {
            body.strip_prefix(PROMPT).unwrap_or(body)
        } else {
            body
        };
        let Some(after) = rest.strip_prefix(body) else {
            break;
        };
        rest = if line.ends_with('\n') {
            match after.strip_prefix('\n') {
                Some(after) => after,
                None => break,
            }
        } else {
            after
        };
        consumed += line.len();
    }
    &text[consumed..]
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::sentinel::build_command;

    #[test]
    fn keeps_colors() {
        let raw = "\x1b[31merror\x1b[0m: boom";
        assert_eq!(clean(raw), raw);
    }

    #[test]
    fn strips_shell_integration_markers() {
        let raw = "\x1b]133;A\x07\x1b]633;P;Cwd=/tmp\x07ls\n\x1b]133;C\x07file.txt\n\x1b]133;D;0\x07";
        assert_eq!(clean(raw), "ls\nfile.txt");
    }

    #[test]
    fn strips_osc_with_string_terminator() {
        let raw = "\x1b]7;file://host/home/u\x1b\\\x1b]0;user@host: ~\x07hello";
        assert_eq!(clean(raw), "hello");
    }

    #[test]
    fn strips_bracketed_paste_toggles() {
        let raw = "\x1b[?2004hecho hi\x1b[?2004l\nhi";
        assert_eq!(clean(raw), "echo hi\nhi");
    }

    #[test]
    fn nested_noise_reaches_fixpoint() {
        let raw = "\x1b]13\x1b]133;A\x073;B\x07text";
        assert_eq!(clean(raw), "text");
    }

    #[test]
    fn carriage_return_keeps_last_segment() {
        assert_eq!(clean("progress 10%\rprogress 100%\r\ndone"), "progress 100%\ndone");
        assert_eq!(clean("final\r"), "final");
    }

    #[test]
    fn drops_sentinel_lines() {
        let (_, s) = build_command("true");
        let raw = format!("out\n{s}0\n");
        assert_eq!(clean(&raw), "out");
    }

    #[test]
    fn keeps_echo_placeholder_line() {
        // The placeholder is not a completion; echo stripping handles it.
        let (cmd, _) = build_command("true");
        assert_eq!(clean(&cmd), cmd);
    }

    #[test]
    fn collapses_blank_runs() {
        assert_eq!(clean("a\n\n\n\n  \nb\n\nc"), "a\n\nb\n\nc");
    }

    #[test]
    fn trims_surrounding_whitespace() {
        assert_eq!(clean("\n\n  hi  \n\n"), "hi");
        assert_eq!(clean(""), "");
    }

    #[test]
    fn strip_echo_drops_command_lines() {
        let (cmd, s) = build_command("echo hi");
        let raw = format!("{cmd}\r\nhi\r\n");
        assert_eq!(strip_command_echo(&raw, &s), "hi\r\n");
        assert_eq!(strip_command_echo("hi\n", &s), "hi\n");
    }

    #[test]
    fn strip_echo_handles_prompt_prefix() {
        let (cmd, s) = build_command("pwd");
        let raw = format!("$ {cmd}\n/tmp\n");
        assert_eq!(strip_command_echo(&raw, &s), "/tmp\n");
    }

    #[test]
    fn partial_echo_is_dropped() {
        let (cmd, _) = build_command("sleep 10");
        assert_eq!(strip_partial_echo(&cmd[..7], &cmd), "");
        assert_eq!(strip_partial_echo(&format!("$ {}", &cmd[..12]), &cmd), "");
        assert_eq!(strip_partial_echo("other output", &cmd), "other output");
    }

    #[test]
    fn partial_echo_spans_lines() {
        let (cmd, _) = build_command("for i in 1 2\ndo echo $i\ndone");
        let raw = "for i in 1 2\r\ndo echo $i\r\ndo";
        assert_eq!(strip_partial_echo(raw, &cmd), "");
        assert_eq!(strip_partial_echo("for i in 1 2\r\n1\r\n", &cmd), "1\r\n");
    }

    proptest! {
        #[test]
        fn clean_is_idempotent(raw in "(\\PC|[\r\n\t\x07\x1b\\]\\[?;]|133|2004h|__SP_DONE_){0,120}") {
            let once = clean(&raw);
            prop_assert_eq!(clean(&once), once.clone());
        }

        #[test]
        fn clean_is_idempotent_on_terminal_fixtures(
            parts in proptest::collection::vec(
                prop_oneof![
                    Just("\x1b[32mok\x1b[0m".to_owned()),
                    Just("\x1b]133;A\x07".to_owned()),
                    Just("\x1b]0;title\x07".to_owned()),
                    Just("\x1b[?2004h".to_owned()),
                    Just("\r\n".to_owned()),
                    Just("\n\n\n".to_owned()),
                    Just("50%\r100%".to_owned()),
                    Just("  ".to_owned()),
                    "[a-z ]{1,12}",
                ],
                0..24,
            )
        ) {
            let raw = parts.concat();
            let once = clean(&raw);
            prop_assert_eq!(clean(&once), once.clone());
        }
    }
}
