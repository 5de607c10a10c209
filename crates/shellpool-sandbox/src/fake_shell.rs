//! Line interpreter standing in for an interactive shell behind a mock PTY.
//!
//! Understands just enough to drive session tests: `echo` with `$?`, `cd`,
//! `pwd`, `true`, `false`, background `&` jobs, and the blocking `sleep` and
//! `read`. Lists split on `;`, `&` and newlines. Ctrl-C abandons the rest of a
//! blocked list the way an interactive shell does.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

enum Blocker {
    Sleep,
    Read,
}

struct Blocked {
    on: Blocker,
    rest: Vec<String>,
}

struct ShellState {
    cwd: String,
    last_code: i32,
    blocked: Option<Blocked>,
    next_job_pid: u32,
}

impl Default for ShellState {
    fn default() -> Self {
        Self {
            cwd: "/home/user".into(),
            last_code: 0,
            blocked: None,
            next_job_pid: 4242,
        }
    }
}

fn split_statements(line: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let chars: Vec<char> = line.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                current.push(c);
            }
            (None, ';' | '\n') => statements.push(std::mem::take(&mut current)),
            (None, '&') => {
                let prev = i.checked_sub(1).map(|p| chars[p]);
                let next = chars.get(i + 1).copied();
                current.push('&');
                if prev != Some('&') && prev != Some('>') && next != Some('&') && next != Some('>') {
                    statements.push(std::mem::take(&mut current));
                }
            }
            (None, c) => current.push(c),
        }
    }
    statements.push(current);
    statements
        .into_iter()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .collect()
}

fn unquote(args: &str) -> String {
    args.chars().filter(|c| *c != '\'' && *c != '"').collect()
}

impl ShellState {
    fn feed(&mut self, input: &[u8], out: &mut String) {
        match input {
            b"\x03" => {
                out.push_str("^C\r\n");
                if self.blocked.take().is_some() {
                    self.last_code = 130;
                }
                return;
            }
            b"\x04" => {
                if let Some(Blocked {
                    on: Blocker::Read,
                    rest,
                }) = self.blocked.take()
                {
                    self.last_code = 1;
                    self.run(rest, out);
                }
                return;
            }
            _ => {}
        }

        let text = String::from_utf8_lossy(input);
        let text = text.trim_end_matches(['\r', '\n']);
        out.push_str(&text.replace('\n', "\r\n"));
        out.push_str("\r\n");

        match self.blocked.take() {
            Some(blocked @ Blocked {
                on: Blocker::Sleep, ..
            }) => self.blocked = Some(blocked),
            Some(Blocked {
                on: Blocker::Read,
                rest,
            }) => {
                self.last_code = 0;
                self.run(rest, out);
            }
            None => self.run(split_statements(text), out),
        }
    }

    fn run(&mut self, statements: Vec<String>, out: &mut String) {
        let mut statements = statements.into_iter();
        while let Some(statement) = statements.next() {
            if let Some(on) = self.execute(&statement, out) {
                self.blocked = Some(Blocked {
                    on,
                    rest: statements.collect(),
                });
                return;
            }
        }
    }

    fn execute(&mut self, statement: &str, out: &mut String) -> Option<Blocker> {
        if statement.starts_with('#') {
            return None;
        }
        if statement.ends_with('&') && !statement.ends_with("&&") {
            out.push_str(&format!("[1] {}\r\n", self.next_job_pid));
            self.next_job_pid += 1;
            self.last_code = 0;
            return None;
        }
        let (program, args) = statement.split_once(' ').unwrap_or((statement, ""));
        self.last_code = match program {
            "echo" => {
                let text = unquote(args).replace("$?", &self.last_code.to_string());
                out.push_str(&text);
                out.push_str("\r\n");
                0
            }
            "true" | "set" | "stty" | "export" | ":" => 0,
            "false" => 1,
            "cd" => {
                self.cwd = unquote(args.trim());
                0
            }
            "pwd" => {
                out.push_str(&self.cwd);
                out.push_str("\r\n");
                0
            }
            "sleep" => return Some(Blocker::Sleep),
            "read" => return Some(Blocker::Read),
            "exit" => args.trim().parse().unwrap_or(0),
            _ => {
                out.push_str(&format!("sh: {program}: command not found\r\n"));
                127
            }
        };
        None
    }
}

/// Per-pid interpreter state for [`crate::MockSandbox::interactive_shell`].
#[derive(Default)]
pub(crate) struct FakeShells {
    shells: Mutex<HashMap<u32, ShellState>>,
}

impl FakeShells {
    pub(crate) fn respond(&self, pid: u32, input: &[u8]) -> Option<Vec<u8>> {
        let mut shells = self.shells.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = String::new();
        shells.entry(pid).or_default().feed(input, &mut out);
        (!out.is_empty()).then(|| out.into_bytes())
    }
}
