//! Process-table inspection used to find the foreground process of a shell.
//!
//! Matching is heuristic. An ambiguous command line can select the wrong
//! process, so callers treat the result as a best-effort hint.

use std::collections::{HashSet, VecDeque};

/// Lists every process as `pid ppid args` without a header.
pub const PS_COMMAND: &str = "ps -eo pid=,ppid=,args=";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
    pub args: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// The command line equals the submitted command.
    Exact,
    /// The command line and the submitted command overlap.
    Fuzzy,
    /// No command match; direct children of the shell.
    Child,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillTarget {
    pub pids: Vec<u32>,
    pub kind: MatchKind,
}

/// Parse the output of [`PS_COMMAND`]. Malformed lines are skipped.
#[must_use]
pub fn parse_process_table(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let pid = parts.next()?.parse().ok()?;
            let ppid = parts.next()?.parse().ok()?;
            let args = parts.collect::<Vec<_>>().join(" ");
            Some(ProcessEntry { pid, ppid, args })
        })
        .collect()
}

/// All transitive children of `root`, excluding `root` itself.
#[must_use]
pub fn descendants(table: &[ProcessEntry], root: u32) -> Vec<u32> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(parent) = queue.pop_front() {
        for entry in table.iter().filter(|e| e.ppid == parent && e.pid != root) {
            if seen.insert(entry.pid) {
                out.push(entry.pid);
                queue.push_back(entry.pid);
            }
        }
    }
    out
}

fn normalize(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_fuzzy_match(args: &str, command: &str) -> bool {
    if args.is_empty() || command.is_empty() {
        return false;
    }
    if args.contains(command) {
        return true;
    }
    // one stage of a pipeline or list
    if args.len() >= 3 && command.contains(args) {
        return true;
    }
    let program = |s: &str| {
        s.split_whitespace()
            .next()
            .and_then(|p| p.rsplit('/').next())
            .map(str::to_owned)
    };
    program(args).is_some_and(|p| p.len() >= 2 && Some(p) == program(command))
}

/// Pick the processes to signal for `command` running under `shell_pid`.
///
/// Candidates are the shell's descendants when the shell is known, otherwise
/// every process. The shell itself and pid 1 are never selected.
#[must_use]
pub fn select_targets(
    table: &[ProcessEntry],
    command: Option<&str>,
    shell_pid: Option<u32>,
) -> Option<KillTarget> {
    let pool: Vec<&ProcessEntry> = match shell_pid {
        Some(shell) => {
            let family: HashSet<u32> = descendants(table, shell).into_iter().collect();
            table.iter().filter(|e| family.contains(&e.pid)).collect()
        }
        None => table.iter().collect(),
    };
    let pool: Vec<&ProcessEntry> = pool
        .into_iter()
        .filter(|e| e.pid > 1 && Some(e.pid) != shell_pid && !e.args.starts_with("ps -eo"))
        .collect();

    let pick = |kind: MatchKind, pred: &dyn Fn(&ProcessEntry) -> bool| {
        let pids: Vec<u32> = pool.iter().filter(|&&e| pred(e)).map(|e| e.pid).collect();
        (!pids.is_empty()).then_some(KillTarget { pids, kind })
    };

    if let Some(command) = command.map(normalize).filter(|c| !c.is_empty()) {
        if let Some(target) = pick(MatchKind::Exact, &|e: &ProcessEntry| {
            normalize(&e.args) == command
        }) {
            return Some(target);
        }
        // Without a shell to anchor on, only a whole-command overlap is trusted.
        let fuzzy = |e: &ProcessEntry| {
            let args = normalize(&e.args);
            if shell_pid.is_some() {
                is_fuzzy_match(&args, &command)
            } else {
                args.contains(&command)
            }
        };
        if let Some(target) = pick(MatchKind::Fuzzy, &fuzzy) {
            return Some(target);
        }
    }

    let shell = shell_pid?;
    pick(MatchKind::Child, &|e: &ProcessEntry| e.ppid == shell)
}

/// Shell command sending SIGKILL to `pids`.
#[must_use]
pub fn kill_command(pids: &[u32]) -> String {
    let list: Vec<String> = pids.iter().map(u32::to_string).collect();
    format!("kill -9 {}", list.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "    1     0 /sbin/init
  100     1 tmux new-session -d -s sp-abc-main
  200   100 bash --noprofile --norc
  201   200 sleep 30
  210   200 python3 -m http.server 8000
  211   210 /usr/bin/python3 worker.py
  300     1 sleep 30
  400   200 ps -eo pid=,ppid=,args=
garbage line
";

    #[test]
    fn parses_table() {
        let table = parse_process_table(TABLE);
        assert_eq!(table.len(), 8);
        assert_eq!(
            table[3],
            ProcessEntry {
                pid: 201,
                ppid: 200,
                args: "sleep 30".into()
            }
        );
    }

    #[test]
    fn descendants_are_transitive() {
        let table = parse_process_table(TABLE);
        let mut d = descendants(&table, 200);
        d.sort_unstable();
        assert_eq!(d, vec![201, 210, 211, 400]);
    }

    #[test]
    fn exact_match_prefers_shell_descendants() {
        let table = parse_process_table(TABLE);
        let target = select_targets(&table, Some("sleep  30"), Some(200)).unwrap();
        assert_eq!(target.kind, MatchKind::Exact);
        assert_eq!(target.pids, vec![201]);
    }

    #[test]
    fn exact_match_without_shell_scans_everything() {
        let table = parse_process_table(TABLE);
        let target = select_targets(&table, Some("sleep 30"), None).unwrap();
        assert_eq!(target.pids, vec![201, 300]);
    }

    #[test]
    fn fuzzy_match_finds_pipeline_stage() {
        let table = parse_process_table(TABLE);
        let target =
            select_targets(&table, Some("python3 -m http.server 8000 | tee log"), Some(200))
                .unwrap();
        assert_eq!(target.kind, MatchKind::Fuzzy);
        assert!(target.pids.contains(&210));
    }

    #[test]
    fn falls_back_to_shell_children() {
        let table = parse_process_table(TABLE);
        let target = select_targets(&table, Some("make build"), Some(200)).unwrap();
        assert_eq!(target.kind, MatchKind::Child);
        assert_eq!(target.pids, vec![201, 210]);
    }

    #[test]
    fn never_selects_shell_or_init() {
        let table = parse_process_table(TABLE);
        for command in ["bash --noprofile --norc", "/sbin/init"] {
            if let Some(target) = select_targets(&table, Some(command), Some(200)) {
                assert!(!target.pids.contains(&200));
                assert!(!target.pids.contains(&1));
            }
        }
        assert!(select_targets(&table, Some("/sbin/init"), None).is_none());
    }

    #[test]
    fn no_shell_and_no_match_is_none() {
        let table = parse_process_table(TABLE);
        assert!(select_targets(&table, Some("cargo build"), None).is_none());
        assert!(select_targets(&table, None, None).is_none());
    }

    #[test]
    fn kill_command_lists_pids() {
        assert_eq!(kill_command(&[201, 210]), "kill -9 201 210");
    }
}
