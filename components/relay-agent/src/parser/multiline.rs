// External crates
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

fn default_max_lines() -> usize {
    500
}

fn default_timeout_ms() -> u64 {
    5000
}

/// Which side of the anchor line the continuations attach to.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// The anchor starts a record; following lines continue it.
    After,
    /// Continuations accumulate first; the anchor terminates the record.
    Before,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultilineConfig {
    /// Anchor pattern deciding whether a line starts (or, under `before`,
    /// terminates) a record.
    pub pattern: String,
    /// Invert the anchor test: lines that fail to match start a record.
    #[serde(default)]
    pub negate: bool,
    #[serde(default = "default_match_mode", rename = "match")]
    pub match_mode: MatchMode,
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_match_mode() -> MatchMode {
    MatchMode::After
}

#[derive(Debug)]
struct Pending {
    lines: Vec<String>,
    first_at: Instant,
}

impl Pending {
    fn new(line: String) -> Self {
        Self {
            lines: vec![line],
            first_at: Instant::now(),
        }
    }

    fn join(self) -> String {
        self.lines.join("\n")
    }
}

/// Joins physical lines into logical records, one pending buffer per
/// source. A record closes on the next anchor, on `max_lines`, on `timeout`
/// since its first line, or on flush at shutdown.
#[derive(Debug)]
pub struct MultilineAssembler {
    regex: Regex,
    negate: bool,
    match_mode: MatchMode,
    max_lines: usize,
    timeout: Duration,
    pending: HashMap<String, Pending>,
}

impl MultilineAssembler {
    pub fn new(config: &MultilineConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(&config.pattern)?,
            negate: config.negate,
            match_mode: config.match_mode,
            max_lines: config.max_lines.max(1),
            timeout: Duration::from_millis(config.timeout_ms),
            pending: HashMap::new(),
        })
    }

    fn is_anchor(&self, line: &str) -> bool {
        self.regex.is_match(line) != self.negate
    }

    /// Feed one line for `source`; returns any records completed by it.
    pub fn feed(&mut self, source: &str, line: &str) -> Vec<String> {
        let mut completed = Vec::new();
        let anchor = self.is_anchor(line);

        match self.match_mode {
            MatchMode::After => {
                if anchor {
                    if let Some(prev) = self.pending.remove(source) {
                        completed.push(prev.join());
                    }
                    self.pending
                        .insert(source.to_string(), Pending::new(line.to_string()));
                } else {
                    match self.pending.get_mut(source) {
                        Some(pending) => pending.lines.push(line.to_string()),
                        // A continuation with no open record still opens one;
                        // the record simply has no anchor line.
                        None => {
                            self.pending
                                .insert(source.to_string(), Pending::new(line.to_string()));
                        }
                    }
                }
            }
            MatchMode::Before => {
                let pending = self
                    .pending
                    .entry(source.to_string())
                    .or_insert_with(|| Pending {
                        lines: Vec::new(),
                        first_at: Instant::now(),
                    });
                pending.lines.push(line.to_string());
                if anchor {
                    if let Some(done) = self.pending.remove(source) {
                        completed.push(done.join());
                    }
                }
            }
        }

        if let Some(pending) = self.pending.get(source) {
            if pending.lines.len() >= self.max_lines {
                if let Some(done) = self.pending.remove(source) {
                    completed.push(done.join());
                }
            }
        }
        completed
    }

    /// Emit records whose first line is older than the configured timeout.
    pub fn flush_expired(&mut self) -> Vec<(String, String)> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.first_at) >= self.timeout)
            .map(|(source, _)| source.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|source| {
                self.pending
                    .remove(&source)
                    .map(|p| (source, p.join()))
            })
            .collect()
    }

    /// Emit every pending record. Called on graceful stop so trailing
    /// partial records are not lost; a hard stop simply drops the assembler.
    pub fn flush_all(&mut self) -> Vec<(String, String)> {
        self.pending
            .drain()
            .map(|(source, p)| (source, p.join()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembler(pattern: &str, negate: bool, match_mode: MatchMode) -> MultilineAssembler {
        MultilineAssembler::new(&MultilineConfig {
            pattern: pattern.to_string(),
            negate,
            match_mode,
            max_lines: 10,
            timeout_ms: 5000,
        })
        .unwrap()
    }

    #[test]
    fn stack_trace_joined_after_anchor() {
        let mut asm = assembler(r"^\d{4}-", false, MatchMode::After);
        assert!(asm.feed("f", "2026-01-01 boom").is_empty());
        assert!(asm.feed("f", "  at Foo.bar(Foo.java:1)").is_empty());
        assert!(asm.feed("f", "  at Baz.qux(Baz.java:2)").is_empty());
        let done = asm.feed("f", "2026-01-02 next");
        assert_eq!(
            done,
            vec!["2026-01-01 boom\n  at Foo.bar(Foo.java:1)\n  at Baz.qux(Baz.java:2)"]
        );
    }

    #[test]
    fn negate_inverts_anchor_test() {
        // Continuation lines are the ones matching; records start on a miss.
        let mut asm = assembler(r"^\s", true, MatchMode::After);
        assert!(asm.feed("f", "first").is_empty());
        assert!(asm.feed("f", "  cont").is_empty());
        let done = asm.feed("f", "second");
        assert_eq!(done, vec!["first\n  cont"]);
    }

    #[test]
    fn before_mode_emits_on_anchor() {
        let mut asm = assembler(r"\\$", true, MatchMode::Before);
        // Lines ending in a backslash continue; the first line without one
        // terminates the record.
        assert!(asm.feed("f", r"part one \").is_empty());
        assert!(asm.feed("f", r"part two \").is_empty());
        let done = asm.feed("f", "part three");
        assert_eq!(done, vec!["part one \\\npart two \\\npart three"]);
    }

    #[test]
    fn max_lines_forces_emission() {
        let mut asm = MultilineAssembler::new(&MultilineConfig {
            pattern: r"^START".to_string(),
            negate: false,
            match_mode: MatchMode::After,
            max_lines: 3,
            timeout_ms: 5000,
        })
        .unwrap();
        assert!(asm.feed("f", "START a").is_empty());
        assert!(asm.feed("f", "b").is_empty());
        let done = asm.feed("f", "c");
        assert_eq!(done, vec!["START a\nb\nc"]);
    }

    #[test]
    fn timeout_flushes_pending() {
        let mut asm = MultilineAssembler::new(&MultilineConfig {
            pattern: r"^START".to_string(),
            negate: false,
            match_mode: MatchMode::After,
            max_lines: 10,
            timeout_ms: 0,
        })
        .unwrap();
        assert!(asm.feed("f", "START a").is_empty());
        let flushed = asm.flush_expired();
        assert_eq!(flushed, vec![("f".to_string(), "START a".to_string())]);
        assert!(asm.flush_expired().is_empty());
    }

    #[test]
    fn sources_are_independent() {
        let mut asm = assembler(r"^START", false, MatchMode::After);
        assert!(asm.feed("a", "START one").is_empty());
        assert!(asm.feed("b", "START two").is_empty());
        assert!(asm.feed("a", "  cont").is_empty());
        let done = asm.feed("a", "START three");
        assert_eq!(done, vec!["START one\n  cont"]);

        let mut all = asm.flush_all();
        all.sort();
        assert_eq!(
            all,
            vec![
                ("a".to_string(), "START three".to_string()),
                ("b".to_string(), "START two".to_string()),
            ]
        );
    }
}
