//! Debugging hooks. The interpreter reports sends and export calls to an
//! installed hook; [`Breakpoints`] is the stock implementation, matching
//! `object::selector` patterns with `*`/`?` wildcards.

use log::info;

/// Observer for interpreter events. Returning `true` marks the event as a
/// breakpoint hit; the interpreter logs it and carries on.
pub trait DebugHook {
    fn on_send(&mut self, object: &str, selector: &str) -> bool;
    fn on_export_call(&mut self, script: u16, export: u16) -> bool;
}

/// Glob match supporting `*` (any run) and `?` (any one byte). A pattern
/// ending in `:` matches any name with that prefix, so `ego:` hits every
/// send to `ego`.
pub fn pattern_matches(pattern: &str, text: &str) -> bool {
    let mut pat: Vec<char> = pattern.chars().collect();
    if pat.last() == Some(&':') {
        pat.push('*');
    }
    let txt: Vec<char> = text.chars().collect();
    // iterative backtracking over the last `*`
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < txt.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

#[derive(Debug, Default)]
pub struct Breakpoints {
    /// `object::selector` patterns
    send_patterns: Vec<String>,
    /// (script, export); `None` is a wildcard
    exports: Vec<(Option<u16>, Option<u16>)>,
    pub hits: u32,
}

impl Breakpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_send_pattern(&mut self, pattern: &str) {
        self.send_patterns.push(pattern.to_owned());
    }

    pub fn add_export(&mut self, script: Option<u16>, export: Option<u16>) {
        self.exports.push((script, export));
    }

    pub fn is_empty(&self) -> bool {
        self.send_patterns.is_empty() && self.exports.is_empty()
    }
}

impl DebugHook for Breakpoints {
    fn on_send(&mut self, object: &str, selector: &str) -> bool {
        let name = format!("{object}::{selector}");
        let hit = self.send_patterns.iter().any(|p| pattern_matches(p, &name));
        if hit {
            self.hits += 1;
            info!("breakpoint: send {name}");
        }
        hit
    }

    fn on_export_call(&mut self, script: u16, export: u16) -> bool {
        let hit = self.exports.iter().any(|&(s, e)| {
            s.is_none_or(|s| s == script) && e.is_none_or(|e| e == export)
        });
        if hit {
            self.hits += 1;
            info!("breakpoint: export call {script}:{export}");
        }
        hit
    }
}
