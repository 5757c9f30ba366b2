//! Wildcard module filter lists.
//!
//! Option-file filter entries use shell-style wildcards (`*`, `?`) and
//! match case-insensitively against module names. Each list compiles once
//! at gate construction into anchored regexes.

use regex::Regex;
use tracing::warn;

pub struct FilterList {
    patterns: Vec<Regex>,
}

fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push_str("(?i)^");
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

impl FilterList {
    pub fn compile(raw: &[String]) -> Self {
        let mut patterns = Vec::with_capacity(raw.len());
        for p in raw {
            match Regex::new(&wildcard_to_regex(p)) {
                Ok(re) => patterns.push(re),
                Err(e) => {
                    warn!(target: "policy", pattern = p.as_str(), error = %e, "filter pattern rejected");
                }
            }
        }
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, module_name: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(module_name))
    }
}

/// All compiled lists the gate consults.
pub struct CompiledFilters {
    pub exempt_text: FilterList,
    pub dll2heap: FilterList,
    pub dll2stack: FilterList,
}

impl CompiledFilters {
    pub fn compile(lists: &core_config::FilterLists) -> Self {
        Self {
            exempt_text: FilterList::compile(&lists.exempt_text),
            dll2heap: FilterList::compile(&lists.dll2heap),
            dll2stack: FilterList::compile(&lists.dll2stack),
        }
    }
}
