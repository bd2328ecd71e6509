//! Ignore list shared by content hashing and build-context packaging.
//!
//! Patterns come from the template's `.buildignore` (one per line, `#`
//! comments) plus a fixed set of editor/VCS artifacts. A pattern without a
//! `/` matches any single path component; a pattern with a `/` matches the
//! whole relative path. `*` and `?` wildcards are supported.

use std::path::Path;

pub const IGNORE_FILE_NAME: &str = ".buildignore";

const ALWAYS_IGNORED: &[&str] = &[".git", ".DS_Store", "*.swp", "*.swo", "*~"];

#[derive(Debug, Clone, PartialEq)]
pub struct IgnoreList {
    patterns: Vec<String>,
}

impl IgnoreList {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = Self {
            patterns: ALWAYS_IGNORED.iter().map(|p| p.to_string()).collect(),
        };
        for pattern in patterns {
            let pattern = pattern.into();
            let pattern = pattern.trim().trim_end_matches('/').trim_start_matches("./");
            if !pattern.is_empty() && !pattern.starts_with('#') {
                list.patterns.push(pattern.to_string());
            }
        }
        list
    }

    /// Load `<dir>/.buildignore`; a missing file yields the defaults.
    pub fn load(dir: &Path) -> std::io::Result<Self> {
        match std::fs::read_to_string(dir.join(IGNORE_FILE_NAME)) {
            Ok(content) => Ok(Self::new(content.lines())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// `rel` is relative to the template directory.
    pub fn is_ignored(&self, rel: &Path) -> bool {
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        self.patterns.iter().any(|pattern| {
            if pattern.contains('/') {
                wildcard_match(pattern, &rel_str)
                    || rel_str.starts_with(&format!("{}/", pattern))
            } else {
                rel.components()
                    .any(|c| wildcard_match(pattern, &c.as_os_str().to_string_lossy()))
            }
        })
    }
}

impl Default for IgnoreList {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star_p, star_t)) = backtrack {
            pi = star_p + 1;
            ti = star_t + 1;
            backtrack = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}
