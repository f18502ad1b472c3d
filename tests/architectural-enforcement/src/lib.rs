//! Architectural Enforcement Integration Tests
//!
//! Source scanners run as integration tests:
//! - No sleep calls in production code (waits are event driven)
//! - No blocking filesystem or network I/O inside async functions
//!
//! Only `src/` trees under `airouter/` are scanned. `#[cfg(test)]` modules
//! are cut off at their first line.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// A rule hit in a source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the hit
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// Trimmed source line
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.path.display(), self.line, self.text)
    }
}

/// Workspace root, two levels above this crate
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Every `.rs` file under `airouter/*/src`
pub fn production_sources(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root.join("airouter"))
        .into_iter()
        .filter_map(Result::ok)
        .map(walkdir::DirEntry::into_path)
        .filter(|p| p.extension().is_some_and(|e| e == "rs"))
        .filter(|p| p.components().any(|c| c.as_os_str() == "src"))
        .collect()
}

/// Lines before the first `#[cfg(test)]`, with comments dropped
pub fn production_lines(source: &str) -> Vec<(usize, &str)> {
    source
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .map(|(i, line)| (i + 1, line))
        .filter(|(_, line)| {
            let trimmed = line.trim_start();
            !trimmed.starts_with("//")
        })
        .collect()
}

/// Lines calling a `sleep` function
///
/// `sleep_until` deadlines are allowed; they bound a stream, they do not
/// poll for a condition.
pub fn find_sleep_calls(path: &Path, source: &str) -> Vec<Violation> {
    production_lines(source)
        .into_iter()
        .filter(|(_, line)| line.contains("::sleep(") || line.contains(".sleep("))
        .map(|(line, text)| Violation {
            path: path.to_path_buf(),
            line,
            text: text.trim().to_string(),
        })
        .collect()
}

const BLOCKING_CALLS: &[&str] = &[
    "std::fs::read",
    "std::fs::write",
    "std::fs::File::open",
    "std::net::TcpStream",
    "std::thread::sleep",
    "reqwest::blocking",
];

/// Blocking calls inside the body of an `async fn`
///
/// Brace depth is tracked from the `async fn` line until its body closes.
pub fn find_blocking_in_async(path: &Path, source: &str) -> Vec<Violation> {
    let mut violations = Vec::new();
    let mut depth: i64 = 0;
    let mut in_async = false;

    for (line, text) in production_lines(source) {
        if !in_async && text.contains("async fn ") {
            in_async = true;
            depth = 0;
        }
        if !in_async {
            continue;
        }

        if BLOCKING_CALLS.iter().any(|call| text.contains(call)) {
            violations.push(Violation {
                path: path.to_path_buf(),
                line,
                text: text.trim().to_string(),
            });
        }

        for c in text.chars() {
            match c {
                '{' => depth += 1,
                '}' => depth -= 1,
                _ => {}
            }
        }
        // Bodiless trait method or a closed body
        if depth <= 0 && (text.contains('}') || text.trim_end().ends_with(';')) {
            in_async = false;
        }
    }
    violations
}

/// Apply a scanner to every production source
pub fn scan(root: &Path, scanner: fn(&Path, &str) -> Vec<Violation>) -> Vec<Violation> {
    production_sources(root)
        .iter()
        .filter_map(|path| fs::read_to_string(path).ok().map(|src| (path, src)))
        .flat_map(|(path, src)| scanner(path, &src))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_detection() {
        let source = "async fn f() {\n    tokio::time::sleep(d).await;\n    let s = tokio::time::sleep_until(t);\n}\n";
        let hits = find_sleep_calls(Path::new("x.rs"), source);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].line, 2);
    }

    #[test]
    fn test_test_modules_are_ignored() {
        let source = "fn f() {}\n#[cfg(test)]\nmod tests {\n    fn g() { std::thread::sleep(d); }\n}\n";
        assert!(find_sleep_calls(Path::new("x.rs"), source).is_empty());
    }

    #[test]
    fn test_blocking_in_async_detection() {
        let source = "fn sync_ok() {\n    std::fs::read(p);\n}\nasync fn bad() {\n    if x {\n        std::fs::read(p);\n    }\n}\nfn after() {\n    std::fs::write(p, b);\n}\n";
        let hits = find_blocking_in_async(Path::new("x.rs"), source);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].line, 6);
    }
}
