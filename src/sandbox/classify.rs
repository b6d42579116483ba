//! Long-running command detection.
//!
//! Commands that install packages, build, serve or run test suites are
//! started detached and supervised instead of being awaited inline by the
//! dispatch loop.

use regex::Regex;

use crate::Result;

const LONG_RUNNING_PATTERNS: &[&str] = &[
    // Package installs
    r"\b(npm|pnpm|yarn|bun)\s+(install|i|ci|add)\b",
    r"\bpip3?\s+install\b",
    r"\b(uv|poetry)\s+(sync|install|add)\b",
    r"\bapt(-get)?\s+install\b",
    r"\bcargo\s+(install|fetch)\b",
    r"\bgo\s+(get|mod\s+download)\b",
    // Builds
    r"\bcargo\s+(build|check|clippy)\b",
    r"\b(npm|pnpm|yarn|bun)\s+(run\s+)?build\b",
    r"\bgo\s+build\b",
    r"^\s*make\b",
    r"\b(mvn|gradle|gradlew)\b",
    r"\bdocker\s+(build|compose)\b",
    // Dev servers
    r"\b(npm|pnpm|yarn|bun)\s+(run\s+)?(dev|start|serve)\b",
    r"\b(uvicorn|gunicorn|flask\s+run|rails\s+s(erver)?)\b",
    r"\bpython3?\s+-m\s+http\.server\b",
    r"\bmanage\.py\s+runserver\b",
    // Test runners
    r"\bcargo\s+(test|nextest)\b",
    r"\b(npm|pnpm|yarn|bun)\s+(run\s+)?test\b",
    r"\bgo\s+test\b",
    r"\b(pytest|jest|vitest|mocha|tox)\b",
];

/// Classifies commands as long-running by regex.
#[derive(Debug, Clone)]
pub struct CommandClassifier {
    patterns: Vec<Regex>,
}

impl CommandClassifier {
    /// Built-in patterns plus `extra`.
    ///
    /// # Errors
    /// Returns `Error::Regex` if an extra pattern does not compile.
    pub fn new(extra: &[String]) -> Result<Self> {
        let mut patterns = Vec::with_capacity(LONG_RUNNING_PATTERNS.len() + extra.len());
        for pattern in LONG_RUNNING_PATTERNS {
            patterns.push(Regex::new(pattern)?);
        }
        for pattern in extra {
            patterns.push(Regex::new(pattern)?);
        }
        Ok(Self { patterns })
    }

    pub fn is_long_running(&self, command: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(command))
    }
}
