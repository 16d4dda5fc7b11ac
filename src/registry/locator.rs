//! Pipeline source list parsing.

use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::SyncError;

/// Valid pipeline and component names: they become path segments, task key
/// fields and experiment names.
fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("valid regex"))
}

pub(crate) fn is_valid_name(name: &str) -> bool {
    name_pattern().is_match(name)
}

/// One entry of the pipeline source list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineLocator {
    /// The locator exactly as configured (URL or local path).
    pub raw: String,
    /// Pipeline name derived from the last path segment.
    pub name: String,
}

impl PipelineLocator {
    /// Derives the pipeline name: the last path segment with `.git` removed.
    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        let trimmed = raw.trim().trim_end_matches(['/', '\\']);
        let segment = trimmed
            .rsplit(['/', '\\', ':'])
            .next()
            .unwrap_or(trimmed);
        let name = segment.strip_suffix(".git").unwrap_or(segment);

        if !is_valid_name(name) {
            return Err(SyncError::InvalidLocator(raw.to_string()));
        }

        Ok(Self {
            raw: raw.trim().to_string(),
            name: name.to_string(),
        })
    }

    /// True when the locator names a remote repository rather than a directory.
    pub fn is_remote(&self) -> bool {
        self.raw.contains("://") || self.raw.starts_with("git@") || self.raw.ends_with(".git")
    }
}

impl fmt::Display for PipelineLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Reads the pipeline source list, one locator per line.
///
/// Line terminators are stripped and lines that are then empty are skipped.
/// There is no comment syntax.
pub fn read_source_list(path: &Path) -> std::io::Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect())
}
