//! Groups failed universes by the line of their error output that best
//! identifies the failure.

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::config::MonitorConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorGroup {
    pub key: String,
    pub uids: Vec<u64>,
}

/// Key used for a universe that exited non-zero without any error output.
pub const NO_OUTPUT_KEY: &str = "(no error output)";

/// Incremental error clustering over the exit-status sequence. Each call to
/// [`ErrorClusterer::update`] only reads universes it has not seen yet.
#[derive(Debug, Clone)]
pub struct ErrorClusterer {
    skip: Regex,
    matcher: Regex,
    file_pattern: String,
    groups: Vec<ErrorGroup>,
    processed: usize,
}

impl ErrorClusterer {
    pub fn new(skip_pattern: &str, match_pattern: &str, file_pattern: &str) -> Result<Self> {
        let skip = RegexBuilder::new(skip_pattern)
            .case_insensitive(true)
            .build()
            .with_context(|| format!("invalid error skip pattern {:?}", skip_pattern))?;
        let matcher = RegexBuilder::new(match_pattern)
            .case_insensitive(true)
            .build()
            .with_context(|| format!("invalid error match pattern {:?}", match_pattern))?;
        Ok(Self {
            skip,
            matcher,
            file_pattern: file_pattern.to_string(),
            groups: Vec::new(),
            processed: 0,
        })
    }

    pub fn from_config(cfg: &MonitorConfig) -> Result<Self> {
        Self::new(&cfg.error_skip_pattern, &cfg.error_match_pattern, &cfg.error_file_pattern)
    }

    pub fn groups(&self) -> &[ErrorGroup] {
        &self.groups
    }

    pub fn error_file(&self, log_dir: &Path, uid: u64) -> std::path::PathBuf {
        log_dir.join(self.file_pattern.replace("{}", &uid.to_string()))
    }

    /// The cluster key for one universe's error output, or `None` if it
    /// contributes nothing.
    ///
    /// The key is the first line not matching the skip pattern. For a
    /// non-zero exit, scanning continues from there for the first line that
    /// matches the error pattern, which replaces the key when found.
    pub fn key_for(&self, text: &str, exit_code: i32) -> Option<String> {
        let mut lines = text.lines().map(str::trim_end);
        let first = lines.by_ref().find(|l| !self.skip.is_match(l)).map(str::to_string);
        if exit_code == 0 {
            return first;
        }
        let first = first?;
        if self.matcher.is_match(&first) {
            return Some(first);
        }
        Some(
            lines
                .find(|l| !self.skip.is_match(l) && self.matcher.is_match(l))
                .map(str::to_string)
                .unwrap_or(first),
        )
    }

    /// Reads error files for the exit records after the last processed one.
    /// Returns whether any group changed.
    pub fn update(&mut self, log_dir: &Path, exit_codes: &[(u64, i32)]) -> bool {
        let mut changed = false;
        for &(uid, code) in exit_codes.iter().skip(self.processed) {
            let text = fs::read_to_string(self.error_file(log_dir, uid)).unwrap_or_default();
            let key = match self.key_for(&text, code) {
                Some(k) => Some(k),
                None if code != 0 => Some(NO_OUTPUT_KEY.to_string()),
                None => None,
            };
            if let Some(key) = key {
                match self.groups.iter_mut().find(|g| g.key == key) {
                    Some(g) => g.uids.push(uid),
                    None => self.groups.push(ErrorGroup { key, uids: vec![uid] }),
                }
                changed = true;
            }
        }
        self.processed = self.processed.max(exit_codes.len());
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn clusterer() -> ErrorClusterer {
        ErrorClusterer::from_config(&MonitorConfig::default()).unwrap()
    }

    #[test]
    fn test_key_skips_noise_lines() {
        let c = clusterer();
        let text = "\nWarning: package loaded\nsomething odd happened\n";
        assert_eq!(c.key_for(text, 0).as_deref(), Some("something odd happened"));
    }

    #[test]
    fn test_nonzero_exit_prefers_error_line() {
        let c = clusterer();
        let text = "Loading data\nfit converged slowly\nError in solve(): singular matrix\n";
        assert_eq!(c.key_for(text, 1).as_deref(), Some("Error in solve(): singular matrix"));
        assert_eq!(c.key_for(text, 0).as_deref(), Some("fit converged slowly"));
    }

    #[test]
    fn test_empty_output_has_no_key() {
        let c = clusterer();
        assert_eq!(c.key_for("  \nwarning: x\n", 2), None);
    }

    #[test]
    fn test_update_is_incremental() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("error_1.txt"), "ValueError: bad input\n").unwrap();
        fs::write(dir.path().join("error_3.txt"), "ValueError: bad input\n").unwrap();
        let mut c = clusterer();

        let mut exits = vec![(1, 1), (2, 0)];
        assert!(c.update(dir.path(), &exits));
        assert_eq!(c.groups().len(), 1);

        exits.push((3, 1));
        exits.push((4, 137));
        assert!(c.update(dir.path(), &exits));
        assert_eq!(c.groups()[0].uids, vec![1, 3]);
        assert_eq!(c.groups()[1], ErrorGroup { key: NO_OUTPUT_KEY.to_string(), uids: vec![4] });

        // nothing new
        assert!(!c.update(dir.path(), &exits));
        assert_eq!(c.groups()[0].uids.len(), 2);
    }

    #[test]
    fn test_bad_pattern_is_reported() {
        assert!(ErrorClusterer::new("(", "error", "e_{}.txt").is_err());
    }
}
