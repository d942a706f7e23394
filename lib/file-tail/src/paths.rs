//! Glob-based file discovery for the harvester.

use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use tracing::warn;

/// Extensions never tailed, even when the include glob is `*.*`. Compressed
/// archives are rotation artifacts, not live log targets.
const EXCLUDED_EXTENSIONS: &[&str] = &["7z", "bz2", "gz", "rar", "tar", "tgz", "xz", "zip", "zst"];

/// Produces the current set of files matching the include patterns under a
/// directory, minus exclusions and denylisted extensions.
pub struct GlobPaths {
    include_patterns: Vec<String>,
    exclude_patterns: Vec<Pattern>,
    match_options: MatchOptions,
}

impl GlobPaths {
    /// Build a provider for `directory`. `include` entries are file globs
    /// relative to the directory (`*.log`, `app-*.txt`); when `recursive`
    /// is set each include is also applied under every sub-directory.
    /// `exclude` patterns are matched against the full candidate path, so
    /// they can prune sub-directories as well as files.
    pub fn new(
        directory: &Path,
        include: &[String],
        exclude: &[String],
        recursive: bool,
    ) -> Option<Self> {
        let mut include_patterns = Vec::new();
        for pattern in include {
            include_patterns.push(directory.join(pattern).to_str()?.to_owned());
            if recursive {
                include_patterns.push(directory.join("**").join(pattern).to_str()?.to_owned());
            }
        }

        let exclude_patterns = exclude
            .iter()
            .map(|pattern| {
                directory
                    .join(pattern)
                    .to_str()
                    .and_then(|p| Pattern::new(p).ok())
            })
            .collect::<Option<Vec<_>>>()?;

        Some(GlobPaths {
            include_patterns,
            exclude_patterns,
            match_options: MatchOptions::default(),
        })
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .include_patterns
            .iter()
            .flat_map(|include_pattern| {
                glob::glob_with(include_pattern.as_str(), self.match_options)
                    .expect("glob pattern built from validated parts")
                    .filter_map(|entry| {
                        entry
                            .map_err(|error| {
                                warn!(message = "Error while globbing paths.", %error);
                            })
                            .ok()
                    })
            })
            .filter(|candidate| candidate.is_file())
            .filter(|candidate| !is_denylisted(candidate))
            .filter(|candidate| {
                let Some(candidate_str) = candidate.to_str() else {
                    return false;
                };
                !self
                    .exclude_patterns
                    .iter()
                    .any(|exclude| exclude.matches(candidate_str))
            })
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }
}

fn is_denylisted(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            EXCLUDED_EXTENSIONS.iter().any(|deny| *deny == ext)
        })
        .unwrap_or(false)
}
