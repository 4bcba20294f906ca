// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Ignore rule engine.
//!
//! Merge explicit ignore globs, descriptor-declared exclusions, and mandatory
//! exclusions into one predicate. The change index and the watch loop share
//! this predicate, so a path ignored here is never synchronized.
//!
//! # Pattern Semantics
//!
//! Patterns follow gitignore rules relative to the synchronization root, e.g.,
//! "*.log" matches log files at any depth, "/dist" only matches at the top
//! level, and "build/" only matches directories. Matching is case-sensitive,
//! and Windows style separators are normalized before matching.

use crate::path::{normalize_separators, INTERNAL_DIR, VCS_DIR};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument, warn};

/// Ignore files looked up at the synchronization root, in order of priority.
pub const IGNORE_FILES: [&str; 2] = [".devsyncignore", ".gitignore"];

/// Where non-mandatory patterns of an [`IgnoreSet`] came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreSource {
    /// Patterns were given explicitly by the caller.
    Explicit,

    /// Patterns were read from an ignore file.
    File(PathBuf),

    /// No ignore file could be used, only mandatory patterns apply.
    Fallback { reason: String },
}

/// Set of ignore patterns rooted at a synchronization root.
///
/// # Invariant
///
/// - Mandatory patterns for the internal directory and the VCS directory are
///   always present.
/// - No duplicate patterns.
#[derive(Debug, Clone)]
pub struct IgnoreSet {
    root: PathBuf,
    patterns: Vec<String>,
    source: IgnoreSource,
    matcher: Gitignore,
}

impl IgnoreSet {
    /// Build ignore set for synchronization root.
    ///
    /// If `explicit` is empty, patterns are derived from the first ignore file
    /// found at `root`. Failing to read it is not fatal. Instead the set falls
    /// back to mandatory patterns, and reports this through
    /// [`IgnoreSet::source`]. Descriptor-declared exclusions and mandatory
    /// patterns are appended in all cases.
    ///
    /// # Errors
    ///
    /// - Return [`IgnoreError::InvalidPattern`] if a pattern cannot be
    ///   compiled.
    #[instrument(skip(explicit, declared, root), level = "debug")]
    pub fn build(
        explicit: &[String],
        declared: &[String],
        root: impl AsRef<Path>,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let (mut patterns, source) = if explicit.is_empty() {
            discover(&root)
        } else {
            (explicit.to_vec(), IgnoreSource::Explicit)
        };

        patterns.extend(declared.iter().cloned());
        patterns.extend(mandatory_patterns());

        let mut unique = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let pattern = pattern.trim().replace('\\', "/");
            if pattern.is_empty() || pattern.starts_with('#') || unique.contains(&pattern) {
                continue;
            }
            unique.push(pattern);
        }

        let mut builder = GitignoreBuilder::new(&root);
        builder.case_insensitive(false)?;
        for pattern in &unique {
            builder
                .add_line(None, pattern)
                .map_err(|err| IgnoreError::InvalidPattern {
                    source: err,
                    pattern: pattern.clone(),
                })?;
        }
        let matcher = builder.build()?;
        debug!("ignore set for {} from {:?}: {:?}", root.display(), source, unique);

        Ok(Self {
            root,
            patterns: unique,
            source,
            matcher,
        })
    }

    /// Synchronization root patterns are relative to.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All patterns in the set, in insertion order.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Origin of the non-mandatory patterns.
    pub fn source(&self) -> &IgnoreSource {
        &self.source
    }

    /// Match path against ignore set.
    ///
    /// Accepts absolute paths under the root, or paths relative to it. A path
    /// is ignored if it, or any of its parent directories, matches. Paths
    /// outside of the root are never ignored.
    pub fn is_ignored(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let relative = if path.is_absolute() {
            match path.strip_prefix(&self.root) {
                Ok(relative) => relative,
                Err(_) => return false,
            }
        } else {
            path
        };

        let key = normalize_separators(relative);
        if key.is_empty() {
            return false;
        }

        let is_dir = self.root.join(&key).is_dir();
        self.matcher
            .matched_path_or_any_parents(Path::new(&key), is_dir)
            .is_ignore()
    }
}

/// Patterns that are part of every ignore set.
pub fn mandatory_patterns() -> [String; 2] {
    [format!("/{INTERNAL_DIR}/"), format!("{VCS_DIR}/")]
}

fn discover(root: &Path) -> (Vec<String>, IgnoreSource) {
    for name in IGNORE_FILES {
        let path = root.join(name);
        if !path.is_file() {
            continue;
        }

        return match read_to_string(&path) {
            Ok(content) => {
                let patterns = content.lines().map(str::to_owned).collect();
                (patterns, IgnoreSource::File(path))
            }
            Err(err) => {
                warn!(
                    "cannot read {}, only mandatory ignore rules apply: {err}",
                    path.display()
                );
                let reason = format!("cannot read {}: {err}", path.display());
                (Vec::new(), IgnoreSource::Fallback { reason })
            }
        };
    }

    let reason = format!("no ignore file found at {}", root.display());
    debug!("{reason}, only mandatory ignore rules apply");
    (Vec::new(), IgnoreSource::Fallback { reason })
}

/// Ignore rule error types.
#[derive(Debug, thiserror::Error)]
pub enum IgnoreError {
    /// A pattern is not a valid glob.
    #[error("invalid ignore pattern {pattern:?}")]
    InvalidPattern {
        #[source]
        source: ignore::Error,
        pattern: String,
    },

    /// Matcher could not be built.
    #[error(transparent)]
    Matcher(#[from] ignore::Error),
}

/// Friendly result alias :3
type Result<T, E = IgnoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use simple_test_case::test_case;
    use std::{env::current_dir, fs};

    #[sealed_test]
    fn mandatory_patterns_always_present() -> anyhow::Result<()> {
        let root = current_dir()?;
        let set = IgnoreSet::build(&["*.log".into(), ".git/".into()], &[], &root)?;
        assert_eq!(set.patterns(), ["*.log", ".git/", "/.devsync/"]);
        assert_eq!(set.source(), &IgnoreSource::Explicit);

        Ok(())
    }

    #[sealed_test]
    fn ignore_file_seeds_patterns() -> anyhow::Result<()> {
        let root = current_dir()?;
        fs::write(
            root.join(".gitignore"),
            indoc! {r#"
                # build output
                dist/
                *.tmp
            "#},
        )?;
        fs::write(root.join(".devsyncignore"), "node_modules/\n")?;

        let set = IgnoreSet::build(&[], &["coverage/".into()], &root)?;
        assert_eq!(
            set.patterns(),
            ["node_modules/", "coverage/", "/.devsync/", ".git/"]
        );
        assert_eq!(set.source(), &IgnoreSource::File(root.join(".devsyncignore")));

        Ok(())
    }

    #[sealed_test]
    fn missing_ignore_file_falls_back() -> anyhow::Result<()> {
        let root = current_dir()?;
        let set = IgnoreSet::build(&[], &[], &root)?;
        assert_eq!(set.patterns(), mandatory_patterns());
        assert!(matches!(set.source(), IgnoreSource::Fallback { .. }));

        Ok(())
    }

    #[test_case("app.ignoreme", true; "glob on file name")]
    #[test_case("nested/deep/x.ignoreme", true; "glob at depth")]
    #[test_case("dist/bundle.js", true; "anchored directory")]
    #[test_case("src/dist/bundle.js", false; "anchored directory elsewhere")]
    #[test_case(".git/HEAD", true; "vcs directory")]
    #[test_case(".devsync/file-index.json", true; "index file")]
    #[test_case(".devsync/file-index.json.tmp", true; "index temp file")]
    #[test_case("App.IGNOREME", false; "case sensitive")]
    #[test_case("src\\dist\\x.ignoreme", true; "backslash separators")]
    #[test_case("app.js", false; "plain file")]
    #[test]
    fn match_paths(path: &str, expect: bool) {
        let set = IgnoreSet::build(
            &["*.ignoreme".into(), "/dist".into()],
            &[],
            "/nonexistent/root",
        )
        .expect("valid patterns");
        pretty_assertions::assert_eq!(set.is_ignored(path), expect);
    }

    #[test]
    fn absolute_paths_outside_root_are_not_ignored() {
        let set = IgnoreSet::build(&["*".into()], &[], "/nonexistent/root").expect("valid");
        assert!(set.is_ignored("/nonexistent/root/a.txt"));
        assert!(!set.is_ignored("/elsewhere/a.txt"));
    }
}
