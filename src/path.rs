// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevent path information for files that devsync owns, or needs
//! to reason about relative to a synchronization root.

use std::path::{Component, Path, PathBuf};

/// Name of internal directory devsync keeps under each synchronization root.
pub const INTERNAL_DIR: &str = ".devsync";

/// Name of change-index file inside [`INTERNAL_DIR`].
pub const INDEX_FILE: &str = "file-index.json";

/// Name of version control metadata directory that is never synchronized.
pub const VCS_DIR: &str = ".git";

/// Name of component descriptor looked up under a synchronization root.
pub const DESCRIPTOR_FILE: &str = "devfile.yaml";

/// Determine default absolute path to engine configuration file.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/devsync/config.toml` as the
/// default. Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoConfigDir`] if configuration directory cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_config_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("devsync").join("config.toml"))
        .ok_or(NoConfigDir)
}

/// Absolute path to the internal directory of a synchronization root.
pub fn internal_dir(root: impl AsRef<Path>) -> PathBuf {
    root.as_ref().join(INTERNAL_DIR)
}

/// Absolute path to the change-index file of a synchronization root.
pub fn index_path(root: impl AsRef<Path>) -> PathBuf {
    internal_dir(root).join(INDEX_FILE)
}

/// Absolute path to the default component descriptor of a synchronization
/// root.
pub fn descriptor_path(root: impl AsRef<Path>) -> PathBuf {
    root.as_ref().join(DESCRIPTOR_FILE)
}

/// Convert path relative to `root` into a `/` separated key.
///
/// Returns `None` if `path` does not live under `root`, or names `root`
/// itself.
pub fn relative_key(root: impl AsRef<Path>, path: impl AsRef<Path>) -> Option<String> {
    let relative = path.as_ref().strip_prefix(root.as_ref()).ok()?;
    let key = normalize_separators(relative);
    if key.is_empty() {
        return None;
    }

    Some(key)
}

/// Join path components with `/` no matter what the host separator is.
pub fn normalize_separators(path: impl AsRef<Path>) -> String {
    path.as_ref()
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().replace('\\', "/")),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// No way to determine user's configuration directory.
///
/// # See Also
///
/// - [`dirs::config_dir`](https://docs.rs/dirs/latest/dirs/fn.config_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's configuration directory")]
pub struct NoConfigDir;

/// Friendly result alias :3
pub type Result<T, E = NoConfigDir> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test_case("/src/app", "/src/app/lib/main.js", Some("lib/main.js"); "nested file")]
    #[test_case("/src/app", "/src/app/app.js", Some("app.js"); "top level file")]
    #[test_case("/src/app", "/src/app", None; "root itself")]
    #[test_case("/src/app", "/src/other/app.js", None; "outside root")]
    #[test]
    fn relative_key_strips_root(root: &str, path: &str, expect: Option<&str>) {
        pretty_assertions::assert_eq!(relative_key(root, path).as_deref(), expect);
    }

    #[test]
    fn index_path_lives_in_internal_dir() {
        assert_eq!(
            index_path("/src/app"),
            PathBuf::from("/src/app/.devsync/file-index.json")
        );
    }
}
