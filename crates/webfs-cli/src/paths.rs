//! Home-directory expansion for user-supplied paths.

use std::path::{Path, PathBuf};

use directories::BaseDirs;

/// Replaces a leading `~` (alone or followed by `/`) with the home directory.
///
/// Paths are returned unchanged when there is no home directory or no
/// leading tilde. `~user` forms are not expanded.
pub fn expand_home(path: &Path) -> PathBuf {
    match BaseDirs::new() {
        Some(dirs) => expand_with(path, dirs.home_dir()),
        None => path.to_path_buf(),
    }
}

fn expand_with(path: &Path, home: &Path) -> PathBuf {
    let Some(text) = path.to_str() else {
        return path.to_path_buf();
    };
    if text == "~" {
        return home.to_path_buf();
    }
    match text.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => path.to_path_buf(),
    }
}
