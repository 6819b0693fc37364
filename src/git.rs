use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::{debug, trace};

use crate::error::Error;

/// Run git with the given arguments from `dir`, returning raw stdout.
fn git(dir: &Path, args: &[&str]) -> Result<Vec<u8>> {
    trace!(args = ?args, dir = %dir.display(), "git:run");
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("Failed to execute git {}", args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(output.stdout)
}

/// Find the repository root at or above `dir`.
pub fn discover_root(dir: &Path) -> crate::error::Result<PathBuf> {
    let unavailable = |err: anyhow::Error| {
        debug!(dir = %dir.display(), error = %err, "repository discovery failed");
        Error::GitUnavailable(dir.to_path_buf())
    };

    let stdout = git(dir, &["rev-parse", "--show-toplevel"]).map_err(unavailable)?;
    let path = String::from_utf8(stdout)
        .context("git rev-parse returned non-UTF-8 output")
        .map_err(unavailable)?
        .trim()
        .to_string();
    if path.is_empty() {
        return Err(unavailable(anyhow::anyhow!(
            "git rev-parse --show-toplevel returned empty output"
        )));
    }
    Ok(PathBuf::from(path))
}

/// Enumerate every path touched by the working-directory diff against HEAD:
/// untracked and added files, modifications, deletions, and both sides of a
/// rename. Paths are relative to the repository root.
pub fn changed_files(repo_root: &Path) -> Result<Vec<String>> {
    // -uall expands untracked directories into individual files; -z gives
    // NUL separation and disables path quoting.
    let stdout = git(repo_root, &["status", "--porcelain", "-z", "-uall"])?;
    let raw = String::from_utf8(stdout).context("git status returned non-UTF-8 output")?;

    let mut paths = Vec::new();
    let mut entries = raw.split('\0').filter(|s| !s.is_empty());
    while let Some(entry) = entries.next() {
        if entry.len() < 4 {
            continue;
        }
        let (status, path) = entry.split_at(3);
        let status = &status[..2];
        if status == "!!" {
            continue;
        }
        paths.push(path.to_string());

        // Renames and copies carry the original path as the next record.
        if status.contains('R') || status.contains('C') {
            if let Some(original) = entries.next() {
                paths.push(original.to_string());
            }
        }
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn run(dir: &Path, args: &[&str]) {
        let status = Command::new(args[0])
            .args(&args[1..])
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "command failed: {args:?}");
    }

    fn init_repo(dir: &Path) {
        run(dir, &["git", "init", "-q"]);
        run(dir, &["git", "config", "user.email", "fnug@example.com"]);
        run(dir, &["git", "config", "user.name", "fnug"]);
    }

    fn commit_all(dir: &Path) {
        run(dir, &["git", "add", "-A"]);
        run(dir, &["git", "commit", "-q", "-m", "snapshot"]);
    }

    #[test]
    fn discover_root_walks_up_from_subdirectories() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());
        let nested = tmp.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();

        let root = discover_root(&nested).unwrap();
        assert_eq!(root.canonicalize().unwrap(), tmp.path().canonicalize().unwrap());
    }

    #[test]
    fn discover_root_fails_outside_a_repository() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            discover_root(tmp.path()),
            Err(Error::GitUnavailable(_))
        ));
    }

    #[test]
    fn changed_files_sees_untracked_and_modified() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());
        fs::write(tmp.path().join("tracked.rs"), "fn main() {}").unwrap();
        commit_all(tmp.path());

        fs::write(tmp.path().join("tracked.rs"), "fn main() { }").unwrap();
        fs::create_dir_all(tmp.path().join("src")).unwrap();
        fs::write(tmp.path().join("src/new.rs"), "").unwrap();

        let changed = changed_files(tmp.path()).unwrap();
        assert!(changed.contains(&"tracked.rs".to_string()), "{changed:?}");
        assert!(changed.contains(&"src/new.rs".to_string()), "{changed:?}");
    }

    #[test]
    fn changed_files_reports_both_sides_of_a_rename() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());
        fs::write(tmp.path().join("old.rs"), "// contents that git can track").unwrap();
        commit_all(tmp.path());

        run(tmp.path(), &["git", "mv", "old.rs", "new.rs"]);

        let changed = changed_files(tmp.path()).unwrap();
        assert!(changed.contains(&"new.rs".to_string()), "{changed:?}");
        assert!(changed.contains(&"old.rs".to_string()), "{changed:?}");
    }

    #[test]
    fn changed_files_is_empty_on_a_clean_tree() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());
        fs::write(tmp.path().join("a.rs"), "x").unwrap();
        commit_all(tmp.path());

        assert!(changed_files(tmp.path()).unwrap().is_empty());
    }
}
