use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use normalize_path::NormalizePath;
use regex::Regex;
use tracing::debug;

use crate::config::{Auto, Command, CommandGroup};
use crate::error::{Error, Result};
use crate::git;

/// Upper bound on cached compiled patterns.
const REGEX_CACHE_CAP: usize = 256;

/// Process-wide LRU of compiled regexes, keyed by pattern text. Shared by
/// load-time validation and every selector invocation.
struct RegexCache {
    entries: HashMap<String, (Arc<Regex>, u64)>,
    tick: u64,
}

impl RegexCache {
    fn get(&mut self, pattern: &str) -> Result<Arc<Regex>> {
        self.tick += 1;
        let tick = self.tick;

        if let Some((regex, stamp)) = self.entries.get_mut(pattern) {
            *stamp = tick;
            return Ok(regex.clone());
        }

        let regex = Arc::new(
            Regex::new(pattern)
                .map_err(|e| Error::ConfigInvalid(format!("bad regex '{pattern}': {e}")))?,
        );

        if self.entries.len() >= REGEX_CACHE_CAP
            && let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, (_, stamp))| *stamp)
                .map(|(pattern, _)| pattern.clone())
        {
            self.entries.remove(&oldest);
        }

        self.entries.insert(pattern.to_string(), (regex.clone(), tick));
        Ok(regex)
    }
}

/// Compile `pattern` through the shared cache.
pub(crate) fn regex_for(pattern: &str) -> Result<Arc<Regex>> {
    static CACHE: OnceLock<Mutex<RegexCache>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| {
        Mutex::new(RegexCache {
            entries: HashMap::new(),
            tick: 0,
        })
    });
    cache.lock().expect("regex cache lock poisoned").get(pattern)
}

/// Does a changed path (relative to the matching base) satisfy the rules?
/// It must lie under one of the roots and match at least one regex; an empty
/// regex list never matches.
fn rule_matches(auto: &Auto, changed: &Path) -> bool {
    let under_root = auto
        .path
        .iter()
        .any(|root| changed.starts_with(Path::new(root).normalize()));
    if !under_root {
        return false;
    }

    let text = changed.to_string_lossy();
    auto.regex.iter().any(|pattern| {
        regex_for(pattern)
            .map(|regex| regex.is_match(&text))
            .unwrap_or(false)
    })
}

/// Commands flagged `auto.always`, in traversal order.
pub fn select_all_always(root: &CommandGroup) -> Vec<Command> {
    root.all_commands()
        .into_iter()
        .filter(|c| c.auto.always)
        .cloned()
        .collect()
}

/// Commands whose git rules intersect the uncommitted changes of the
/// repository at or above `cwd`. No repository, or a failing enumeration,
/// yields an empty selection.
pub fn select_git(root: &CommandGroup, cwd: &Path) -> Vec<Command> {
    let repo = match git::discover_root(cwd) {
        Ok(repo) => repo,
        Err(err) => {
            debug!(cwd = %cwd.display(), error = %err, "git selection skipped: no repository");
            return Vec::new();
        }
    };

    let changed = match git::changed_files(&repo) {
        Ok(changed) => changed,
        Err(err) => {
            debug!(repo = %repo.display(), error = %err, "git selection skipped: status failed");
            return Vec::new();
        }
    };

    let changed: Vec<&Path> = changed.iter().map(Path::new).collect();
    select_changed(root, &changed)
}

/// Match repo-relative changed paths against every git-enabled command.
/// Separated from the subprocess plumbing so the rule logic tests without a
/// repository.
pub(crate) fn select_changed(root: &CommandGroup, changed: &[&Path]) -> Vec<Command> {
    let mut selected = Vec::new();
    for command in root.all_commands() {
        if !command.auto.git || command.auto.path.is_empty() {
            continue;
        }
        if changed.iter().any(|path| rule_matches(&command.auto, path)) {
            selected.push(command.clone());
        }
    }
    selected
}

/// The start-up selection: always-commands followed by the git selection,
/// each command at most once.
pub fn select_initial(root: &CommandGroup, cwd: &Path) -> Vec<Command> {
    let mut selected = select_all_always(root);
    let mut seen: HashSet<String> = selected.iter().map(|c| c.id.clone()).collect();
    for command in select_git(root, cwd) {
        if seen.insert(command.id.clone()) {
            selected.push(command);
        }
    }
    selected
}

/// Commands whose watch rules match a batch of file-system events. Event
/// paths are canonicalized and taken relative to `cwd` before matching.
pub fn select_watch(root: &CommandGroup, cwd: &Path, batch: &HashSet<PathBuf>) -> Vec<Command> {
    let cwd = cwd.canonicalize().unwrap_or_else(|_| cwd.to_path_buf());

    let relative: Vec<PathBuf> = batch
        .iter()
        .filter_map(|path| {
            // Deleted files no longer canonicalize; match on the raw path.
            let path = path.canonicalize().unwrap_or_else(|_| path.clone());
            path.strip_prefix(&cwd).ok().map(Path::to_path_buf)
        })
        .collect();

    let mut selected = Vec::new();
    for command in root.all_commands() {
        if !command.auto.watch {
            continue;
        }
        if relative.iter().any(|path| rule_matches(&command.auto, path)) {
            selected.push(command.clone());
        }
    }
    selected
}
