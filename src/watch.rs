use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use normalize_path::NormalizePath;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{Command, CommandGroup};
use crate::error::{Error, Result};
use crate::select;

/// Window over which raw file-system events collapse into one batch.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Capacity of the bridge channel between the debounce thread and the
/// async consumer.
const BATCH_CHANNEL_CAPACITY: usize = 16;

/// Recursive file-system watcher that yields debounced batches of distinct
/// changed paths.
///
/// The debouncer collapses raw events into at most one delivery per window
/// on its own thread; its callback pushes batches into a bounded channel for
/// the async consumer. Dropping this handle drops the debouncer, which stops
/// the OS watcher.
pub struct WatchDebouncer {
    batches: mpsc::Receiver<HashSet<PathBuf>>,
    /// Keep alive: dropping the debouncer stops watching.
    _debouncer: Debouncer<RecommendedWatcher>,
}

impl WatchDebouncer {
    /// Watch `roots` recursively. Roots that cannot be watched are reported
    /// once and skipped; they never fail construction.
    pub fn new(roots: &[PathBuf]) -> Result<Self> {
        let (batch_tx, batch_rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);

        let mut debouncer = new_debouncer(DEBOUNCE_WINDOW, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let batch: HashSet<PathBuf> = events
                        .into_iter()
                        .map(|event| event.path)
                        .filter(|path| !is_ignored(path))
                        .collect();
                    if !batch.is_empty() {
                        // A closed channel means the consumer is gone; the
                        // debouncer goes away with it.
                        let _ = batch_tx.blocking_send(batch);
                    }
                }
                Err(err) => debug!(error = ?err, "watch event error"),
            }
        })
        .map_err(|e| Error::WatchInit {
            path: PathBuf::from("."),
            source: e,
        })?;

        for root in roots {
            if let Err(e) = debouncer.watcher().watch(root, RecursiveMode::Recursive) {
                let err = Error::WatchInit {
                    path: root.clone(),
                    source: e,
                };
                warn!(root = %root.display(), "{err}");
            }
        }

        Ok(Self {
            batches: batch_rx,
            _debouncer: debouncer,
        })
    }

    /// Await the next batch. `None` once the debouncer has shut down.
    pub async fn next(&mut self) -> Option<HashSet<PathBuf>> {
        self.batches.recv().await
    }
}

/// Suppress VCS bookkeeping and editor swap/backup churn.
fn is_ignored(path: &Path) -> bool {
    for component in path.components() {
        let Component::Normal(name) = component else {
            continue;
        };
        let name = name.to_string_lossy();
        if name == ".git" || name == ".hg" || name == ".svn" {
            return true;
        }
        if name.ends_with(".swp") || name.ends_with(".swo") || name.ends_with(".swx") {
            return true;
        }
        if name.ends_with('~') || name.starts_with(".#") || name == "4913" {
            return true;
        }
    }
    false
}

/// Union of watch roots over every watch-enabled command, absolute against
/// `cwd`, with roots nested under another root dropped.
pub(crate) fn watch_roots(tree: &CommandGroup, cwd: &Path) -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = Vec::new();
    for command in tree.all_commands() {
        if !command.auto.watch {
            continue;
        }
        for path in &command.auto.path {
            include_root(cwd.join(path).normalize(), &mut roots);
        }
    }
    roots
}

fn include_root(path: PathBuf, roots: &mut Vec<PathBuf>) {
    if roots.iter().any(|covering| path.starts_with(covering)) {
        return;
    }
    roots.retain(|covered| !covered.starts_with(&path));
    roots.push(path);
}

/// Lazy, infinite producer of command selections.
///
/// The first pull yields the always and git selections; every later pull
/// suspends until the debouncer produces a batch that matches at least one
/// watched command. Single consumer; dropping it tears the watcher down.
pub struct CommandStream {
    tree: CommandGroup,
    cwd: PathBuf,
    debouncer: WatchDebouncer,
    primed: bool,
}

impl CommandStream {
    pub(crate) fn new(tree: CommandGroup, cwd: PathBuf) -> Result<Self> {
        let roots = watch_roots(&tree, &cwd);
        debug!(roots = ?roots, "starting watch stream");
        let debouncer = WatchDebouncer::new(&roots)?;
        Ok(Self {
            tree,
            cwd,
            debouncer,
            primed: false,
        })
    }

    /// Pull the next selection of commands to run.
    pub async fn next(&mut self) -> Option<Vec<Command>> {
        if !self.primed {
            self.primed = true;
            return Some(select::select_initial(&self.tree, &self.cwd));
        }

        loop {
            let batch = self.debouncer.next().await?;
            let selected = select::select_watch(&self.tree, &self.cwd, &batch);
            if !selected.is_empty() {
                return Some(selected);
            }
        }
    }
}
