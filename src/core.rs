use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::{self, Command, CommandGroup, GroupConfig};
use crate::error::Result;
use crate::select;
use crate::watch::CommandStream;

/// The engine facade: a resolved command tree plus the working directory
/// that selections and watches are made against.
pub struct Fnug {
    config: CommandGroup,
    cwd: PathBuf,
}

impl Fnug {
    /// Build from a programmatically constructed tree, resolving inheritance
    /// against `cwd`.
    pub fn from_group(group: GroupConfig, cwd: impl Into<PathBuf>) -> Result<Self> {
        let cwd = cwd.into();
        let config = group.resolve(&cwd)?;
        debug!(commands = config.all_commands().len(), cwd = %cwd.display(), "engine ready");
        Ok(Self { config, cwd })
    }

    /// Load a config file — the given one, or the nearest `.fnug.yaml`/
    /// `.fnug.yml`/`.fnug.json` at or above the process cwd — and resolve
    /// it anchored at the file's directory.
    pub fn from_config_file(path: Option<&Path>) -> Result<Self> {
        let (group, dir) = config::load_config_file(path)?;
        Self::from_group(group, dir)
    }

    /// The resolved tree.
    pub fn config(&self) -> &CommandGroup {
        &self.config
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Every command in document order.
    pub fn all_commands(&self) -> Vec<&Command> {
        self.config.all_commands()
    }

    /// Commands that should run right now: the always set followed by the
    /// git selection, deduplicated.
    pub fn selected_commands(&self) -> Vec<Command> {
        select::select_initial(&self.config, &self.cwd)
    }

    /// Long-lived stream of commands to (re-)run as the file system changes.
    pub fn watch(&self) -> Result<CommandStream> {
        CommandStream::new(self.config.clone(), self.cwd.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::process::Command as Process;

    fn git(dir: &Path, args: &[&str]) {
        let status = Process::new("git").args(args).current_dir(dir).status().unwrap();
        assert!(status.success());
    }

    #[test]
    fn from_group_resolves_a_minimal_tree() {
        let group: GroupConfig =
            serde_yaml::from_str("{ name: r, commands: [ { name: a, cmd: \"true\" } ] }").unwrap();
        let fnug = Fnug::from_group(group, "/tmp/x").unwrap();

        let commands = fnug.all_commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].name, "a");
        assert_eq!(commands[0].cwd, PathBuf::from("/tmp/x"));
        assert_eq!(fnug.cwd(), Path::new("/tmp/x"));
    }

    #[test]
    fn from_config_file_anchors_at_the_file_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(".fnug.yaml"),
            "name: r\ncommands:\n  - { name: a, cmd: \"true\", cwd: sub }\n",
        )
        .unwrap();

        let fnug = Fnug::from_config_file(Some(&dir.path().join(".fnug.yaml"))).unwrap();
        assert_eq!(fnug.all_commands()[0].cwd, dir.path().join("sub"));
    }

    #[test]
    fn selected_commands_unions_always_and_git() {
        let dir = tempfile::tempdir().unwrap();
        git(dir.path(), &["init", "-q"]);
        fs::write(dir.path().join("lib.rs"), "untracked").unwrap();

        let group: GroupConfig = serde_yaml::from_str(
            r#"
            name: r
            commands:
              - { name: a, cmd: x, auto: { always: true } }
              - { name: b, cmd: x, auto: { git: true, path: ["."], regex: ["\\.rs$"] } }
              - { name: c, cmd: x }
            "#,
        )
        .unwrap();
        let fnug = Fnug::from_group(group, dir.path()).unwrap();

        let names: Vec<_> = fnug
            .selected_commands()
            .iter()
            .map(|c| c.name.clone())
            .collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[tokio::test]
    async fn watch_streams_the_initial_selection() {
        let dir = tempfile::tempdir().unwrap();
        let group: GroupConfig = serde_yaml::from_str(
            "{ name: r, commands: [ { name: a, cmd: x, auto: { always: true } } ] }",
        )
        .unwrap();
        let fnug = Fnug::from_group(group, dir.path()).unwrap();

        let mut stream = fnug.watch().unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].name, "a");
    }
}
