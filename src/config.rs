use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use normalize_path::NormalizePath;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::select;

/// Config file names probed at each directory level, in priority order.
const CONFIG_FILE_NAMES: &[&str] = &[".fnug.yaml", ".fnug.yml", ".fnug.json"];

/// Config format version this engine understands.
const SUPPORTED_VERSION: &str = "0.1.0";

/// Auto-selection rules as they appear in the config file.
///
/// The three flags are tri-state: absent means "inherit from the parent
/// group", which is why they parse as `Option<bool>` and only collapse to
/// concrete booleans during resolution.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct AutoConfig {
    /// Re-run on file-system events under `path`
    #[serde(default)]
    pub watch: Option<bool>,

    /// Select when uncommitted git changes touch `path`
    #[serde(default)]
    pub git: Option<bool>,

    /// Select unconditionally
    #[serde(default)]
    pub always: Option<bool>,

    /// Relative directory roots to observe
    #[serde(default)]
    pub path: Vec<String>,

    /// Patterns a changed path must match (any one suffices)
    #[serde(default)]
    pub regex: Vec<String>,
}

/// A single runnable command as declared in the config file.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CommandConfig {
    pub name: String,

    /// Shell command line, run as `sh -c <cmd>`
    pub cmd: String,

    #[serde(default)]
    pub id: Option<String>,

    /// Working directory, relative to the parent group's
    #[serde(default)]
    pub cwd: Option<String>,

    /// Whether the PTY should accept keystrokes from the UI
    #[serde(default)]
    pub interactive: bool,

    #[serde(default)]
    pub auto: AutoConfig,
}

/// A group node as declared in the config file; the document root is one.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GroupConfig {
    /// Reserved for future compat checks; currently "0.1.0"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fnug_version: Option<String>,

    pub name: String,

    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub cwd: Option<String>,

    #[serde(default)]
    pub auto: AutoConfig,

    #[serde(default)]
    pub commands: Vec<CommandConfig>,

    #[serde(default)]
    pub children: Vec<GroupConfig>,
}

/// Fully resolved auto rules: flags collapsed, paths and regexes unioned
/// with every ancestor's.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Auto {
    pub watch: bool,
    pub git: bool,
    pub always: bool,
    pub path: Vec<String>,
    pub regex: Vec<String>,
}

/// A resolved command. Immutable once resolution has run.
#[derive(Debug, Clone, Serialize)]
pub struct Command {
    pub id: String,
    pub name: String,
    pub cmd: String,
    /// Absolute working directory after inheritance
    pub cwd: PathBuf,
    pub interactive: bool,
    pub auto: Auto,
}

/// A resolved group node. Immutable once resolution has run.
#[derive(Debug, Clone, Serialize)]
pub struct CommandGroup {
    pub id: String,
    pub name: String,
    pub cwd: PathBuf,
    pub auto: Auto,
    pub commands: Vec<Command>,
    pub children: Vec<CommandGroup>,
}

impl GroupConfig {
    /// Resolve inheritance for the whole tree, anchoring the root's cwd at
    /// `base`. Validates the result (unique ids, non-empty names, compilable
    /// regexes).
    pub fn resolve(self, base: &Path) -> Result<CommandGroup> {
        if let Some(version) = &self.fnug_version
            && version != SUPPORTED_VERSION
        {
            warn!(version, supported = SUPPORTED_VERSION, "unrecognized fnug_version");
        }

        let root = resolve_group(self, base, &Auto::default());
        validate(&root)?;
        Ok(root)
    }
}

impl CommandGroup {
    /// Every command in the tree exactly once, in document order.
    pub fn all_commands(&self) -> Vec<&Command> {
        let mut out = Vec::new();
        self.collect_commands(&mut out);
        out
    }

    fn collect_commands<'a>(&'a self, out: &mut Vec<&'a Command>) {
        out.extend(self.commands.iter());
        for child in &self.children {
            child.collect_commands(out);
        }
    }

    /// Look up a command by its stable id.
    pub fn find_command(&self, id: &str) -> Option<&Command> {
        self.all_commands().into_iter().find(|c| c.id == id)
    }

    /// Serialize the resolved tree back to YAML, field order preserved.
    pub fn as_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::ConfigInvalid(format!("cannot serialize config: {e}")))
    }
}

fn resolve_group(declared: GroupConfig, parent_cwd: &Path, parent_auto: &Auto) -> CommandGroup {
    let cwd = join_cwd(parent_cwd, declared.cwd.as_deref());
    let auto = resolve_auto(declared.auto, parent_auto);

    let commands = declared
        .commands
        .into_iter()
        .map(|c| resolve_command(c, &cwd, &auto))
        .collect();

    let children = declared
        .children
        .into_iter()
        .map(|g| resolve_group(g, &cwd, &auto))
        .collect();

    CommandGroup {
        id: declared.id.unwrap_or_else(generate_id),
        name: declared.name,
        cwd,
        auto,
        commands,
        children,
    }
}

fn resolve_command(declared: CommandConfig, parent_cwd: &Path, parent_auto: &Auto) -> Command {
    Command {
        id: declared.id.unwrap_or_else(generate_id),
        name: declared.name,
        cmd: declared.cmd,
        cwd: join_cwd(parent_cwd, declared.cwd.as_deref()),
        interactive: declared.interactive,
        auto: resolve_auto(declared.auto, parent_auto),
    }
}

/// Collapse a declared `AutoConfig` against the parent's resolved rules:
/// flags fall back to the parent's value, paths and regexes are the union
/// (own entries first, inherited after, duplicates dropped).
fn resolve_auto(declared: AutoConfig, parent: &Auto) -> Auto {
    let mut path = declared.path;
    for inherited in &parent.path {
        if !path.contains(inherited) {
            path.push(inherited.clone());
        }
    }

    let mut regex = declared.regex;
    for inherited in &parent.regex {
        if !regex.contains(inherited) {
            regex.push(inherited.clone());
        }
    }

    Auto {
        watch: declared.watch.unwrap_or(parent.watch),
        git: declared.git.unwrap_or(parent.git),
        always: declared.always.unwrap_or(parent.always),
        path,
        regex,
    }
}

fn join_cwd(parent: &Path, declared: Option<&str>) -> PathBuf {
    match declared {
        Some(cwd) => parent.join(cwd).normalize(),
        None => parent.to_path_buf(),
    }
}

/// Generate an id for a node that declared none: 128 random bits as hex.
fn generate_id() -> String {
    let mut bytes = [0u8; 16];
    getrandom::fill(&mut bytes).expect("failed to get random bytes");
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn validate(root: &CommandGroup) -> Result<()> {
    let mut ids = HashSet::new();
    validate_group(root, &mut ids)
}

fn validate_group<'a>(group: &'a CommandGroup, ids: &mut HashSet<&'a str>) -> Result<()> {
    if group.name.trim().is_empty() {
        return Err(Error::ConfigInvalid("group with empty name".into()));
    }
    if !ids.insert(&group.id) {
        return Err(Error::ConfigInvalid(format!("duplicate id '{}'", group.id)));
    }
    validate_patterns(&group.auto)?;

    for command in &group.commands {
        if command.name.trim().is_empty() {
            return Err(Error::ConfigInvalid("command with empty name".into()));
        }
        if !ids.insert(&command.id) {
            return Err(Error::ConfigInvalid(format!("duplicate id '{}'", command.id)));
        }
        validate_patterns(&command.auto)?;
    }

    for child in &group.children {
        validate_group(child, ids)?;
    }
    Ok(())
}

/// Compile every pattern through the shared cache so a bad regex fails the
/// load instead of the first selection.
fn validate_patterns(auto: &Auto) -> Result<()> {
    for pattern in &auto.regex {
        select::regex_for(pattern)?;
    }
    Ok(())
}

/// Locate and parse a config file.
///
/// With an explicit path the file is used as-is; otherwise the search walks
/// up from the process cwd probing for `.fnug.yaml`, `.fnug.yml` and
/// `.fnug.json` at each level. Returns the parsed document and the directory
/// containing it (the anchor for cwd resolution).
pub fn load_config_file(path: Option<&Path>) -> Result<(GroupConfig, PathBuf)> {
    let path = match path {
        Some(p) if p.is_file() => p.to_path_buf(),
        Some(p) => {
            return Err(Error::ConfigNotFound {
                path: Some(p.to_path_buf()),
            });
        }
        None => {
            let start = env::current_dir().map_err(|_| Error::ConfigNotFound { path: None })?;
            discover_config(&start)?
        }
    };
    debug!(path = %path.display(), "loading config");

    let contents = fs::read_to_string(&path).map_err(|e| Error::ConfigParse {
        path: path.clone(),
        message: format!("unable to read file: {e}"),
    })?;

    let is_json = path.extension().is_some_and(|ext| ext == "json");
    let parsed: GroupConfig = if is_json {
        serde_json::from_str(&contents).map_err(|e| Error::ConfigParse {
            path: path.clone(),
            message: e.to_string(),
        })?
    } else {
        serde_yaml::from_str(&contents).map_err(|e| Error::ConfigParse {
            path: path.clone(),
            message: e.to_string(),
        })?
    };

    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok((parsed, dir))
}

fn discover_config(start: &Path) -> Result<PathBuf> {
    let mut dir = Some(start);
    while let Some(d) = dir {
        for name in CONFIG_FILE_NAMES {
            let candidate = d.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        dir = d.parent();
    }
    Err(Error::ConfigNotFound { path: None })
}
