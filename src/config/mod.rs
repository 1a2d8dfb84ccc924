#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::CtrlLordError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub task: TaskConfig,
    pub jira: JiraConfig,
    pub llm: LlmConfig,
    pub playbooks: PlaybooksConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskConfig {
    pub backend: String,
    pub data_dir: String,
    pub issue_types: Vec<String>,
    pub components: Vec<String>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            backend: "json".to_owned(),
            data_dir: "~/.config/ctrllord/data".to_owned(),
            issue_types: vec!["Task".to_owned(), "Bug".to_owned(), "Story".to_owned()],
            components: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JiraConfig {
    pub base_url: String,
    pub project_key: String,
    pub mode: ServiceMode,
    pub username: String,
    pub token: String,
    pub timeout_seconds: u64,
}

impl Default for JiraConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            project_key: String::new(),
            mode: ServiceMode::Mock,
            username: String::new(),
            token: String::new(),
            timeout_seconds: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    Mock,
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub mode: ServiceMode,
    pub base_url: String,
    pub endpoint: String,
    pub timeout_seconds: u64,
    pub prompt_path: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            mode: ServiceMode::Mock,
            base_url: "http://localhost:8000".to_owned(),
            endpoint: "/generate-jira".to_owned(),
            timeout_seconds: 10,
            prompt_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybooksConfig {
    pub dir: String,
    pub shell: String,
    pub stop_grace_ms: u64,
    pub param_cache: String,
}

impl Default for PlaybooksConfig {
    fn default() -> Self {
        Self {
            dir: "~/.config/ctrllord/playbooks".to_owned(),
            shell: "bash".to_owned(),
            stop_grace_ms: 3000,
            param_cache: "~/.config/ctrllord/playbook_params.json".to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_file: PathBuf,
}

pub fn default_paths() -> anyhow::Result<ConfigPaths> {
    let unix = home_config_path_unix();
    if !cfg!(windows) {
        return Ok(ConfigPaths { config_file: unix });
    }

    // Windows: prefer the Unix-style path if present for portability.
    if unix.exists() {
        return Ok(ConfigPaths { config_file: unix });
    }

    let proj = ProjectDirs::from("com", "ctrllord", "ctrllord")
        .context("failed to determine platform config directory")?;
    Ok(ConfigPaths {
        config_file: proj.config_dir().join("config.toml"),
    })
}

fn home_config_path_unix() -> PathBuf {
    let home = home_dir().unwrap_or_else(|| PathBuf::from("~"));
    home.join(".config").join("ctrllord").join("config.toml")
}

fn home_dir() -> Option<PathBuf> {
    if let Some(v) = std::env::var_os("HOME") {
        return Some(PathBuf::from(v));
    }
    if let Some(v) = std::env::var_os("USERPROFILE") {
        return Some(PathBuf::from(v));
    }
    let drive = std::env::var_os("HOMEDRIVE");
    let path = std::env::var_os("HOMEPATH");
    match (drive, path) {
        (Some(d), Some(p)) => Some(PathBuf::from(d).join(PathBuf::from(p))),
        _ => None,
    }
}

#[must_use]
pub fn expand_tilde(input: &str) -> String {
    if input == "~"
        && let Some(home) = home_dir()
    {
        return home.to_string_lossy().to_string();
    }
    if let Some(rest) = input.strip_prefix("~/")
        && let Some(home) = home_dir()
    {
        return home.join(rest).to_string_lossy().to_string();
    }
    input.to_owned()
}

pub fn expand_path(input: &str) -> anyhow::Result<PathBuf> {
    let expanded = expand_env_vars(&expand_tilde(input));
    let p = PathBuf::from(expanded);
    if p.is_absolute() {
        return Ok(p);
    }
    let cwd = std::env::current_dir().context("failed to get current directory")?;
    Ok(cwd.join(p))
}

fn expand_env_vars(input: &str) -> String {
    // Expand $VAR and ${VAR}. Leave unknown vars untouched.
    let Ok(re) = regex::Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?") else {
        return input.to_owned();
    };
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        std::env::var(key).unwrap_or_else(|_| caps[0].to_owned())
    })
    .to_string()
}

pub fn load() -> anyhow::Result<(Config, toml_edit::DocumentMut, ConfigPaths)> {
    let paths = default_paths()?;
    let (doc, cfg) = load_from_file(&paths.config_file)?;
    cfg.validate()?;
    Ok((cfg, doc, paths))
}

/// Loads and validates a config file, falling back to defaults when it is missing.
pub fn load_path(path: &Path) -> anyhow::Result<Config> {
    let (_doc, cfg) = load_from_file(path)?;
    cfg.validate()?;
    Ok(cfg)
}

/// The effective config at `path` (defaults filled in) as TOML.
pub fn list_resolved_toml_at_path(path: &Path) -> anyhow::Result<String> {
    let cfg = load_path(path)?;
    Ok(toml::to_string_pretty(&cfg)?)
}

fn load_from_file(path: &Path) -> anyhow::Result<(toml_edit::DocumentMut, Config)> {
    if !path.exists() {
        return Ok((toml_edit::DocumentMut::new(), Config::default()));
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let doc = raw
        .parse::<toml_edit::DocumentMut>()
        .with_context(|| format!("failed to parse TOML in {}", path.display()))?;

    let cfg: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to deserialize TOML in {}", path.display()))?;
    Ok((doc, cfg))
}

pub fn get_value_string_at_path(path: &Path, key: &str) -> anyhow::Result<Option<String>> {
    let (_doc, cfg) = load_from_file(path)?;
    cfg.validate()?;

    let value = lookup_value(&cfg, key);
    Ok(value.map(format_value_for_stdout))
}

pub fn set_value_string_at_path(path: &Path, key: &str, value: &str) -> anyhow::Result<()> {
    let (mut doc, cfg) = load_from_file(path)?;
    cfg.validate()?;

    let value_item = parse_value_for_key(key, value)?;
    apply_set(&mut doc, key, value_item)?;

    // Validate by re-parsing the updated doc into a Config.
    let new_raw = doc.to_string();
    let new_cfg: Config = toml::from_str(&new_raw)
        .with_context(|| format!("config update produced invalid TOML for {}", path.display()))?;
    new_cfg.validate()?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, new_raw.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;

    Ok(())
}

impl Config {
    pub fn validate(&self) -> Result<(), CtrlLordError> {
        let backend = self.task.backend.trim().to_lowercase();
        if !matches!(backend.as_str(), "json" | "jira") {
            return Err(CtrlLordError::UnknownBackend(self.task.backend.clone()));
        }
        if self.task.issue_types.iter().all(|t| t.trim().is_empty()) {
            return Err(CtrlLordError::Config(
                "task.issue_types must contain at least one type".to_owned(),
            ));
        }
        if backend == "jira" && self.jira.mode == ServiceMode::Live {
            if self.jira.base_url.trim().is_empty() {
                return Err(CtrlLordError::Config(
                    "jira.base_url is required in live mode".to_owned(),
                ));
            }
            if self.jira.project_key.trim().is_empty() {
                return Err(CtrlLordError::Config(
                    "jira.project_key is required in live mode".to_owned(),
                ));
            }
        }
        if self.jira.timeout_seconds == 0 {
            return Err(CtrlLordError::Config(
                "jira.timeout_seconds must be >= 1".to_owned(),
            ));
        }
        if self.llm.timeout_seconds == 0 {
            return Err(CtrlLordError::Config(
                "llm.timeout_seconds must be >= 1".to_owned(),
            ));
        }
        if self.playbooks.shell.trim().is_empty() {
            return Err(CtrlLordError::Config(
                "playbooks.shell must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyType {
    Int,
    String,
    StringList,
    Enum(&'static [&'static str]),
}

fn key_type(key: &str) -> Option<KeyType> {
    Some(match key {
        "task.data_dir"
        | "jira.base_url"
        | "jira.project_key"
        | "jira.username"
        | "jira.token"
        | "llm.base_url"
        | "llm.endpoint"
        | "llm.prompt_path"
        | "playbooks.dir"
        | "playbooks.shell"
        | "playbooks.param_cache" => KeyType::String,

        "task.issue_types" | "task.components" => KeyType::StringList,

        "jira.timeout_seconds" | "llm.timeout_seconds" | "playbooks.stop_grace_ms" => {
            KeyType::Int
        }

        "task.backend" => KeyType::Enum(&["json", "jira"]),
        "jira.mode" | "llm.mode" => KeyType::Enum(&["mock", "live"]),

        _ => return None,
    })
}

fn parse_value_for_key(key: &str, value: &str) -> anyhow::Result<toml_edit::Item> {
    let key_type = key_type(key).ok_or_else(|| CtrlLordError::InvalidConfigKey(key.to_owned()))?;
    let item = match key_type {
        KeyType::Int => toml_edit::value(parse_int(value).map_err(|msg| {
            CtrlLordError::InvalidConfigValue {
                key: key.to_owned(),
                msg,
            }
        })?),
        KeyType::String => toml_edit::value(value),
        KeyType::StringList => {
            // Comma separated: "Task, Bug" -> ["Task", "Bug"]
            let mut arr = toml_edit::Array::new();
            for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                arr.push(part);
            }
            toml_edit::value(arr)
        }
        KeyType::Enum(allowed) => {
            let v = value.trim();
            if !allowed.contains(&v) {
                return Err(CtrlLordError::InvalidConfigValue {
                    key: key.to_owned(),
                    msg: format!("must be one of: {}", allowed.join(", ")),
                }
                .into());
            }
            toml_edit::value(v)
        }
    };
    Ok(item)
}

fn parse_int(s: &str) -> Result<i64, String> {
    let n = s
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("expected integer, got '{s}': {e}"))?;
    if n < 0 {
        return Err(format!("expected a non-negative integer, got {n}"));
    }
    Ok(n)
}

fn apply_set(
    doc: &mut toml_edit::DocumentMut,
    key: &str,
    value: toml_edit::Item,
) -> anyhow::Result<()> {
    let parts: Vec<&str> = key.split('.').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        return Err(CtrlLordError::InvalidConfigKey(key.to_owned()).into());
    }

    let mut cur = doc.as_table_mut();
    for seg in &parts[..parts.len().saturating_sub(1)] {
        if !cur.contains_key(seg) {
            cur.insert(seg, toml_edit::Item::Table(toml_edit::Table::new()));
        }
        cur = cur[seg].as_table_mut().ok_or_else(|| {
            CtrlLordError::Config(format!("cannot set {key}: '{seg}' is not a table"))
        })?;
    }

    let leaf = parts[parts.len() - 1];
    cur.insert(leaf, value);
    Ok(())
}

fn lookup_value(cfg: &Config, key: &str) -> Option<serde_json::Value> {
    let mut v = serde_json::to_value(cfg).ok()?;
    for seg in key.split('.').filter(|s| !s.is_empty()) {
        match v {
            serde_json::Value::Object(mut map) => {
                v = map.remove(seg)?;
            }
            _ => return None,
        }
    }
    Some(v)
}

fn format_value_for_stdout(v: serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => "null".to_owned(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s,
        other => serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn validation_rejects_unknown_backend() {
        let mut cfg = Config::default();
        cfg.task.backend = "trello".to_owned();
        assert!(matches!(
            cfg.validate(),
            Err(CtrlLordError::UnknownBackend(_))
        ));
    }

    #[test]
    fn live_jira_requires_url_and_project() {
        let mut cfg = Config::default();
        cfg.task.backend = "jira".to_owned();
        cfg.jira.mode = ServiceMode::Live;
        assert!(cfg.validate().is_err());

        cfg.jira.base_url = "https://jira.example.com".to_owned();
        cfg.jira.project_key = "OPS".to_owned();
        cfg.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_sections() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[playbooks]\nshell = \"sh\"\n").unwrap();

        let cfg = load_path(&path).unwrap();
        assert_eq!(cfg.playbooks.shell, "sh");
        assert_eq!(cfg.playbooks.stop_grace_ms, 3000);
        assert_eq!(cfg.task.backend, "json");
        assert_eq!(cfg.llm.mode, ServiceMode::Mock);
    }

    #[test]
    fn config_set_and_get_dot_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        set_value_string_at_path(&path, "playbooks.shell", "zsh").unwrap();
        assert_eq!(
            get_value_string_at_path(&path, "playbooks.shell")
                .unwrap()
                .as_deref(),
            Some("zsh")
        );

        set_value_string_at_path(&path, "jira.mode", "live").unwrap();
        set_value_string_at_path(&path, "task.issue_types", "Task, Incident").unwrap();
        set_value_string_at_path(&path, "playbooks.stop_grace_ms", "500").unwrap();

        let cfg = load_path(&path).unwrap();
        assert_eq!(cfg.jira.mode, ServiceMode::Live);
        assert_eq!(cfg.task.issue_types, vec!["Task", "Incident"]);
        assert_eq!(cfg.playbooks.stop_grace_ms, 500);
    }

    #[test]
    fn config_set_rejects_bad_keys_and_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        assert!(set_value_string_at_path(&path, "task.nope", "x").is_err());
        assert!(set_value_string_at_path(&path, "task.backend", "trello").is_err());
        assert!(set_value_string_at_path(&path, "llm.timeout_seconds", "-3").is_err());
        // Passes key checks but fails whole-config validation.
        assert!(set_value_string_at_path(&path, "llm.timeout_seconds", "0").is_err());
        assert!(!path.exists());
    }

    #[test]
    fn expand_path_resolves_relative_against_cwd() {
        let p = expand_path("some/dir").unwrap();
        assert!(p.is_absolute());
        assert!(p.ends_with("some/dir"));
    }
}
