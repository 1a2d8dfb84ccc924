#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config;
use crate::error::CtrlLordError;
use crate::playbook::model::{Param, Playbook, Step};

#[derive(Debug, Deserialize)]
struct RawPlaybook {
    name: Option<String>,
    #[serde(default)]
    description: String,
    cwd: Option<String>,
    steps: Option<Vec<RawStep>>,
    params: Option<serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    name: Option<String>,
    run: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawParam {
    name: Option<String>,
    label: Option<String>,
    default: Option<serde_yaml::Value>,
}

/// Loads every `*.yml`/`*.yaml` playbook in `dir`, sorted by name.
///
/// Invalid files are skipped with a warning so one broken playbook never hides
/// the rest. A missing directory yields an empty list.
pub fn load_playbooks(dir: &Path) -> anyhow::Result<Vec<Playbook>> {
    if !dir.is_dir() {
        debug!(dir = %dir.display(), "playbook dir does not exist");
        return Ok(Vec::new());
    }
    let dir = std::path::absolute(dir)
        .with_context(|| format!("failed to resolve {}", dir.display()))?;

    let mut files: Vec<PathBuf> = Vec::new();
    for entry in
        std::fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))?
    {
        let path = entry?.path();
        if matches!(
            path.extension().and_then(|s| s.to_str()),
            Some("yml" | "yaml")
        ) {
            files.push(path);
        }
    }
    files.sort();

    let mut playbooks = Vec::new();
    for path in files {
        match load_playbook(&dir, &path) {
            Ok(pb) => playbooks.push(pb),
            Err(e) => warn!(file = %path.display(), "skipping playbook: {e:#}"),
        }
    }
    playbooks.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(playbooks)
}

fn load_playbook(dir: &Path, path: &Path) -> anyhow::Result<Playbook> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value: serde_yaml::Value = serde_yaml::from_str(&raw).context("invalid YAML")?;
    if !value.is_mapping() {
        anyhow::bail!("not a YAML mapping");
    }
    let parsed: RawPlaybook = serde_yaml::from_value(value).context("invalid playbook fields")?;

    let name = parsed.name.context("missing 'name'")?;
    let raw_steps = parsed.steps.unwrap_or_default();
    if raw_steps.is_empty() {
        anyhow::bail!("missing or empty 'steps'");
    }
    let mut steps = Vec::with_capacity(raw_steps.len());
    for (i, step) in raw_steps.into_iter().enumerate() {
        let (Some(name), Some(run)) = (step.name, step.run) else {
            anyhow::bail!("step {i} missing 'name' or 'run'");
        };
        steps.push(Step { name, run });
    }

    // Only a list declares params; any other value is ignored.
    let raw_params: Vec<RawParam> = match parsed.params {
        Some(v @ serde_yaml::Value::Sequence(_)) => {
            serde_yaml::from_value(v).context("invalid 'params' entry")?
        }
        Some(serde_yaml::Value::Null) | None => Vec::new(),
        Some(_) => {
            debug!(file = %path.display(), "ignoring non-list 'params'");
            Vec::new()
        }
    };
    let mut params = Vec::with_capacity(raw_params.len());
    for p in raw_params {
        let name = p.name.context("param missing 'name'")?;
        params.push(Param {
            label: p.label.unwrap_or_else(|| name.clone()),
            default: p.default.as_ref().map(scalar_to_string).unwrap_or_default(),
            name,
        });
    }

    let cwd = match parsed.cwd {
        Some(c) => {
            let p = PathBuf::from(config::expand_tilde(&c));
            if p.is_absolute() { p } else { dir.join(p) }
        }
        None => dir.to_path_buf(),
    };

    Ok(Playbook {
        name,
        description: parsed.description,
        cwd: std::path::absolute(&cwd).unwrap_or(cwd),
        steps,
        params,
        file_path: std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf()),
    })
}

fn scalar_to_string(v: &serde_yaml::Value) -> String {
    match v {
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_owned())
            .unwrap_or_default(),
    }
}

/// Exact name match first, then a unique case-insensitive substring match.
pub fn find_playbook<'a>(
    playbooks: &'a [Playbook],
    pattern: &str,
) -> Result<&'a Playbook, CtrlLordError> {
    if let Some(pb) = playbooks.iter().find(|p| p.name == pattern) {
        return Ok(pb);
    }
    let needle = pattern.to_lowercase();
    let matches: Vec<&Playbook> = playbooks
        .iter()
        .filter(|p| p.name.to_lowercase().contains(&needle))
        .collect();
    match matches.as_slice() {
        [one] => Ok(one),
        [] => Err(CtrlLordError::PlaybookNotFound(pattern.to_owned())),
        _ => Err(CtrlLordError::AmbiguousPlaybook(pattern.to_owned())),
    }
}
