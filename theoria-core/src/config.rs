//! Configuration loaded from YAML.
//!
//! Files are layered: the global file (`$XDG_CONFIG_HOME/theoria/config.yaml`,
//! falling back to `~/.config/theoria/config.yaml`) first, then the nearest
//! `config.theoria.yaml` or `.theoria.yaml` found walking up from the working
//! directory. Mappings are merged key by key, so a project file only needs
//! the keys it changes. `THEORIA_PROVIDER`, `THEORIA_MODEL` and
//! `THEORIA_TEMPERATURE` override both files.
//!
//! ```yaml
//! agent:
//!   provider: openrouter
//!   model: anthropic/claude-3.5-sonnet
//!   temperature: 0.5
//! providers:
//!   openrouter:
//!     timeout: 60
//! dialogue:
//!   objection_threshold: 4
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

use crate::agents::{CompletionSettings, DialecticAgent, EditAgent, LiteratureAgent};
use crate::error::{Error, Result};
use crate::latex::AnalysisOptions;
use crate::llm::{ClientConfig, Provider, RetryPolicy};

/// Project file names, in lookup order within one directory.
pub const PROJECT_FILE_NAMES: [&str; 2] = ["config.theoria.yaml", ".theoria.yaml"];

/// File written by [`init_project_config`].
pub const PROJECT_FILE_NAME: &str = PROJECT_FILE_NAMES[0];

/// Model selection shared by all agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub provider: Provider,
    /// Falls back to the provider's default model
    pub model: Option<String>,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            provider: Provider::OpenAI,
            model: None,
            temperature: 0.7,
            max_tokens: None,
        }
    }
}

/// Per-provider connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    #[serde(alias = "api_base")]
    pub base_url: Option<String>,
    #[serde(alias = "timeout")]
    pub timeout_secs: u64,
    /// Environment variable holding the API key, overriding the provider's
    /// usual variable
    pub api_key_env: Option<String>,
    pub default_model: Option<String>,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: 120,
            api_key_env: None,
            default_model: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueSection {
    pub objection_threshold: usize,
}

impl Default for DialogueSection {
    fn default() -> Self {
        Self {
            objection_threshold: crate::agents::DEFAULT_OBJECTION_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Step ceiling for agents that run to rest within a turn
    pub max_steps_per_turn: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_steps_per_turn: 8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// SQLite file; in-memory when unset
    pub database_path: Option<PathBuf>,
}

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TheoriaConfig {
    pub agent: AgentSection,
    pub providers: BTreeMap<String, ProviderSection>,
    pub dialogue: DialogueSection,
    pub analysis: AnalysisOptions,
    pub engine: EngineSection,
    pub retry: RetryPolicy,
    pub storage: StorageSection,
}

impl TheoriaConfig {
    /// Parse a single YAML document.
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)
            .map_err(|e| Error::Config(format!("invalid YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::Config(format!("serialize config: {e}")))
    }

    /// YAML holding only the values that differ from the defaults.
    pub fn to_minimal_yaml_string(&self) -> Result<String> {
        let current = to_mapping(self)?;
        let defaults = to_mapping(&Self::default())?;
        serde_yaml::to_string(&strip_defaults(current, &defaults))
            .map_err(|e| Error::Config(format!("serialize config: {e}")))
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.agent.provider = provider;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.agent.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.agent.temperature = temperature;
        self
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage.database_path = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.agent.temperature) {
            return Err(Error::Config(format!(
                "agent.temperature must be within 0.0..=2.0, got {}",
                self.agent.temperature
            )));
        }
        if self.agent.max_tokens == Some(0) {
            return Err(Error::Config("agent.max_tokens must be > 0".into()));
        }
        if self.dialogue.objection_threshold == 0 {
            return Err(Error::Config("dialogue.objection_threshold must be > 0".into()));
        }
        if self.engine.max_steps_per_turn == 0 {
            return Err(Error::Config("engine.max_steps_per_turn must be > 0".into()));
        }
        if self.analysis.max_nesting_depth == 0 {
            return Err(Error::Config("analysis.max_nesting_depth must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be > 0".into()));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(Error::Config("retry.multiplier must be >= 1.0".into()));
        }
        for (name, section) in &self.providers {
            name.parse::<Provider>()?;
            if section.timeout_secs == 0 {
                return Err(Error::Config(format!(
                    "providers.{name}.timeout_secs must be > 0"
                )));
            }
        }
        Ok(())
    }

    /// Apply `THEORIA_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(provider) = lookup("THEORIA_PROVIDER") {
            self.agent.provider = provider.parse()?;
        }
        if let Some(model) = lookup("THEORIA_MODEL") {
            self.agent.model = Some(model);
        }
        if let Some(temperature) = lookup("THEORIA_TEMPERATURE") {
            self.agent.temperature = temperature.trim().parse().map_err(|_| {
                Error::Config(format!("THEORIA_TEMPERATURE is not a number: {temperature}"))
            })?;
        }
        Ok(())
    }

    /// Settings of the active provider; defaults when it has no section.
    pub fn provider_section(&self) -> ProviderSection {
        self.providers
            .get(self.agent.provider.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// Client configuration for the active provider, reading the API key
    /// from the environment.
    pub fn client_config(&self) -> Result<ClientConfig> {
        self.client_config_from(|var| std::env::var(var).ok())
    }

    fn client_config_from<F>(&self, lookup: F) -> Result<ClientConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let provider = self.agent.provider;
        let section = self.provider_section();
        let mut config = ClientConfig::new(provider).with_timeout(section.timeout_secs);

        let key_var = section.api_key_env.as_deref().or(provider.api_key_env());
        if let Some(var) = key_var {
            let key = lookup(var).ok_or_else(|| {
                Error::capability(provider.as_str(), format!("missing API key; set {var}"))
            })?;
            config = config.with_api_key(key);
        }
        if let Some(url) = section.base_url {
            config = config.with_base_url(url);
        }
        if let Some(model) = self.agent.model.clone().or(section.default_model) {
            config = config.with_default_model(model);
        }
        Ok(config)
    }

    pub fn completion_settings(&self) -> CompletionSettings {
        let mut settings = CompletionSettings::default().with_temperature(self.agent.temperature);
        if let Some(model) = &self.agent.model {
            settings = settings.with_model(model.clone());
        }
        if let Some(max_tokens) = self.agent.max_tokens {
            settings = settings.with_max_tokens(max_tokens);
        }
        settings
    }

    pub fn dialectic_agent(&self) -> Result<DialecticAgent> {
        Ok(DialecticAgent::new()?
            .with_settings(self.completion_settings())
            .with_objection_threshold(self.dialogue.objection_threshold))
    }

    pub fn literature_agent(&self) -> Result<LiteratureAgent> {
        Ok(LiteratureAgent::new()?
            .with_settings(self.completion_settings())
            .with_max_steps(self.engine.max_steps_per_turn))
    }

    pub fn edit_agent(&self) -> Result<EditAgent> {
        Ok(EditAgent::new()?
            .with_settings(self.completion_settings())
            .with_analysis_options(self.analysis)
            .with_max_steps(self.engine.max_steps_per_turn))
    }
}

/// Path of the global configuration file, if a home directory is known.
pub fn global_config_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(base.join("theoria").join("config.yaml"))
}

/// Nearest project file at or above `start`.
pub fn find_project_config(start: &Path) -> Option<PathBuf> {
    start.ancestors().find_map(|dir| {
        PROJECT_FILE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
    })
}

/// Write a default project file into `dir` unless one is already there.
///
/// Returns the path of the project file either way.
pub fn init_project_config(dir: &Path) -> Result<PathBuf> {
    let target = dir.join(PROJECT_FILE_NAME);
    if target.exists() {
        debug!(path = %target.display(), "project configuration already present");
        return Ok(target);
    }
    write_file(&target, &TheoriaConfig::default().to_yaml_string()?)?;
    info!(path = %target.display(), "wrote default project configuration");
    Ok(target)
}

/// Merge `overlay` into `base`; nested mappings merge, anything else replaces.
fn merge_mappings(base: &mut Mapping, overlay: Mapping) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Mapping(existing)), Value::Mapping(incoming)) => {
                merge_mappings(existing, incoming)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Drop every entry equal to the same entry of `defaults`.
fn strip_defaults(current: Mapping, defaults: &Mapping) -> Mapping {
    let mut kept = Mapping::new();
    for (key, value) in current {
        match (value, defaults.get(&key)) {
            (Value::Mapping(inner), Some(Value::Mapping(base))) => {
                let inner = strip_defaults(inner, base);
                if !inner.is_empty() {
                    kept.insert(key, Value::Mapping(inner));
                }
            }
            (value, Some(base)) if &value == base => {}
            (value, _) => {
                kept.insert(key, value);
            }
        }
    }
    kept
}

fn to_mapping(config: &TheoriaConfig) -> Result<Mapping> {
    match serde_yaml::to_value(config) {
        Ok(Value::Mapping(mapping)) => Ok(mapping),
        Ok(_) => Err(Error::Internal("configuration did not serialize to a mapping".into())),
        Err(e) => Err(Error::Config(format!("serialize config: {e}"))),
    }
}

/// Read a YAML file as a mapping; an empty file counts as an empty mapping.
fn read_mapping(path: &Path) -> Result<Mapping> {
    let contents = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
    let value: Value = serde_yaml::from_str(&contents)
        .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))?;
    match value {
        Value::Mapping(mapping) => Ok(mapping),
        Value::Null => Ok(Mapping::new()),
        _ => Err(Error::Config(format!(
            "{} must hold a mapping at the top level",
            path.display()
        ))),
    }
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::Config(format!("create {}: {e}", parent.display())))?;
    }
    fs::write(path, contents).map_err(|e| Error::Config(format!("write {}: {e}", path.display())))
}

/// Builds a [`TheoriaConfig`] from the layered files and the environment.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    global_path: Option<PathBuf>,
    project_dir: Option<PathBuf>,
    use_env: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            global_path: global_config_path(),
            project_dir: std::env::current_dir().ok(),
            use_env: true,
        }
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.global_path = Some(path.into());
        self
    }

    pub fn without_global(mut self) -> Self {
        self.global_path = None;
        self
    }

    /// Directory the project file search starts from.
    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = Some(dir.into());
        self
    }

    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    /// Files that will be read, lowest precedence first.
    pub fn sources(&self) -> Vec<PathBuf> {
        let mut sources = Vec::new();
        if let Some(global) = self.global_path.as_ref().filter(|p| p.is_file()) {
            sources.push(global.clone());
        }
        if let Some(project) = self.project_dir.as_deref().and_then(find_project_config) {
            if !sources.contains(&project) {
                sources.push(project);
            }
        }
        sources
    }

    pub fn load(&self) -> Result<TheoriaConfig> {
        let mut merged = Mapping::new();
        for path in self.sources() {
            debug!(path = %path.display(), "reading configuration file");
            merge_mappings(&mut merged, read_mapping(&path)?);
        }

        let mut config: TheoriaConfig = serde_yaml::from_value(Value::Mapping(merged))
            .map_err(|e| Error::Config(format!("invalid configuration: {e}")))?;
        if self.use_env {
            config.apply_env_overrides(|var| std::env::var(var).ok())?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Write the non-default values of `config` to the global file.
    pub fn save_global(&self, config: &TheoriaConfig) -> Result<PathBuf> {
        config.validate()?;
        let path = self
            .global_path
            .clone()
            .ok_or_else(|| Error::Config("no global configuration path".into()))?;
        write_file(&path, &config.to_minimal_yaml_string()?)?;
        info!(path = %path.display(), "saved global configuration");
        Ok(path)
    }
}
