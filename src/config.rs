//! Layered configuration for the engine.
//!
//! Settings resolve in precedence order: built-in defaults, then the user
//! file (`~/.config/crucible/config.toml`), then the project file
//! (`.crucible/crucible.toml`), then `CRUCIBLE_*` environment variables.
//! The result is an [`EngineConfig`] with plain public fields; anything a
//! caller sets on it afterwards is the final word.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:7177"
//! listener_buffer = 256
//!
//! [watcher]
//! poll_ms = 500
//!
//! [supervisor]
//! poll_ms = 2000
//! stuck_after_secs = 60
//! probe_timeout_ms = 1000
//! kill_grace_secs = 5
//!
//! [knowledge]
//! token_budget = 100000
//! max_briefing_tokens = 4000
//! min_handoff_body = 80
//!
//! [personas.overrides."db-*"]
//! token_budget = 50000
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::hub::DEFAULT_LISTENER_BUFFER;
use crate::knowledge::KnowledgeLimits;
use crate::tracker::{DEFAULT_KILL_GRACE, DEFAULT_KILL_POLL};

/// Default bind address for `crucible serve`.
pub const DEFAULT_BIND: &str = "127.0.0.1:7177";

/// HTTP/websocket server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Bind address for the serve command.
    pub bind: String,
    /// Per-listener event buffer; the oldest frame drops on overflow.
    pub listener_buffer: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            listener_buffer: DEFAULT_LISTENER_BUFFER,
        }
    }
}

/// Change watcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherSection {
    /// Snapshot diff cadence in milliseconds.
    pub poll_ms: u64,
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            poll_ms: crate::watcher::DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

/// Worker supervision settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    /// Liveness sweep cadence in milliseconds.
    pub poll_ms: u64,
    /// Idle seconds before a running worker is flagged stuck.
    pub stuck_after_secs: u64,
    /// Per-probe timeout in milliseconds.
    pub probe_timeout_ms: u64,
    /// Seconds between SIGTERM and SIGKILL when killing a worker.
    pub kill_grace_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            poll_ms: crate::tracker::supervisor::DEFAULT_POLL_INTERVAL.as_millis() as u64,
            stuck_after_secs: crate::tracker::supervisor::DEFAULT_STUCK_AFTER.as_secs(),
            probe_timeout_ms: crate::tracker::supervisor::DEFAULT_PROBE_TIMEOUT.as_millis() as u64,
            kill_grace_secs: DEFAULT_KILL_GRACE.as_secs(),
        }
    }
}

/// Budget overrides keyed by glob patterns over task titles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaSection {
    /// Pattern-based overrides (e.g. `"db-*"` pinning a tighter budget).
    pub overrides: BTreeMap<String, PersonaOverride>,
}

/// Override values for workers registered against matching tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonaOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<u64>,
}

impl PersonaSection {
    /// The budget override for a task title, if any pattern matches.
    ///
    /// Matching is case-insensitive. With several matching patterns the
    /// lexically last one wins; invalid patterns are skipped (surfaced by
    /// [`CrucibleToml::validate`], not here).
    pub fn budget_for(&self, title: &str) -> Option<u64> {
        let options = MatchOptions {
            case_sensitive: false,
            ..MatchOptions::default()
        };
        let mut matched = None;
        for (pattern, override_cfg) in &self.overrides {
            let Ok(pattern) = Pattern::new(pattern) else {
                continue;
            };
            if pattern.matches_with(title, options)
                && let Some(budget) = override_cfg.token_budget
            {
                matched = Some(budget);
            }
        }
        matched
    }
}

/// The complete crucible.toml structure. Every section is optional; an
/// empty file resolves to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrucibleToml {
    pub server: ServerSection,
    pub watcher: WatcherSection,
    pub supervisor: SupervisorSection,
    pub knowledge: KnowledgeLimits,
    pub personas: PersonaSection,
}

impl CrucibleToml {
    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, EngineError> {
        let toml = toml::from_str(content).context("parse crucible.toml")?;
        Ok(toml)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|source| EngineError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Load `crucible.toml` from the given directory, or defaults when the
    /// file does not exist.
    pub fn load_or_default(crucible_dir: &Path) -> Result<Self, EngineError> {
        let path = crucible_dir.join("crucible.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the user and project files for `project_dir`, later files
    /// overriding earlier ones section by section.
    pub fn layered(project_dir: &Path) -> Result<Self, EngineError> {
        let mut paths = Vec::new();
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("crucible").join("config.toml"));
        }
        paths.push(project_dir.join(".crucible").join("crucible.toml"));
        Self::layered_from(&paths)
    }

    /// Layer an explicit list of files; missing ones are skipped.
    pub fn layered_from(paths: &[PathBuf]) -> Result<Self, EngineError> {
        let mut merged = toml::Table::new();
        for path in paths {
            if !path.exists() {
                continue;
            }
            let content =
                std::fs::read_to_string(path).map_err(|source| EngineError::ReadFailed {
                    path: path.clone(),
                    source,
                })?;
            let table: toml::Table = toml::from_str(&content)
                .with_context(|| format!("parse {}", path.display()))?;
            merge_tables(&mut merged, table);
        }
        let toml = toml::Value::Table(merged)
            .try_into()
            .context("resolve layered configuration")?;
        Ok(toml)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        let content = toml::to_string_pretty(self).context("serialize crucible.toml")?;
        std::fs::write(path, content).map_err(|source| EngineError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for pattern in self.personas.overrides.keys() {
            if let Err(err) = Pattern::new(pattern) {
                warnings.push(format!("invalid override pattern '{pattern}': {err}"));
            }
        }
        if self.server.listener_buffer == 0 {
            warnings.push("listener_buffer is 0: every event frame will be dropped".to_string());
        }
        warnings
    }
}

/// Deep-merge `over` into `base`: tables merge key by key, everything else
/// replaces.
fn merge_tables(base: &mut toml::Table, over: toml::Table) {
    for (key, value) in over {
        match (base.remove(&key), value) {
            (Some(toml::Value::Table(mut dst)), toml::Value::Table(src)) => {
                merge_tables(&mut dst, src);
                base.insert(key, toml::Value::Table(dst));
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Runtime configuration consumed by the engine.
///
/// [`Default`] is the pure built-ins; [`load`](Self::load) walks the full
/// precedence chain including the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind: String,
    pub listener_buffer: usize,
    pub watch_interval: Duration,
    pub supervise_interval: Duration,
    pub stuck_after: Duration,
    pub probe_timeout: Duration,
    pub kill_grace: Duration,
    pub kill_poll: Duration,
    pub knowledge: KnowledgeLimits,
    pub personas: PersonaSection,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_sections(&CrucibleToml::default())
    }
}

impl EngineConfig {
    /// Load the layered configuration for a project directory.
    pub fn load(project_dir: &Path) -> Result<Self, EngineError> {
        Ok(Self::resolve(&CrucibleToml::layered(project_dir)?))
    }

    /// Apply the `CRUCIBLE_*` environment layer on top of parsed files.
    pub fn resolve(toml: &CrucibleToml) -> Self {
        let mut config = Self::from_sections(toml);
        if let Ok(bind) = std::env::var("CRUCIBLE_BIND") {
            config.bind = bind;
        }
        if let Ok(value) = std::env::var("CRUCIBLE_TOKEN_BUDGET")
            && let Ok(budget) = value.parse()
        {
            config.knowledge.token_budget = budget;
        }
        config
    }

    fn from_sections(toml: &CrucibleToml) -> Self {
        Self {
            bind: toml.server.bind.clone(),
            listener_buffer: toml.server.listener_buffer,
            watch_interval: Duration::from_millis(toml.watcher.poll_ms),
            supervise_interval: Duration::from_millis(toml.supervisor.poll_ms),
            stuck_after: Duration::from_secs(toml.supervisor.stuck_after_secs),
            probe_timeout: Duration::from_millis(toml.supervisor.probe_timeout_ms),
            kill_grace: Duration::from_secs(toml.supervisor.kill_grace_secs),
            kill_poll: DEFAULT_KILL_POLL,
            knowledge: toml.knowledge.clone(),
            personas: toml.personas.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn empty_file_resolves_to_defaults() {
        let toml = CrucibleToml::parse("").unwrap();
        assert_eq!(toml.server.bind, DEFAULT_BIND);
        assert_eq!(toml.server.listener_buffer, 256);
        assert_eq!(toml.watcher.poll_ms, 500);
        assert_eq!(toml.supervisor.stuck_after_secs, 60);
        assert_eq!(toml.knowledge.token_budget, 100_000);
        assert!(toml.personas.overrides.is_empty());
    }

    #[test]
    fn partial_sections_keep_unlisted_defaults() {
        let content = r#"
[server]
bind = "0.0.0.0:9000"

[supervisor]
poll_ms = 250
"#;
        let toml = CrucibleToml::parse(content).unwrap();
        assert_eq!(toml.server.bind, "0.0.0.0:9000");
        assert_eq!(toml.server.listener_buffer, 256);
        assert_eq!(toml.supervisor.poll_ms, 250);
        assert_eq!(toml.supervisor.kill_grace_secs, 5);
    }

    #[test]
    fn persona_overrides_parse() {
        let content = r#"
[personas.overrides."db-*"]
token_budget = 50000

[personas.overrides."docs-*"]
"#;
        let toml = CrucibleToml::parse(content).unwrap();
        assert_eq!(toml.personas.overrides.len(), 2);
        assert_eq!(
            toml.personas.overrides["db-*"].token_budget,
            Some(50_000)
        );
        assert_eq!(toml.personas.overrides["docs-*"].token_budget, None);
    }

    #[test]
    fn budget_for_matches_titles_case_insensitively() {
        let content = r#"
[personas.overrides."db-*"]
token_budget = 50000
"#;
        let toml = CrucibleToml::parse(content).unwrap();
        assert_eq!(toml.personas.budget_for("db-schema rollout"), Some(50_000));
        assert_eq!(toml.personas.budget_for("DB-Schema rollout"), Some(50_000));
        assert_eq!(toml.personas.budget_for("api surface"), None);
    }

    #[test]
    fn lexically_last_matching_pattern_wins() {
        let mut personas = PersonaSection::default();
        personas.overrides.insert(
            "db-*".to_string(),
            PersonaOverride {
                token_budget: Some(1_000),
            },
        );
        personas.overrides.insert(
            "db-schema*".to_string(),
            PersonaOverride {
                token_budget: Some(2_000),
            },
        );
        assert_eq!(personas.budget_for("db-schema rollout"), Some(2_000));
        assert_eq!(personas.budget_for("db-api"), Some(1_000));
    }

    #[test]
    fn invalid_pattern_is_skipped_and_reported() {
        let mut toml = CrucibleToml::default();
        toml.personas.overrides.insert(
            "[".to_string(),
            PersonaOverride {
                token_budget: Some(1),
            },
        );
        toml.personas.overrides.insert(
            "ok-*".to_string(),
            PersonaOverride {
                token_budget: Some(2),
            },
        );

        assert_eq!(toml.personas.budget_for("ok-task"), Some(2));
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("invalid override pattern"));
    }

    #[test]
    fn zero_listener_buffer_warns() {
        let mut toml = CrucibleToml::default();
        toml.server.listener_buffer = 0;
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("listener_buffer"));
    }

    #[test]
    fn load_or_default_without_file() {
        let dir = tempdir().unwrap();
        let toml = CrucibleToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml, CrucibleToml::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crucible.toml");

        let mut toml = CrucibleToml::default();
        toml.server.bind = "127.0.0.1:9999".to_string();
        toml.knowledge.token_budget = 42_000;
        toml.save(&path).unwrap();

        let loaded = CrucibleToml::load(&path).unwrap();
        assert_eq!(loaded, toml);
    }

    #[test]
    fn later_layers_override_earlier_ones_per_key() {
        let dir = tempdir().unwrap();
        let user = dir.path().join("user.toml");
        let project = dir.path().join("project.toml");
        std::fs::write(
            &user,
            r#"
[server]
bind = "0.0.0.0:8000"
listener_buffer = 64

[knowledge]
token_budget = 10000
"#,
        )
        .unwrap();
        std::fs::write(
            &project,
            r#"
[server]
bind = "127.0.0.1:7177"
"#,
        )
        .unwrap();

        let toml = CrucibleToml::layered_from(&[user, project]).unwrap();
        // The project file wins where it speaks...
        assert_eq!(toml.server.bind, "127.0.0.1:7177");
        // ...the user file survives where it does not...
        assert_eq!(toml.server.listener_buffer, 64);
        assert_eq!(toml.knowledge.token_budget, 10_000);
        // ...and untouched sections stay at the defaults.
        assert_eq!(toml.watcher.poll_ms, 500);
    }

    #[test]
    fn missing_layer_files_are_skipped() {
        let dir = tempdir().unwrap();
        let toml = CrucibleToml::layered_from(&[dir.path().join("absent.toml")]).unwrap();
        assert_eq!(toml, CrucibleToml::default());
    }

    #[test]
    fn environment_overrides_files() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved_bind = std::env::var("CRUCIBLE_BIND").ok();
        let saved_budget = std::env::var("CRUCIBLE_TOKEN_BUDGET").ok();
        unsafe {
            std::env::set_var("CRUCIBLE_BIND", "0.0.0.0:4000");
            std::env::set_var("CRUCIBLE_TOKEN_BUDGET", "7777");
        }

        let config = EngineConfig::resolve(&CrucibleToml::default());
        assert_eq!(config.bind, "0.0.0.0:4000");
        assert_eq!(config.knowledge.token_budget, 7_777);

        unsafe {
            match saved_bind {
                Some(val) => std::env::set_var("CRUCIBLE_BIND", val),
                None => std::env::remove_var("CRUCIBLE_BIND"),
            }
            match saved_budget {
                Some(val) => std::env::set_var("CRUCIBLE_TOKEN_BUDGET", val),
                None => std::env::remove_var("CRUCIBLE_TOKEN_BUDGET"),
            }
        }
    }

    #[test]
    fn unparseable_budget_env_is_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var("CRUCIBLE_TOKEN_BUDGET").ok();
        unsafe { std::env::set_var("CRUCIBLE_TOKEN_BUDGET", "plenty") };

        let config = EngineConfig::resolve(&CrucibleToml::default());
        assert_eq!(config.knowledge.token_budget, 100_000);

        unsafe {
            match saved {
                Some(val) => std::env::set_var("CRUCIBLE_TOKEN_BUDGET", val),
                None => std::env::remove_var("CRUCIBLE_TOKEN_BUDGET"),
            }
        }
    }

    #[test]
    fn default_engine_config_matches_daemon_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.watch_interval, crate::watcher::DEFAULT_POLL_INTERVAL);
        assert_eq!(
            config.supervise_interval,
            crate::tracker::supervisor::DEFAULT_POLL_INTERVAL
        );
        assert_eq!(config.kill_grace, DEFAULT_KILL_GRACE);
        assert_eq!(config.kill_poll, DEFAULT_KILL_POLL);
        assert_eq!(config.listener_buffer, DEFAULT_LISTENER_BUFFER);
    }
}
