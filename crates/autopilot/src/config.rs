//! Harness configuration.
//!
//! Layering, lowest to highest precedence:
//! built-in defaults → TOML file (`--config`) → `AUTOPILOT_*` environment → CLI flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use autonomy::PauseConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::tracker::linear::LINEAR_API_URL;

pub const DEFAULT_MODEL: &str = "claude-opus-4-5-20251101";

/// Relative project directories are placed under this directory.
pub const GENERATIONS_DIR: &str = "generations";

/// Agent credential checked at startup.
pub const AGENT_TOKEN_ENV: &str = "CLAUDE_CODE_OAUTH_TOKEN";
/// Tracker credential checked at startup.
pub const TRACKER_KEY_ENV: &str = "LINEAR_API_KEY";

/// Durations are whole seconds on disk and in the environment.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub project_dir: PathBuf,
    pub model: String,
    /// `None` runs until completion or a fatal error.
    pub max_iterations: Option<u32>,
    #[serde(rename = "session_timeout_secs", with = "duration_secs")]
    pub session_timeout: Duration,
    #[serde(rename = "watchdog_timeout_secs", with = "duration_secs")]
    pub watchdog_timeout: Duration,
    #[serde(rename = "max_idle_secs", with = "duration_secs")]
    pub max_idle: Duration,
    #[serde(rename = "auto_continue_delay_secs", with = "duration_secs")]
    pub auto_continue_delay: Duration,
    /// Start the next session immediately instead of after `auto_continue_delay`.
    pub continuous: bool,
    /// Stop once the tracker reports every item done.
    pub auto_stop: bool,
    pub skip_validation: bool,
    /// Relative paths resolve against `project_dir`.
    pub state_file: PathBuf,
    pub prompts_dir: Option<PathBuf>,
    /// Agent CLI executable.
    pub agent_command: String,
    pub pause: PauseConfig,
    #[serde(rename = "cache_ttl_secs", with = "duration_secs")]
    pub cache_ttl: Duration,
    pub tracker_api_url: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("autonomous_demo_project"),
            model: DEFAULT_MODEL.to_string(),
            max_iterations: None,
            session_timeout: Duration::from_secs(30 * 60),
            watchdog_timeout: Duration::from_secs(5 * 60),
            max_idle: autonomy::DEFAULT_MAX_IDLE,
            auto_continue_delay: Duration::from_secs(3),
            continuous: true,
            auto_stop: true,
            skip_validation: false,
            state_file: PathBuf::from(autonomy::state::STATE_FILE_NAME),
            prompts_dir: None,
            agent_command: "claude".to_string(),
            pause: PauseConfig::default(),
            cache_ttl: crate::tracker::cache::DEFAULT_CACHE_TTL,
            tracker_api_url: LINEAR_API_URL.to_string(),
        }
    }
}

/// Flag values that override everything else. `None` leaves the field alone.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub project_dir: Option<PathBuf>,
    pub model: Option<String>,
    pub max_iterations: Option<u32>,
    pub session_timeout_secs: Option<u64>,
    pub watchdog_timeout_secs: Option<u64>,
    pub prompts_dir: Option<PathBuf>,
    pub no_auto_stop: bool,
    pub skip_validation: bool,
    pub manual: bool,
}

impl HarnessConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Apply `AUTOPILOT_*` variables from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply `AUTOPILOT_*` variables from `lookup`. Unparsable values are
    /// logged and ignored.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(key, value = %raw, "ignoring unparsable environment override");
                    None
                }
            }
        }
        let secs = |key: &str| parsed::<u64>(key, lookup(key)).map(Duration::from_secs);

        if let Some(v) = lookup("AUTOPILOT_PROJECT_DIR") {
            self.project_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("AUTOPILOT_MODEL") {
            self.model = v;
        }
        if let Some(v) = parsed("AUTOPILOT_MAX_ITERATIONS", lookup("AUTOPILOT_MAX_ITERATIONS")) {
            self.max_iterations = Some(v);
        }
        if let Some(d) = secs("AUTOPILOT_SESSION_TIMEOUT_SECS") {
            self.session_timeout = d;
        }
        if let Some(d) = secs("AUTOPILOT_WATCHDOG_TIMEOUT_SECS") {
            self.watchdog_timeout = d;
        }
        if let Some(d) = secs("AUTOPILOT_MAX_IDLE_SECS") {
            self.max_idle = d;
        }
        if let Some(d) = secs("AUTOPILOT_AUTO_CONTINUE_DELAY_SECS") {
            self.auto_continue_delay = d;
        }
        if let Some(v) = parsed("AUTOPILOT_CONTINUOUS", lookup("AUTOPILOT_CONTINUOUS")) {
            self.continuous = v;
        }
        if let Some(v) = parsed("AUTOPILOT_AUTO_STOP", lookup("AUTOPILOT_AUTO_STOP")) {
            self.auto_stop = v;
        }
        if let Some(v) = lookup("AUTOPILOT_PROMPTS_DIR") {
            self.prompts_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("AUTOPILOT_AGENT_COMMAND") {
            self.agent_command = v;
        }
        if let Some(v) = parsed("AUTOPILOT_ERROR_THRESHOLD", lookup("AUTOPILOT_ERROR_THRESHOLD")) {
            self.pause.error_threshold = v;
        }
        if let Some(d) = secs("AUTOPILOT_CACHE_TTL_SECS") {
            self.cache_ttl = d;
        }
        if let Some(v) = lookup("AUTOPILOT_TRACKER_API_URL") {
            self.tracker_api_url = v;
        }
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(dir) = &cli.project_dir {
            self.project_dir = dir.clone();
        }
        if let Some(model) = &cli.model {
            self.model = model.clone();
        }
        if cli.max_iterations.is_some() {
            self.max_iterations = cli.max_iterations;
        }
        if let Some(secs) = cli.session_timeout_secs {
            self.session_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = cli.watchdog_timeout_secs {
            self.watchdog_timeout = Duration::from_secs(secs);
        }
        if let Some(dir) = &cli.prompts_dir {
            self.prompts_dir = Some(dir.clone());
        }
        if cli.no_auto_stop {
            self.auto_stop = false;
        }
        if cli.skip_validation {
            self.skip_validation = true;
        }
        if cli.manual {
            self.continuous = false;
        }
    }

    /// Defaults, then the optional file, then the process environment, then `cli`.
    pub fn load(config_file: Option<&Path>, cli: &CliOverrides) -> Result<Self> {
        let mut config = match config_file {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.apply_cli(cli);
        config.resolve_paths();
        Ok(config)
    }

    /// Place relative project directories under `generations/` and anchor
    /// the state file in the project directory.
    pub fn resolve_paths(&mut self) {
        if self.project_dir.is_relative() && !self.project_dir.starts_with(GENERATIONS_DIR) {
            self.project_dir = Path::new(GENERATIONS_DIR).join(&self.project_dir);
        }
        if self.state_file.is_relative() {
            self.state_file = self.project_dir.join(&self.state_file);
        }
    }
}

/// Credentials the run command cannot start without.
pub fn missing_credentials(lookup: impl Fn(&str) -> Option<String>) -> Vec<&'static str> {
    [AGENT_TOKEN_ENV, TRACKER_KEY_ENV]
        .into_iter()
        .filter(|key| lookup(key).map_or(true, |v| v.trim().is_empty()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.session_timeout, Duration::from_secs(1800));
        assert_eq!(config.auto_continue_delay, Duration::from_secs(3));
        assert_eq!(config.cache_ttl, Duration::from_secs(180));
        assert_eq!(config.pause.error_threshold, 5);
        assert!(config.continuous);
        assert!(config.auto_stop);
        assert_eq!(config.max_iterations, None);
    }

    #[test]
    fn test_toml_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autopilot.toml");
        std::fs::write(
            &path,
            r#"
model = "claude-sonnet-4-5"
max_iterations = 12
session_timeout_secs = 600

[pause]
error_threshold = 3
"#,
        )
        .unwrap();

        let config = HarnessConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.model, "claude-sonnet-4-5");
        assert_eq!(config.max_iterations, Some(12));
        assert_eq!(config.session_timeout, Duration::from_secs(600));
        assert_eq!(config.pause.error_threshold, 3);
        assert_eq!(config.watchdog_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_bad_toml_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "max_iterations = \"many\"").unwrap();
        assert!(HarnessConfig::from_toml_file(&path).is_err());
        assert!(HarnessConfig::from_toml_file(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_env_then_cli_precedence() {
        let mut config = HarnessConfig::default();
        config.apply_env_with(env(&[
            ("AUTOPILOT_MODEL", "from-env"),
            ("AUTOPILOT_MAX_ITERATIONS", "7"),
            ("AUTOPILOT_SESSION_TIMEOUT_SECS", "not-a-number"),
            ("AUTOPILOT_CONTINUOUS", "false"),
            ("AUTOPILOT_ERROR_THRESHOLD", "2"),
        ]));
        assert_eq!(config.model, "from-env");
        assert_eq!(config.max_iterations, Some(7));
        assert_eq!(config.session_timeout, Duration::from_secs(1800));
        assert!(!config.continuous);
        assert_eq!(config.pause.error_threshold, 2);

        config.apply_cli(&CliOverrides {
            model: Some("from-cli".into()),
            max_iterations: Some(1),
            no_auto_stop: true,
            ..CliOverrides::default()
        });
        assert_eq!(config.model, "from-cli");
        assert_eq!(config.max_iterations, Some(1));
        assert!(!config.auto_stop);
    }

    #[test]
    fn test_resolve_paths() {
        let mut config = HarnessConfig {
            project_dir: PathBuf::from("my_app"),
            ..HarnessConfig::default()
        };
        config.resolve_paths();
        assert_eq!(config.project_dir, PathBuf::from("generations/my_app"));
        assert_eq!(
            config.state_file,
            PathBuf::from("generations/my_app/.autonomy_state.json")
        );

        let mut already = HarnessConfig {
            project_dir: PathBuf::from("generations/other"),
            ..HarnessConfig::default()
        };
        already.resolve_paths();
        assert_eq!(already.project_dir, PathBuf::from("generations/other"));

        let mut absolute = HarnessConfig {
            project_dir: PathBuf::from("/srv/app"),
            ..HarnessConfig::default()
        };
        absolute.resolve_paths();
        assert_eq!(absolute.project_dir, PathBuf::from("/srv/app"));
    }

    #[test]
    fn test_missing_credentials() {
        assert_eq!(
            missing_credentials(env(&[(AGENT_TOKEN_ENV, "tok"), (TRACKER_KEY_ENV, " ")])),
            vec![TRACKER_KEY_ENV]
        );
        assert!(missing_credentials(env(&[(AGENT_TOKEN_ENV, "a"), (TRACKER_KEY_ENV, "b")])).is_empty());
    }
}
