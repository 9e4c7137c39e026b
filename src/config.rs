//! Supervisor configuration
//!
//! A static mapping from logical names to the units they stand for, plus
//! tuning for retries and manager access. Loaded once at startup from
//! the main file and `<file>.d/*.conf` drop-ins, in that order.
//!
//! ```ini
//! [Supervisor]
//! MaxRetries=5
//! SupervisionWindowSec=5min
//!
//! [Target web]
//! Units=nginx php-fpm.service
//! Expect=active
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::Backoff;
use crate::state::TargetState;
use crate::units::{self, parse_duration, section_values, ParseError, ParsedFile, ParsedSection, UnitType};

const SUPERVISOR_SECTION: &str = "[Supervisor]";
const TARGET_PREFIX: &str = "[Target ";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },

    #[error("{origin}: invalid {key} in {section}: {value:?}")]
    Invalid {
        origin: String,
        section: String,
        key: String,
        value: String,
    },

    #[error("{1}: target '{0}' lists no units")]
    EmptyTarget(String, String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tuning for the reconciler, client and aggregator
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    /// Retries after the first attempt before a session fails
    pub max_retries: u32,
    /// Wall-clock limit for one session
    pub supervision_window: Duration,
    /// Concurrent in-flight manager calls
    pub max_concurrent_calls: usize,
    /// Deadline for query/apply calls
    pub call_timeout: Duration,
    /// Deadline for a job to finish
    pub job_timeout: Duration,
    /// Events buffered per subscriber before it is dropped
    pub subscriber_buffer: usize,
    pub retry_backoff: Backoff,
    pub reconnect_backoff: Backoff,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            supervision_window: Duration::from_secs(300),
            max_concurrent_calls: 8,
            call_timeout: Duration::from_secs(10),
            job_timeout: Duration::from_secs(90),
            subscriber_buffer: 256,
            retry_backoff: Backoff::retry(),
            reconnect_backoff: Backoff::reconnect(),
        }
    }
}

/// One `[Target name]` section
#[derive(Debug, Clone, PartialEq)]
pub struct TargetDef {
    pub logical: String,
    /// Unit names as written (possibly without suffix)
    pub units: Vec<String>,
    /// Explicit `Type=`, used to complete bare names
    pub unit_type: Option<UnitType>,
    /// State `watch` and `up` drive towards when none is given
    pub expect: TargetState,
    /// Restart policy hint carried into the resolved spec
    pub restart: Option<String>,
    /// File the definition came from
    pub origin: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub settings: SupervisorSettings,
    pub targets: Vec<TargetDef>,
}

impl Config {
    /// Parse a single configuration document
    pub fn parse(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let parsed = units::parse_file(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from(origin),
            source,
        })?;
        let mut config = Config::default();
        config.extend_from(&parsed, origin)?;
        Ok(config)
    }

    /// Load the main file and its drop-in directory
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        let parsed = units::parse_config_file(path)
            .await
            .map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.extend_from(&parsed, &path.display().to_string())?;

        for drop_in in drop_in_files(path).await? {
            log::debug!("Loading drop-in {}", drop_in.display());
            let parsed = units::parse_config_file(&drop_in)
                .await
                .map_err(|source| ConfigError::Parse {
                    path: drop_in.clone(),
                    source,
                })?;
            config.extend_from(&parsed, &drop_in.display().to_string())?;
        }

        log::debug!(
            "Loaded {} target definitions from {}",
            config.targets.len(),
            path.display()
        );
        Ok(config)
    }

    /// Default config location for the system or per-user instance
    pub fn default_path(user: bool) -> PathBuf {
        if user {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(".config"))
                .join("sysward/sysward.conf")
        } else {
            PathBuf::from("/etc/sysward/sysward.conf")
        }
    }

    /// Merge one parsed file: settings override, targets accumulate
    pub fn extend_from(&mut self, parsed: &ParsedFile, origin: &str) -> Result<(), ConfigError> {
        // Sort headers so errors and target order don't depend on hash order
        let mut headers: Vec<&String> = parsed.keys().collect();
        headers.sort();

        for header in headers {
            let section = &parsed[header];
            if header == SUPERVISOR_SECTION {
                apply_settings(&mut self.settings, section, origin)?;
            } else if let Some(name) = header
                .strip_prefix(TARGET_PREFIX)
                .and_then(|rest| rest.strip_suffix(']'))
            {
                let target = parse_target(name.trim(), section, origin)?;
                self.targets.push(target);
            } else {
                log::warn!("{}: ignoring unknown section {}", origin, header);
            }
        }
        Ok(())
    }

    /// All definitions of a logical name, in load order
    pub fn definitions<'a>(&'a self, logical: &'a str) -> impl Iterator<Item = &'a TargetDef> + 'a {
        self.targets.iter().filter(move |t| t.logical == logical)
    }

    /// Configured logical names, sorted and deduplicated
    pub fn logical_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.targets.iter().map(|t| t.logical.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

async fn drop_in_files(path: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let mut dir = path.as_os_str().to_owned();
    dir.push(".d");
    let dir = PathBuf::from(dir);

    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "conf") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn invalid(origin: &str, section: &str, key: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        origin: origin.to_string(),
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
    }
}

/// Last value of a key, as systemd does for single-valued settings
fn last_value(section: &ParsedSection, key: &str) -> Option<String> {
    section_values(section, key).pop()
}

fn apply_settings(
    settings: &mut SupervisorSettings,
    section: &ParsedSection,
    origin: &str,
) -> Result<(), ConfigError> {
    let parse_count = |key: &str| -> Result<Option<u64>, ConfigError> {
        match last_value(section, key) {
            Some(v) => v
                .parse::<u64>()
                .map(Some)
                .map_err(|_| invalid(origin, SUPERVISOR_SECTION, key, &v)),
            None => Ok(None),
        }
    };
    let parse_time = |key: &str| -> Result<Option<Duration>, ConfigError> {
        match last_value(section, key) {
            Some(v) => parse_duration(&v)
                .map(Some)
                .ok_or_else(|| invalid(origin, SUPERVISOR_SECTION, key, &v)),
            None => Ok(None),
        }
    };

    if let Some(n) = parse_count("MAXRETRIES")? {
        settings.max_retries = u32::try_from(n)
            .map_err(|_| invalid(origin, SUPERVISOR_SECTION, "MAXRETRIES", &n.to_string()))?;
    }
    if let Some(n) = parse_count("MAXCONCURRENTCALLS")? {
        if n == 0 {
            return Err(invalid(origin, SUPERVISOR_SECTION, "MAXCONCURRENTCALLS", "0"));
        }
        settings.max_concurrent_calls = n as usize;
    }
    if let Some(n) = parse_count("SUBSCRIBERBUFFER")? {
        if n == 0 {
            return Err(invalid(origin, SUPERVISOR_SECTION, "SUBSCRIBERBUFFER", "0"));
        }
        settings.subscriber_buffer = n as usize;
    }
    if let Some(d) = parse_time("SUPERVISIONWINDOWSEC")? {
        settings.supervision_window = d;
    }
    if let Some(d) = parse_time("CALLTIMEOUTSEC")? {
        settings.call_timeout = d;
    }
    if let Some(d) = parse_time("JOBTIMEOUTSEC")? {
        settings.job_timeout = d;
    }
    if let Some(d) = parse_time("RETRYBACKOFFBASESEC")? {
        settings.retry_backoff.base = d;
    }
    if let Some(d) = parse_time("RETRYBACKOFFMAXSEC")? {
        settings.retry_backoff.cap = d;
    }

    for key in section.keys() {
        if !KNOWN_SETTINGS.contains(&key.as_str()) {
            log::warn!("{}: unknown setting {} in {}", origin, key, SUPERVISOR_SECTION);
        }
    }
    Ok(())
}

const KNOWN_SETTINGS: &[&str] = &[
    "MAXRETRIES",
    "MAXCONCURRENTCALLS",
    "SUBSCRIBERBUFFER",
    "SUPERVISIONWINDOWSEC",
    "CALLTIMEOUTSEC",
    "JOBTIMEOUTSEC",
    "RETRYBACKOFFBASESEC",
    "RETRYBACKOFFMAXSEC",
];

fn parse_target(name: &str, section: &ParsedSection, origin: &str) -> Result<TargetDef, ConfigError> {
    let header = format!("{}{}]", TARGET_PREFIX, name);

    let unit_type = match last_value(section, "TYPE") {
        Some(v) => Some(UnitType::parse(&v).ok_or_else(|| invalid(origin, &header, "Type", &v))?),
        None => None,
    };

    let expect = match last_value(section, "EXPECT") {
        Some(v) => TargetState::parse(&v).ok_or_else(|| invalid(origin, &header, "Expect", &v))?,
        None => TargetState::Active,
    };

    let units = section_values(section, "UNITS");
    if units.is_empty() {
        return Err(ConfigError::EmptyTarget(name.to_string(), origin.to_string()));
    }
    for unit in &units {
        if !units::is_valid_unit_name(unit) || units::has_unsupported_suffix(unit) {
            return Err(invalid(origin, &header, "Units", unit));
        }
    }

    Ok(TargetDef {
        logical: name.to_string(),
        units,
        unit_type,
        expect,
        restart: last_value(section, "RESTART"),
        origin: origin.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[Supervisor]
MaxRetries=3
SupervisionWindowSec=2min
MaxConcurrentCalls=4
CallTimeoutSec=500ms

[Target web]
Units=nginx php-fpm.service
Expect=active
Restart=on-failure

[Target sockets]
Units=docker
Type=socket
Expect=inactive
"#;

    #[test]
    fn test_parse_settings() {
        let config = Config::parse(SAMPLE, "test.conf").unwrap();
        assert_eq!(config.settings.max_retries, 3);
        assert_eq!(config.settings.supervision_window, Duration::from_secs(120));
        assert_eq!(config.settings.max_concurrent_calls, 4);
        assert_eq!(config.settings.call_timeout, Duration::from_millis(500));
        // untouched keys keep defaults
        assert_eq!(config.settings.job_timeout, Duration::from_secs(90));
        assert_eq!(config.settings.subscriber_buffer, 256);
    }

    #[test]
    fn test_parse_targets() {
        let config = Config::parse(SAMPLE, "test.conf").unwrap();
        assert_eq!(config.logical_names(), vec!["sockets", "web"]);

        let web = config.definitions("web").next().unwrap();
        assert_eq!(web.units, vec!["nginx", "php-fpm.service"]);
        assert_eq!(web.unit_type, None);
        assert_eq!(web.expect, TargetState::Active);
        assert_eq!(web.restart.as_deref(), Some("on-failure"));

        let sockets = config.definitions("sockets").next().unwrap();
        assert_eq!(sockets.unit_type, Some(UnitType::Socket));
        assert_eq!(sockets.expect, TargetState::Inactive);
    }

    #[test]
    fn test_defaults_without_supervisor_section() {
        let config = Config::parse("[Target a]\nUnits=a\n", "a.conf").unwrap();
        assert_eq!(config.settings, SupervisorSettings::default());
    }

    #[test]
    fn test_invalid_retry_count() {
        let err = Config::parse("[Supervisor]\nMaxRetries=lots\n", "bad.conf").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "MAXRETRIES"));
    }

    #[test]
    fn test_overflowing_duration_rejected() {
        let content = format!("[Supervisor]\nJobTimeoutSec={}min\n", u64::MAX / 10);
        let err = Config::parse(&content, "bad.conf").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "JOBTIMEOUTSEC"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = Config::parse("[Supervisor]\nMaxConcurrentCalls=0\n", "bad.conf").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_invalid_type() {
        let err = Config::parse("[Target a]\nUnits=a\nType=mount\n", "bad.conf").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "Type"));
    }

    #[test]
    fn test_empty_target_rejected() {
        let err = Config::parse("[Target a]\nExpect=active\n", "bad.conf").unwrap_err();
        assert!(matches!(err, ConfigError::EmptyTarget(ref name, _) if name == "a"));
    }

    #[test]
    fn test_invalid_unit_name() {
        let err = Config::parse("[Target a]\nUnits=../etc/passwd\n", "bad.conf").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_unsupported_unit_type_rejected() {
        let err = Config::parse("[Target boot]\nUnits=multi-user.target\n", "bad.conf").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref value, .. } if value == "multi-user.target"));
    }

    #[test]
    fn test_unknown_section_ignored() {
        let config = Config::parse("[Unit]\nDescription=x\n[Target a]\nUnits=a\n", "x.conf").unwrap();
        assert_eq!(config.targets.len(), 1);
    }

    #[test]
    fn test_extend_accumulates_definitions() {
        let mut config = Config::parse(SAMPLE, "main.conf").unwrap();
        let drop_in = units::parse_file("[Supervisor]\nMaxRetries=9\n[Target web]\nUnits=caddy\n").unwrap();
        config.extend_from(&drop_in, "10-web.conf").unwrap();

        assert_eq!(config.settings.max_retries, 9);
        assert_eq!(config.definitions("web").count(), 2);
        assert_eq!(config.logical_names(), vec!["sockets", "web"]);
    }

    #[tokio::test]
    async fn test_load_with_drop_ins() {
        let dir = std::env::temp_dir().join(format!("sysward-config-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(dir.join("sysward.conf.d")).unwrap();

        let main = dir.join("sysward.conf");
        std::fs::write(&main, SAMPLE).unwrap();
        std::fs::write(
            dir.join("sysward.conf.d/50-extra.conf"),
            "[Target db]\nUnits=postgresql\n",
        )
        .unwrap();
        std::fs::write(dir.join("sysward.conf.d/README"), "not a drop-in").unwrap();

        let config = Config::load(&main).await.unwrap();
        assert_eq!(config.logical_names(), vec!["db", "sockets", "web"]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_drop_ins_apply_in_lexical_order() {
        let dir = std::env::temp_dir().join(format!("sysward-order-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(dir.join("sysward.conf.d")).unwrap();

        let main = dir.join("sysward.conf");
        std::fs::write(&main, "[Supervisor]\nMaxRetries=1\n").unwrap();
        std::fs::write(dir.join("sysward.conf.d/20-late.conf"), "[Supervisor]\nMaxRetries=7\n").unwrap();
        std::fs::write(dir.join("sysward.conf.d/10-early.conf"), "[Supervisor]\nMaxRetries=4\n").unwrap();

        let files = drop_in_files(&main).await.unwrap();
        assert_eq!(
            files,
            vec![
                dir.join("sysward.conf.d/10-early.conf"),
                dir.join("sysward.conf.d/20-late.conf")
            ]
        );
        let config = Config::load(&main).await.unwrap();
        assert_eq!(config.settings.max_retries, 7);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/sysward.conf")).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
