use anyhow::{Result, bail};
use live_channel::{Endpoint, ExchangePlan};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Unified config (figment-deserialized from defaults / liveload.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   liveload.toml:   [load]
//                    vus = 10
//
//   env var:         LIVELOAD_LOAD__VUS=10   (double underscore = nesting)
//
//   CLI flag:        liveload run --vus 10
//
//   (single underscore stays within field names: LIVELOAD_LOAD__SESSION_SECS)

/// Named target presets.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// host=localhost:4000, plain http/ws
    Dev,
    /// https/wss, host taken from config
    Prod,
}

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub profile: Option<Profile>,
    #[serde(default)]
    pub target: TargetFileConfig,
    #[serde(default)]
    pub load: LoadFileConfig,
    #[serde(default)]
    pub exchange: ExchangeFileConfig,
}

/// The application under load (lives under `[target]`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TargetFileConfig {
    #[serde(default)]
    pub host: Option<String>,
    /// Use https/wss instead of http/ws.
    #[serde(default)]
    pub secure: bool,
}

/// Virtual-user pacing (lives under `[load]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadFileConfig {
    #[serde(default = "default_vus")]
    pub vus: usize,
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    /// Wall-clock budget of one session; the socket is closed when it runs out.
    #[serde(default = "default_session_secs")]
    pub session_secs: u64,
}

impl Default for LoadFileConfig {
    fn default() -> Self {
        Self {
            vus: default_vus(),
            duration_secs: default_duration_secs(),
            session_secs: default_session_secs(),
        }
    }
}

/// What each session sends once joined (lives under `[exchange]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExchangeFileConfig {
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_pace_ms")]
    pub pace_ms: u64,
    #[serde(default = "default_event_name")]
    pub event_name: String,
    #[serde(default = "default_field")]
    pub field: String,
    #[serde(default = "default_samples")]
    pub samples: Vec<String>,
}

impl Default for ExchangeFileConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            pace_ms: default_pace_ms(),
            event_name: default_event_name(),
            field: default_field(),
            samples: default_samples(),
        }
    }
}

fn default_vus() -> usize {
    3
}
fn default_duration_secs() -> u64 {
    3
}
fn default_session_secs() -> u64 {
    2
}
fn default_max_messages() -> usize {
    1
}
fn default_pace_ms() -> u64 {
    500
}
fn default_event_name() -> String {
    "run_code".to_string()
}
fn default_field() -> String {
    "code".to_string()
}
fn default_samples() -> Vec<String> {
    vec!["(+ 1 2)".to_string()]
}

/// Build a figment that layers: defaults → profile defaults → liveload.toml → LIVELOAD_* env vars.
///
/// The CLI profile takes priority over the config file profile.
///
/// Env vars use double-underscore for nesting into sections:
///   `LIVELOAD_TARGET__HOST=repl.example.org`  →  `target.host = "repl.example.org"`
///   `LIVELOAD_EXCHANGE__PACE_MS=250`  →  `exchange.pace_ms = 250`
pub fn load_config(config_path: &Path, cli_profile: Option<&Profile>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    // Pass 1: peek at profile from liveload.toml/env (CLI overrides file)
    let base = Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("LIVELOAD_").split("__"));

    let profile: Option<Profile> = cli_profile
        .cloned()
        .or_else(|| base.extract_inner("profile").ok());

    // Pass 2: rebuild with profile defaults between struct defaults and liveload.toml
    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Serialized::defaults(profile_to_file_config(profile.as_ref())))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("LIVELOAD_").split("__"))
}

fn profile_to_file_config(profile: Option<&Profile>) -> FileConfig {
    match profile {
        Some(Profile::Dev) => FileConfig {
            profile: Some(Profile::Dev),
            target: TargetFileConfig {
                host: Some("localhost:4000".to_string()),
                secure: false,
            },
            ..Default::default()
        },
        Some(Profile::Prod) => FileConfig {
            profile: Some(Profile::Prod),
            target: TargetFileConfig {
                host: None,
                secure: true,
            },
            ..Default::default()
        },
        None => FileConfig::default(),
    }
}

/// Command-line overrides, applied on top of the figment layers.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub vus: Option<usize>,
    pub duration_secs: Option<u64>,
    pub max_messages: Option<usize>,
}

impl FileConfig {
    pub fn with_overrides(mut self, overrides: &Overrides) -> Self {
        if let Some(host) = &overrides.host {
            self.target.host = Some(host.clone());
        }
        if let Some(vus) = overrides.vus {
            self.load.vus = vus;
        }
        if let Some(secs) = overrides.duration_secs {
            self.load.duration_secs = secs;
        }
        if let Some(max) = overrides.max_messages {
            self.exchange.max_messages = max;
        }
        self
    }
}

// =============================================================================
// Runtime settings (validated once, shared read-only by every virtual user)
// =============================================================================

#[derive(Clone, Debug)]
pub struct Settings {
    pub endpoint: Endpoint,
    pub vus: usize,
    /// Total run length; virtual users start no new session after it.
    pub duration: Duration,
    /// Per-session wall-clock budget.
    pub session_budget: Duration,
    pub plan: ExchangePlan,
}

impl Settings {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        let host = match fc.target.host.as_deref().map(str::trim) {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => bail!(
                "no target host configured (set [target] host, LIVELOAD_TARGET__HOST, --host or --profile dev)"
            ),
        };
        if fc.load.vus == 0 {
            bail!("load.vus must be at least 1");
        }
        if fc.exchange.samples.is_empty() {
            bail!("exchange.samples must contain at least one entry");
        }

        Ok(Self {
            endpoint: Endpoint::new(host, fc.target.secure),
            vus: fc.load.vus,
            duration: Duration::from_secs(fc.load.duration_secs),
            session_budget: Duration::from_secs(fc.load.session_secs),
            plan: ExchangePlan {
                event_name: fc.exchange.event_name.clone(),
                field: fc.exchange.field.clone(),
                samples: fc.exchange.samples.clone().into(),
                max_messages: fc.exchange.max_messages,
                pace: Duration::from_millis(fc.exchange.pace_ms),
            },
        })
    }
}
