use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::user::UserClass;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub scenario: ScenarioConfig,
    pub ramp: RampConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub reference: ReferenceConfig,
    pub users: Vec<UserMix>,
    pub worker: WorkerConfig,
    /// Directory of the file this config was loaded from; relative paths resolve against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ramp.steps.is_empty() {
            anyhow::bail!("ramp.steps must contain at least one step");
        }
        if self.users.is_empty() {
            anyhow::bail!("at least one [[users]] entry is required");
        }
        if self.users.iter().all(|u| u.weight == 0) {
            anyhow::bail!("at least one [[users]] entry needs a non-zero weight");
        }
        if self.reference.max_attempts == 0 {
            anyhow::bail!("reference.max_attempts must be at least 1");
        }
        Ok(())
    }

    /// Credential file path, resolved against the config file's directory when relative.
    pub fn credentials_path(&self) -> PathBuf {
        if self.credentials.file.is_absolute() {
            self.credentials.file.clone()
        } else {
            self.base_dir.join(&self.credentials.file)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Deterministic seed for per-user random streams
    pub seed: u64,
    /// Optional global duration cap in milliseconds
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampStep {
    /// Target number of concurrent simulated users
    pub users: u32,
    /// Duration to hold this population in milliseconds
    pub hold_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampConfig {
    pub steps: Vec<RampStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Base URL of the application under test
    pub base_url: String,
    /// Request timeout in milliseconds
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// File with one cookie string per line
    #[serde(default = "default_credentials_file")]
    pub file: PathBuf,
    /// Environment variable consulted when the file yields nothing
    #[serde(default = "default_credentials_env")]
    pub env_var: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            file: default_credentials_file(),
            env_var: default_credentials_env(),
        }
    }
}

fn default_credentials_file() -> PathBuf {
    PathBuf::from("sessions.txt")
}

fn default_credentials_env() -> String {
    "SESSION_JWT".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceConfig {
    /// Items requested from each listing endpoint (clamped to 1..=10)
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Failed fetch attempts before a cache kind gives up for the run
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_page_size() -> u32 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMix {
    pub class: UserClass,
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker identifier for logs and results
    pub id: String,
    /// Simulated users started per second while ramping up
    #[serde(default = "default_hatch_rate")]
    pub hatch_rate: u32,
}

fn default_hatch_rate() -> u32 {
    10
}
