use crate::errors::ListenerError;
use failure::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub listener: ListenerSection,
    pub tools: ToolsSection,
    pub paths: PathsSection,
    pub build: BuildSection,
    pub upload: UploadSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ListenerSection {
    pub subscription: String,
    pub completion_topic: String,
    pub stop_file: PathBuf,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_true")]
    pub encode_completion_base64: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ToolsSection {
    #[serde(default = "default_git")]
    pub git: String,
    #[serde(default = "default_gcloud")]
    pub gcloud: String,
    #[serde(default = "default_gsutil")]
    pub gsutil: String,
    pub unity: PathBuf,
}

#[derive(Deserialize, Debug, Clone)]
pub struct PathsSection {
    pub repo: PathBuf,
    pub project: PathBuf,
    pub build_output: PathBuf,
    pub log_folder: PathBuf,
    pub unity_log_file: PathBuf,
}

#[derive(Deserialize, Debug, Clone)]
pub struct BuildSection {
    pub game_method: String,
    pub asset_bundle_method: String,
    pub executable_name: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct UploadSection {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub mode: UploadMode,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    Archive,
    Copy,
}

impl Default for UploadMode {
    fn default() -> UploadMode {
        UploadMode::Archive
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct TimeoutsSection {
    #[serde(default = "default_git_secs")]
    pub git_secs: u64,
    #[serde(default = "default_unity_secs")]
    pub unity_secs: u64,
    #[serde(default = "default_upload_secs")]
    pub upload_secs: u64,
    #[serde(default = "default_pubsub_secs")]
    pub pubsub_secs: u64,
}

impl Default for TimeoutsSection {
    fn default() -> TimeoutsSection {
        TimeoutsSection {
            git_secs: default_git_secs(),
            unity_secs: default_unity_secs(),
            upload_secs: default_upload_secs(),
            pubsub_secs: default_pubsub_secs(),
        }
    }
}

impl TimeoutsSection {
    pub fn git(&self) -> Duration {
        Duration::from_secs(self.git_secs)
    }
    pub fn unity(&self) -> Duration {
        Duration::from_secs(self.unity_secs)
    }
    pub fn upload(&self) -> Duration {
        Duration::from_secs(self.upload_secs)
    }
    pub fn pubsub(&self) -> Duration {
        Duration::from_secs(self.pubsub_secs)
    }
}

fn default_poll_interval() -> u64 {
    10
}
fn default_true() -> bool {
    true
}
fn default_git() -> String {
    "git".to_string()
}
fn default_gcloud() -> String {
    "gcloud".to_string()
}
fn default_gsutil() -> String {
    "gsutil".to_string()
}
fn default_git_secs() -> u64 {
    10 * 60
}
fn default_unity_secs() -> u64 {
    2 * 60 * 60
}
fn default_upload_secs() -> u64 {
    30 * 60
}
fn default_pubsub_secs() -> u64 {
    60
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, Error> {
        let contents = fs::read_to_string(path).map_err(|e| ListenerError::Configuration {
            reason: format!("unable to read config file {}: {}", path.display(), e),
        })?;
        Config::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Config, Error> {
        toml::from_str::<Config>(contents).map_err(|e| {
            ListenerError::Configuration {
                reason: format!("invalid config file: {}", e),
            }
            .into()
        })
    }

    /// The config.toml that build.rs drops next to the executable.
    pub fn default_path() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("config.toml")))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Startup checks for things the listener can't run without. Everything
    /// wrong is reported at once rather than one problem per restart.
    pub fn validate(&self) -> Result<(), ListenerError> {
        let mut problems = Vec::new();

        if self.listener.subscription.trim().is_empty() {
            problems.push("listener.subscription is empty".to_string());
        }
        if self.listener.completion_topic.trim().is_empty() {
            problems.push("listener.completion_topic is empty".to_string());
        }
        if self.upload.bucket.trim().is_empty() {
            problems.push("upload.bucket is empty".to_string());
        }
        if !self.tools.unity.is_file() {
            problems.push(format!("Unity executable not found at {}", self.tools.unity.display()));
        }
        if !self.paths.repo.is_dir() {
            problems.push(format!("repository folder not found at {}", self.paths.repo.display()));
        }
        if !self.paths.project.is_dir() {
            problems.push(format!("Unity project folder not found at {}", self.paths.project.display()));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ListenerError::Configuration {
                reason: problems.join("; "),
            })
        }
    }
}
