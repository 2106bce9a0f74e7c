//! Configuration types.
//!
//! A single JSON file holds one or more named profiles. The selected
//! profile is resolved once at startup into a [`Profile`] value that is
//! handed to each component's constructor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;

/// Default config location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/config.json";

/// Profile name used when the file has no `profiles` map.
pub const DEFAULT_PROFILE: &str = "default";

/// On-disk layout when the file carries a profile map.
#[derive(Debug, Deserialize)]
struct ProfileFile {
    #[serde(default)]
    default_profile: Option<String>,
    profiles: BTreeMap<String, Profile>,
}

/// All profiles loaded from a config file.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub default_profile: String,
    pub profiles: BTreeMap<String, Profile>,
    /// Directory that relative paths in the file are resolved against.
    pub base_dir: PathBuf,
}

impl AppConfig {
    /// Load and parse a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_json(&raw, base_dir)
    }

    /// Parse config JSON. `base_dir` anchors relative paths.
    pub fn from_json(raw: &str, base_dir: PathBuf) -> Result<Self, ConfigError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let (default_profile, profiles) = if value.get("profiles").is_some() {
            let file: ProfileFile = serde_json::from_value(value)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?;
            let default = file
                .default_profile
                .or_else(|| file.profiles.keys().next().cloned())
                .unwrap_or_else(|| DEFAULT_PROFILE.to_string());
            (default, file.profiles)
        } else {
            let profile: Profile = serde_json::from_value(value)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?;
            let mut map = BTreeMap::new();
            map.insert(DEFAULT_PROFILE.to_string(), profile);
            (DEFAULT_PROFILE.to_string(), map)
        };

        Ok(Self {
            default_profile,
            profiles,
            base_dir,
        })
    }

    /// Resolve a profile by name (or the default), validate it and anchor
    /// its relative paths.
    pub fn profile(&self, name: Option<&str>) -> Result<Profile, ConfigError> {
        let name = name.unwrap_or(&self.default_profile);
        let mut profile =
            self.profiles
                .get(name)
                .cloned()
                .ok_or_else(|| ConfigError::UnknownProfile {
                    name: name.to_string(),
                    available: self.profiles.keys().cloned().collect::<Vec<_>>().join(", "),
                })?;
        profile.name = name.to_string();
        profile.anchor_paths(&self.base_dir);
        profile.validate()?;
        Ok(profile)
    }
}

/// One deployment's settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Filled in from the profile map key.
    #[serde(skip)]
    pub name: String,
    /// Heading used in rendered digests, e.g. "School Email Digest".
    pub title: Option<String>,
    pub mail: MailSettings,
    pub ai: AiSettings,
    pub processing: ProcessingSettings,
    pub output: OutputSettings,
    pub database: DatabaseSettings,
    pub tracking: TrackingSettings,
    pub logging: LoggingSettings,
    pub email: EmailSettings,
    pub prompts: PromptSettings,
}

impl Profile {
    /// Startup validation. Anything reported here is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mail.label.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "mail.label".into(),
                hint: "Set the mailbox label to digest".into(),
            });
        }
        if self.mail.lookback_hours == 0 {
            return Err(ConfigError::InvalidValue {
                key: "mail.lookback_hours".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.mail.source == MailSourceKind::Eml && self.mail.eml_dir.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "mail.eml_dir".into(),
                hint: "The eml source needs a directory of .eml files".into(),
            });
        }
        if self.email.send_digest && self.email.recipient.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "email.recipient".into(),
                hint: "send_digest is enabled but no recipient is configured".into(),
            });
        }
        if self.ai.model.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "ai.model".into(),
                hint: "Name the model to use".into(),
            });
        }
        Ok(())
    }

    /// Read the AI API key from the configured environment variable.
    pub fn api_key(&self) -> Result<SecretString, ConfigError> {
        secret_from_env(&self.ai.api_key_env)
    }

    /// Read the mail access token from the configured environment variable.
    pub fn mail_token(&self) -> Result<SecretString, ConfigError> {
        secret_from_env(&self.mail.access_token_env)
    }

    /// Digest heading, e.g. "Email Digest".
    pub fn title(&self) -> &str {
        self.title.as_deref().unwrap_or("Email Digest")
    }

    fn anchor_paths(&mut self, base: &Path) {
        anchor(&mut self.database.path, base);
        anchor(&mut self.output.directory, base);
        if let Some(file) = self.logging.file.as_mut() {
            anchor(file, base);
        }
        if let Some(dir) = self.mail.eml_dir.as_mut() {
            anchor(dir, base);
        }
    }
}

fn anchor(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn secret_from_env(var: &str) -> Result<SecretString, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(SecretString::from(value)),
        _ => Err(ConfigError::MissingEnvVar(var.to_string())),
    }
}

// ── Sections ────────────────────────────────────────────────────────

/// Which mail collaborator to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailSourceKind {
    #[default]
    Gmail,
    Eml,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MailSettings {
    pub source: MailSourceKind,
    pub label: String,
    pub lookback_hours: u32,
    /// Env var holding a Gmail OAuth access token.
    pub access_token_env: String,
    /// Directory of `.eml` files for the offline source.
    pub eml_dir: Option<PathBuf>,
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            source: MailSourceKind::Gmail,
            label: String::new(),
            lookback_hours: 24,
            access_token_env: "GMAIL_ACCESS_TOKEN".into(),
            eml_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    pub model: String,
    pub api_key_env: String,
    pub max_tokens: u32,
    pub digest_max_tokens: u32,
    pub temperature: f32,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".into(),
            api_key_env: "ANTHROPIC_API_KEY".into(),
            max_tokens: 3000,
            digest_max_tokens: 4000,
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingSettings {
    pub max_image_size_mb: f64,
    pub min_image_width: u32,
    pub min_image_height: u32,
    pub process_pdfs: bool,
    pub max_pdf_chars: usize,
    /// Hard cap on serialized per-message records fed to consolidation.
    pub digest_input_budget_chars: usize,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            max_image_size_mb: 5.0,
            min_image_width: 100,
            min_image_height: 100,
            process_pdfs: true,
            max_pdf_chars: 10_000,
            digest_input_budget_chars: 15_000,
        }
    }
}

impl ProcessingSettings {
    pub fn max_image_bytes(&self) -> usize {
        (self.max_image_size_mb * 1024.0 * 1024.0) as usize
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub directory: PathBuf,
    /// `{date}` is replaced with the run date (`%Y-%m-%d`).
    pub filename_pattern: String,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("output"),
            filename_pattern: "digest_{date}.md".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/tracking.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    pub retention_days: u32,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub file: Option<PathBuf>,
    pub console_output: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: None,
            console_output: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmailSettings {
    pub send_digest: bool,
    pub recipient: Option<String>,
    /// `{date}` is replaced with the long-form run date.
    pub subject_pattern: String,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            send_digest: false,
            recipient: None,
            subject_pattern: "Email Digest - {date}".into(),
        }
    }
}

/// Profile-specific prompt templates. Absent entries use built-in defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PromptSettings {
    pub email_user_template: Option<String>,
    pub image_instruction: Option<String>,
    pub pdf_instruction: Option<String>,
    pub digest_prompt_template: Option<String>,
}
