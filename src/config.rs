//! Configuration loading and validation.

use crate::error::{ConfigError, Result};

use arc_swap::ArcSwap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tara configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Instance directory (config file, persona file, logs).
    pub instance_dir: PathBuf,

    /// LLM provider configuration.
    pub llm: LlmConfig,

    /// Persona and conversation settings.
    pub agent: AgentConfig,

    /// Inbound message coalescing.
    pub coalesce: CoalesceConfig,

    /// Outbound reply pacing.
    pub delivery: DeliveryConfig,

    /// Messaging adapter settings.
    pub messaging: MessagingConfig,
}

/// LLM provider configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Gemini API key (from env or config file).
    pub api_key: Option<String>,

    /// Model id, e.g. `gemini-2.0-flash-lite`.
    pub model: String,

    /// API base URL.
    pub base_url: String,

    /// Sampling temperature. Provider default when unset.
    pub temperature: Option<f32>,

    /// Per-request timeout.
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.into(),
            base_url: DEFAULT_LLM_BASE_URL.into(),
            temperature: None,
            timeout_secs: 60,
        }
    }
}

const DEFAULT_MODEL: &str = "gemini-2.0-flash-lite";
const DEFAULT_LLM_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Persona and conversation settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Display name of the assistant.
    pub name: String,

    /// System persona text.
    pub persona: String,

    /// Number of previous exchanges replayed to the model per session.
    pub history_turns: usize,

    /// Reply to the Telegram `/start` command.
    pub greeting: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Tara".into(),
            persona: DEFAULT_PERSONA.into(),
            history_turns: 3,
            greeting: "Hi! I am your financial agent, Tara. How can I help you today?".into(),
        }
    }
}

const DEFAULT_PERSONA: &str = "\
You are Tara, a friendly financial guide for young Indians (22-35).

- Be warm, approachable and non-judgmental.
- Reply in the user's language: English, Hinglish or Hindi.
- Always address the user's actual question.
- Never give direct investment advice.
- Break complex topics into short messages separated by blank lines.
- End with a follow-up question that helps you personalize the next answer.
- When the user sends an image, audio clip, video or document, work from its content.";

/// Inbound coalescing configuration.
///
/// Messages from one user arriving closer together than the quiet period are
/// merged into a single turn.
#[derive(Debug, Clone, Copy)]
pub struct CoalesceConfig {
    /// Quiet period after the latest message before flushing (milliseconds).
    pub quiet_period_ms: u64,
}

impl CoalesceConfig {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: 2500,
        }
    }
}

/// Outbound delivery configuration.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryConfig {
    /// Delay between consecutive reply fragments (milliseconds).
    pub pacing_ms: u64,
}

impl DeliveryConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self { pacing_ms: 300 }
    }
}

/// Messaging adapter settings.
#[derive(Debug, Clone)]
pub struct MessagingConfig {
    pub terminal: TerminalConfig,
    pub telegram: Option<TelegramConfig>,
    pub whatsapp: Option<WhatsAppConfig>,
    /// Attachments larger than this are skipped.
    pub max_attachment_bytes: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            terminal: TerminalConfig::default(),
            telegram: None,
            whatsapp: None,
            max_attachment_bytes: 20 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TerminalConfig {
    pub max_message_length: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            max_message_length: 4096,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub token: String,
    /// When non-empty, only these Telegram user ids are served.
    pub allowed_users: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub access_token: String,
    pub phone_number_id: String,
    pub verify_token: String,
    /// App secret for `X-Hub-Signature-256` verification. Unchecked when unset.
    pub app_secret: Option<String>,
    pub api_version: String,
    /// Graph API origin, e.g. `https://graph.facebook.com`.
    pub graph_base_url: String,
    pub bind: String,
    pub port: u16,
}

/// Settings that can be swapped while the process runs.
#[derive(Debug)]
pub struct RuntimeConfig {
    pub coalesce: ArcSwap<CoalesceConfig>,
    pub delivery: ArcSwap<DeliveryConfig>,
}

impl RuntimeConfig {
    pub fn new(config: &Config) -> Self {
        Self {
            coalesce: ArcSwap::from_pointee(config.coalesce),
            delivery: ArcSwap::from_pointee(config.delivery),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            coalesce: ArcSwap::from_pointee(CoalesceConfig::default()),
            delivery: ArcSwap::from_pointee(DeliveryConfig::default()),
        }
    }
}

// -- TOML deserialization types --

#[derive(Deserialize, Default)]
struct TomlConfig {
    #[serde(default)]
    llm: TomlLlmConfig,
    #[serde(default)]
    agent: TomlAgentConfig,
    coalesce: Option<TomlCoalesceConfig>,
    delivery: Option<TomlDeliveryConfig>,
    #[serde(default)]
    messaging: TomlMessagingConfig,
}

#[derive(Deserialize, Default)]
struct TomlLlmConfig {
    api_key: Option<String>,
    model: Option<String>,
    base_url: Option<String>,
    temperature: Option<f32>,
    timeout_secs: Option<u64>,
}

#[derive(Deserialize, Default)]
struct TomlAgentConfig {
    name: Option<String>,
    persona: Option<String>,
    persona_file: Option<String>,
    history_turns: Option<usize>,
    greeting: Option<String>,
}

#[derive(Deserialize)]
struct TomlCoalesceConfig {
    quiet_period_ms: Option<u64>,
}

#[derive(Deserialize)]
struct TomlDeliveryConfig {
    pacing_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct TomlMessagingConfig {
    terminal: Option<TomlTerminalConfig>,
    telegram: Option<TomlTelegramConfig>,
    whatsapp: Option<TomlWhatsAppConfig>,
    max_attachment_bytes: Option<usize>,
}

#[derive(Deserialize)]
struct TomlTerminalConfig {
    max_message_length: Option<usize>,
}

#[derive(Deserialize)]
struct TomlTelegramConfig {
    #[serde(default = "default_enabled")]
    enabled: bool,
    token: Option<String>,
    #[serde(default)]
    allowed_users: Vec<i64>,
}

#[derive(Deserialize)]
struct TomlWhatsAppConfig {
    #[serde(default = "default_enabled")]
    enabled: bool,
    access_token: Option<String>,
    phone_number_id: Option<String>,
    verify_token: Option<String>,
    app_secret: Option<String>,
    #[serde(default = "default_whatsapp_api_version")]
    api_version: String,
    #[serde(default = "default_graph_base_url")]
    graph_base_url: String,
    #[serde(default = "default_whatsapp_bind")]
    bind: String,
    #[serde(default = "default_whatsapp_port")]
    port: u16,
}

fn default_enabled() -> bool {
    true
}
fn default_whatsapp_api_version() -> String {
    "v18.0".into()
}
fn default_graph_base_url() -> String {
    "https://graph.facebook.com".into()
}
fn default_whatsapp_bind() -> String {
    "0.0.0.0".into()
}
fn default_whatsapp_port() -> u16 {
    8000
}

/// Resolve a value that might be an "env:VAR_NAME" reference.
fn resolve_env_value(value: &str) -> Option<String> {
    if let Some(var_name) = value.strip_prefix("env:") {
        std::env::var(var_name).ok()
    } else {
        Some(value.to_string())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

impl Config {
    /// Resolve the instance directory from env or default (~/.tara).
    pub fn default_instance_dir() -> PathBuf {
        std::env::var("TARA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|d| d.join(".tara"))
                    .unwrap_or_else(|| PathBuf::from("./.tara"))
            })
    }

    /// Load configuration from the default config file, falling back to env vars.
    pub fn load() -> Result<Self> {
        let instance_dir = Self::default_instance_dir();

        let config_path = instance_dir.join("config.toml");
        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::load_from_env(&instance_dir)
        }
    }

    /// Load from a specific TOML config file.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let instance_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let content = std::fs::read_to_string(path).map_err(|error| ConfigError::Load {
            path: path.display().to_string(),
            source: error.into(),
        })?;

        let toml_config: TomlConfig =
            toml::from_str(&content).map_err(|error| ConfigError::Parse {
                path: path.display().to_string(),
                reason: error.to_string(),
            })?;

        Self::from_toml(toml_config, instance_dir)
    }

    /// Load from environment variables only (no config file).
    pub fn load_from_env(instance_dir: &Path) -> Result<Self> {
        let llm = LlmConfig {
            api_key: env_var("GOOGLE_API_KEY").or_else(|| env_var("GEMINI_API_KEY")),
            model: env_var("TARA_MODEL").unwrap_or_else(|| DEFAULT_MODEL.into()),
            ..LlmConfig::default()
        };

        let telegram = env_var("TELEGRAM_BOT_TOKEN").map(|token| TelegramConfig {
            token,
            allowed_users: Vec::new(),
        });

        let whatsapp = match (
            env_var("WHATSAPP_TOKEN"),
            env_var("WHATSAPP_PHONE_NUMBER_ID"),
        ) {
            (Some(access_token), Some(phone_number_id)) => Some(WhatsAppConfig {
                access_token,
                phone_number_id,
                verify_token: env_var("WHATSAPP_VERIFY_TOKEN")
                    .ok_or_else(|| ConfigError::MissingKey("WHATSAPP_VERIFY_TOKEN".into()))?,
                app_secret: env_var("WHATSAPP_APP_SECRET"),
                api_version: env_var("WHATSAPP_API_VERSION")
                    .unwrap_or_else(default_whatsapp_api_version),
                graph_base_url: default_graph_base_url(),
                bind: default_whatsapp_bind(),
                port: default_whatsapp_port(),
            }),
            _ => None,
        };

        Ok(Self {
            instance_dir: instance_dir.to_path_buf(),
            llm,
            agent: AgentConfig::default(),
            coalesce: CoalesceConfig::default(),
            delivery: DeliveryConfig::default(),
            messaging: MessagingConfig {
                telegram,
                whatsapp,
                ..MessagingConfig::default()
            },
        })
    }

    /// Parse a TOML string as if it were read from `instance_dir/config.toml`.
    pub fn from_toml_str(content: &str, instance_dir: &Path) -> Result<Self> {
        let toml_config: TomlConfig =
            toml::from_str(content).map_err(|error| ConfigError::Parse {
                path: instance_dir.join("config.toml").display().to_string(),
                reason: error.to_string(),
            })?;
        Self::from_toml(toml_config, instance_dir.to_path_buf())
    }

    fn from_toml(toml: TomlConfig, instance_dir: PathBuf) -> Result<Self> {
        let base_llm = LlmConfig::default();
        let llm = LlmConfig {
            api_key: toml
                .llm
                .api_key
                .as_deref()
                .and_then(resolve_env_value)
                .or_else(|| env_var("GOOGLE_API_KEY"))
                .or_else(|| env_var("GEMINI_API_KEY")),
            model: toml.llm.model.unwrap_or(base_llm.model),
            base_url: toml.llm.base_url.unwrap_or(base_llm.base_url),
            temperature: toml.llm.temperature,
            timeout_secs: toml.llm.timeout_secs.unwrap_or(base_llm.timeout_secs),
        };

        let base_agent = AgentConfig::default();
        let persona = match (toml.agent.persona, toml.agent.persona_file) {
            (Some(persona), _) => persona,
            (None, Some(file)) => {
                let path = instance_dir.join(file);
                std::fs::read_to_string(&path).map_err(|error| ConfigError::Load {
                    path: path.display().to_string(),
                    source: error.into(),
                })?
            }
            (None, None) => base_agent.persona,
        };
        let agent = AgentConfig {
            name: toml.agent.name.unwrap_or(base_agent.name),
            persona,
            history_turns: toml
                .agent
                .history_turns
                .unwrap_or(base_agent.history_turns),
            greeting: toml.agent.greeting.unwrap_or(base_agent.greeting),
        };

        let base_coalesce = CoalesceConfig::default();
        let coalesce = toml
            .coalesce
            .map(|c| CoalesceConfig {
                quiet_period_ms: c.quiet_period_ms.unwrap_or(base_coalesce.quiet_period_ms),
            })
            .unwrap_or(base_coalesce);

        let base_delivery = DeliveryConfig::default();
        let delivery = toml
            .delivery
            .map(|d| DeliveryConfig {
                pacing_ms: d.pacing_ms.unwrap_or(base_delivery.pacing_ms),
            })
            .unwrap_or(base_delivery);

        let base_messaging = MessagingConfig::default();
        let terminal = toml
            .messaging
            .terminal
            .map(|t| TerminalConfig {
                max_message_length: t
                    .max_message_length
                    .unwrap_or(base_messaging.terminal.max_message_length),
            })
            .unwrap_or(base_messaging.terminal);

        let telegram = toml
            .messaging
            .telegram
            .filter(|t| t.enabled)
            .and_then(|t| {
                let token = t.token.as_deref().and_then(resolve_env_value)?;
                Some(TelegramConfig {
                    token,
                    allowed_users: t.allowed_users,
                })
            });

        let whatsapp = match toml.messaging.whatsapp.filter(|w| w.enabled) {
            Some(w) => {
                let access_token = w.access_token.as_deref().and_then(resolve_env_value);
                let phone_number_id = w.phone_number_id.as_deref().and_then(resolve_env_value);
                match (access_token, phone_number_id) {
                    (Some(access_token), Some(phone_number_id)) => Some(WhatsAppConfig {
                        access_token,
                        phone_number_id,
                        verify_token: w
                            .verify_token
                            .as_deref()
                            .and_then(resolve_env_value)
                            .ok_or_else(|| {
                                ConfigError::MissingKey("messaging.whatsapp.verify_token".into())
                            })?,
                        app_secret: w.app_secret.as_deref().and_then(resolve_env_value),
                        api_version: w.api_version,
                        graph_base_url: w.graph_base_url,
                        bind: w.bind,
                        port: w.port,
                    }),
                    _ => None,
                }
            }
            None => None,
        };

        if agent.history_turns > 50 {
            return Err(ConfigError::Invalid(format!(
                "agent.history_turns must be at most 50, got {}",
                agent.history_turns
            ))
            .into());
        }

        Ok(Self {
            instance_dir,
            llm,
            agent,
            coalesce,
            delivery,
            messaging: MessagingConfig {
                terminal,
                telegram,
                whatsapp,
                max_attachment_bytes: toml
                    .messaging
                    .max_attachment_bytes
                    .unwrap_or(base_messaging.max_attachment_bytes),
            },
        })
    }

    /// Directory for log files.
    pub fn log_dir(&self) -> PathBuf {
        self.instance_dir.join("logs")
    }
}
