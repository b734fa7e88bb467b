// vigil: Configuration support

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Service configuration
///
/// Loaded from a TOML file with `Default` fallbacks per section. Sink
/// enablement is environment-only (see [`SinkSettings::from_env`]) so that
/// credentials never live in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub auth: AuthSection,
    pub engine: EngineSection,
    pub metrics: MetricsSection,
    pub hub: HubSection,
    pub notify: NotifySection,
    #[serde(skip)]
    pub sinks: SinkSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            auth: AuthSection::default(),
            engine: EngineSection::default(),
            metrics: MetricsSection::default(),
            hub: HubSection::default(),
            notify: NotifySection::default(),
            sinks: SinkSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind_address: String,
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            shutdown_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub jwt_secret: String,
    pub token_ttl_minutes: i64,
    pub admin_username: String,
    pub admin_password: String,
    pub admin_email: String,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_ttl_minutes: 480,
            admin_username: "admin".to_string(),
            admin_password: String::new(),
            admin_email: "admin@localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub eval_interval_secs: u64,
    /// Gap a resolved alert must stay quiet before it may fire again
    pub resolve_quiescence_secs: u64,
    pub maintenance: Vec<MaintenanceSection>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            eval_interval_secs: 30,
            resolve_quiescence_secs: 300,
            maintenance: Vec::new(),
        }
    }
}

/// Maintenance window as configured (RFC 3339 bounds)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceSection {
    pub start: String,
    pub end: String,
    pub reason: Option<String>,
}

impl MaintenanceSection {
    pub fn parse(&self) -> CoreResult<(chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>)> {
        let start = chrono::DateTime::parse_from_rfc3339(&self.start)
            .map_err(|e| CoreError::InvalidInput(format!("maintenance start: {}", e)))?
            .with_timezone(&chrono::Utc);
        let end = chrono::DateTime::parse_from_rfc3339(&self.end)
            .map_err(|e| CoreError::InvalidInput(format!("maintenance end: {}", e)))?
            .with_timezone(&chrono::Utc);
        if end <= start {
            return Err(CoreError::InvalidInput(
                "maintenance window end must be after start".to_string(),
            ));
        }
        Ok((start, end))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub ring_capacity: usize,
    pub process_sample_interval_secs: u64,
    pub custom_sample_interval_secs: u64,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            ring_capacity: 1000,
            process_sample_interval_secs: 15,
            custom_sample_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSection {
    pub queue_capacity: usize,
    pub ping_interval_secs: u64,
    pub max_slow_misses: u32,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            ping_interval_secs: 30,
            max_slow_misses: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySection {
    /// Worker pool size; defaults to enabled sinks x 2
    pub workers: Option<usize>,
    pub http_timeout_secs: u64,
    pub retry: RetrySection,
    pub routes: Vec<RouteSection>,
}

impl Default for NotifySection {
    fn default() -> Self {
        Self {
            workers: None,
            http_timeout_secs: 15,
            retry: RetrySection::default(),
            routes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// "exponential" or "linear"
    pub mode: String,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            mode: "exponential".to_string(),
        }
    }
}

/// Channel routing rule as configured
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSection {
    pub event_type: String,
    pub severity: Option<String>,
    pub team_id: String,
    pub channel_id: String,
}

/// Sink enablement, read from the environment
#[derive(Debug, Clone, Default)]
pub struct SinkSettings {
    pub chat: Option<ChatSettings>,
    pub discord: Option<DiscordSettings>,
    pub email: Option<SmtpSettings>,
    pub teams: Option<TeamsSettings>,
}

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub webhook_url: String,
    pub channel: Option<String>,
    pub username: Option<String>,
    pub icon_emoji: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DiscordSettings {
    pub webhook_url: String,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub recipients: Vec<String>,
    pub tls: bool,
}

#[derive(Debug, Clone)]
pub struct TeamsSettings {
    pub webhook_url: Option<String>,
    pub graph: Option<GraphSettings>,
    /// Per-severity (team, channel) overrides, keyed by lowercase severity
    pub severity_channels: HashMap<String, (String, String)>,
}

#[derive(Debug, Clone)]
pub struct GraphSettings {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub default_team: String,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl SinkSettings {
    /// Read sink enablement from VIGIL_* environment variables
    pub fn from_env() -> Self {
        let chat = env_var("VIGIL_CHAT_WEBHOOK_URL").map(|webhook_url| ChatSettings {
            webhook_url,
            channel: env_var("VIGIL_CHAT_CHANNEL"),
            username: env_var("VIGIL_CHAT_USERNAME"),
            icon_emoji: env_var("VIGIL_CHAT_ICON_EMOJI"),
        });

        let discord = env_var("VIGIL_DISCORD_WEBHOOK_URL").map(|webhook_url| DiscordSettings {
            webhook_url,
            username: env_var("VIGIL_DISCORD_USERNAME"),
            avatar_url: env_var("VIGIL_DISCORD_AVATAR_URL"),
        });

        let email = env_var("VIGIL_SMTP_HOST").map(|host| SmtpSettings {
            host,
            port: env_var("VIGIL_SMTP_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(587),
            username: env_var("VIGIL_SMTP_USERNAME"),
            password: env_var("VIGIL_SMTP_PASSWORD"),
            from: env_var("VIGIL_SMTP_FROM").unwrap_or_else(|| "vigil@localhost".to_string()),
            recipients: env_var("VIGIL_SMTP_RECIPIENTS")
                .map(|r| {
                    r.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            tls: env_var("VIGIL_SMTP_TLS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        });

        let graph = match (
            env_var("VIGIL_TEAMS_TENANT_ID"),
            env_var("VIGIL_TEAMS_CLIENT_ID"),
            env_var("VIGIL_TEAMS_CLIENT_SECRET"),
            env_var("VIGIL_TEAMS_DEFAULT_TEAM"),
        ) {
            (Some(tenant_id), Some(client_id), Some(client_secret), Some(default_team)) => {
                Some(GraphSettings {
                    tenant_id,
                    client_id,
                    client_secret,
                    default_team,
                })
            }
            _ => None,
        };

        let teams_webhook = env_var("VIGIL_TEAMS_WEBHOOK_URL");
        let teams = if teams_webhook.is_some() || graph.is_some() {
            let mut severity_channels = HashMap::new();
            for sev in ["critical", "high", "medium", "low", "info"] {
                let upper = sev.to_uppercase();
                if let (Some(team), Some(channel)) = (
                    env_var(&format!("VIGIL_TEAMS_{}_TEAM", upper)),
                    env_var(&format!("VIGIL_TEAMS_{}_CHANNEL", upper)),
                ) {
                    severity_channels.insert(sev.to_string(), (team, channel));
                }
            }
            Some(TeamsSettings {
                webhook_url: teams_webhook,
                graph,
                severity_channels,
            })
        } else {
            None
        };

        Self {
            chat,
            discord,
            email,
            teams,
        }
    }
}

impl Config {
    /// Load config from TOML file, then overlay environment sink settings
    pub fn from_file(path: &str) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::InvalidInput(format!("Failed to read config file {}: {}", path, e))
        })?;

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| CoreError::InvalidInput(format!("Failed to parse config file: {}", e)))?;
        config.sinks = SinkSettings::from_env();
        Ok(config)
    }

    /// Default config with environment sink settings applied
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.sinks = SinkSettings::from_env();
        config
    }
}
