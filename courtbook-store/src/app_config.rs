use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub booking_rules: BookingRules,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub data_dir: String,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Timestamped backup of availableSlots.json before reconciliation rewrites it
    #[serde(default = "default_true")]
    pub backups: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BookingRules {
    #[serde(default = "default_booking_expiry")]
    pub booking_expiry_seconds: i64,
    #[serde(default = "default_offer_expiry")]
    pub offer_expiry_seconds: i64,
    #[serde(default = "default_payment_window")]
    pub payment_window_seconds: i64,
    /// Prefix for reserve/decline links, e.g. `https://club.example/php`
    #[serde(default)]
    pub offer_link_base: String,
}

impl Default for BookingRules {
    fn default() -> Self {
        Self {
            booking_expiry_seconds: default_booking_expiry(),
            offer_expiry_seconds: default_offer_expiry(),
            payment_window_seconds: default_payment_window(),
            offer_link_base: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmailMode {
    #[default]
    Log,
    Http,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmailConfig {
    #[serde(default)]
    pub mode: EmailMode,
    pub endpoint: Option<String>,
    #[serde(default = "default_email_timeout")]
    pub timeout_seconds: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self { mode: EmailMode::Log, endpoint: None, timeout_seconds: default_email_timeout() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { sweep_interval_seconds: default_sweep_interval() }
    }
}

fn default_true() -> bool { true }
fn default_lock_timeout_ms() -> u64 { 5_000 }
fn default_booking_expiry() -> i64 { 40 }
fn default_offer_expiry() -> i64 { 86_400 }
fn default_payment_window() -> i64 { 86_400 }
fn default_email_timeout() -> u64 { 5 }
fn default_sweep_interval() -> u64 { 60 }

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides, optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Machine-local file, never checked in
            .add_source(config::File::with_name("config/local").required(false))
            // Eg. `COURTBOOK__STORAGE__DATA_DIR=/srv/data`
            .add_source(config::Environment::with_prefix("COURTBOOK").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = parse("[storage]\ndata_dir = \"data\"\n");
        assert_eq!(config.storage.lock_timeout_ms, 5_000);
        assert!(config.storage.backups);
        assert_eq!(config.booking_rules.booking_expiry_seconds, 40);
        assert_eq!(config.booking_rules.offer_expiry_seconds, 86_400);
        assert_eq!(config.email.mode, EmailMode::Log);
        assert_eq!(config.email.timeout_seconds, 5);
        assert_eq!(config.worker.sweep_interval_seconds, 60);
    }

    #[test]
    fn test_explicit_values_win() {
        let config = parse(
            r#"
            [storage]
            data_dir = "/srv/courtbook"
            backups = false

            [booking_rules]
            booking_expiry_seconds = 900
            offer_link_base = "https://club.example/php"

            [email]
            mode = "http"
            endpoint = "https://club.example/php/sendEmail.php"
            timeout_seconds = 3
            "#,
        );
        assert!(!config.storage.backups);
        assert_eq!(config.booking_rules.booking_expiry_seconds, 900);
        assert_eq!(config.booking_rules.offer_expiry_seconds, 86_400);
        assert_eq!(config.email.mode, EmailMode::Http);
        assert_eq!(config.email.endpoint.as_deref(), Some("https://club.example/php/sendEmail.php"));
    }
}
