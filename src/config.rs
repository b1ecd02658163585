use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_CURRENCY: &str = "SGD";
const CONFIG_DIR: &str = "config";

/// Discount and loyalty knobs read by the pricing engine
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PricingSettings {
    /// Currency value of one loyalty point
    #[serde(default = "default_point_value")]
    pub loyalty_point_value: Decimal,

    /// Maximum share (percent) of the pre-loyalty total payable with points
    #[serde(default = "default_max_redemption_percent")]
    pub loyalty_max_redemption_percent: Decimal,

    /// Points earned per currency unit of the final total
    #[serde(default = "default_earn_rate")]
    pub loyalty_earn_rate: Decimal,

    /// Keywords of the boot-time promotion
    #[serde(default = "default_promotion_keywords")]
    pub promotion_keywords: Vec<String>,

    /// Percent of the boot-time promotion
    #[serde(default = "default_promotion_percent")]
    pub promotion_percent: Decimal,
}

impl Default for PricingSettings {
    fn default() -> Self {
        Self {
            loyalty_point_value: default_point_value(),
            loyalty_max_redemption_percent: default_max_redemption_percent(),
            loyalty_earn_rate: default_earn_rate(),
            promotion_keywords: default_promotion_keywords(),
            promotion_percent: default_promotion_percent(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefundSettings {
    /// Minutes after purchase confirmation during which refunds may be requested
    #[serde(default = "default_refund_window_minutes")]
    pub window_minutes: i64,
    /// Requests within the velocity window that trigger auto-flagging
    #[serde(default = "default_refund_velocity_max")]
    pub velocity_max_requests: u64,
    #[serde(default = "default_refund_velocity_hours")]
    pub velocity_window_hours: i64,
    /// Length of the account-level refund suspension
    #[serde(default = "default_refund_suspension_minutes")]
    pub suspension_minutes: i64,
}

impl Default for RefundSettings {
    fn default() -> Self {
        Self {
            window_minutes: default_refund_window_minutes(),
            velocity_max_requests: default_refund_velocity_max(),
            velocity_window_hours: default_refund_velocity_hours(),
            suspension_minutes: default_refund_suspension_minutes(),
        }
    }
}

/// Thresholds of the fraud velocity rules
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FraudSettings {
    #[serde(default = "default_payment_burst_count")]
    pub payment_burst_count: u64,
    #[serde(default = "default_payment_burst_window_secs")]
    pub payment_burst_window_secs: i64,
    #[serde(default = "default_refund_burst_count")]
    pub refund_burst_count: u64,
    #[serde(default = "default_refund_burst_window_secs")]
    pub refund_burst_window_secs: i64,
    #[serde(default = "default_refund_ratio_window_days")]
    pub refund_ratio_window_days: i64,
    #[serde(default = "default_refund_ratio_threshold")]
    pub refund_ratio_threshold: Decimal,
    #[serde(default = "default_topup_refund_window_secs")]
    pub topup_refund_window_secs: i64,
    #[serde(default = "default_order_spike_multiplier")]
    pub order_spike_multiplier: Decimal,
    #[serde(default = "default_order_spike_min_history")]
    pub order_spike_min_history: usize,
}

impl Default for FraudSettings {
    fn default() -> Self {
        Self {
            payment_burst_count: default_payment_burst_count(),
            payment_burst_window_secs: default_payment_burst_window_secs(),
            refund_burst_count: default_refund_burst_count(),
            refund_burst_window_secs: default_refund_burst_window_secs(),
            refund_ratio_window_days: default_refund_ratio_window_days(),
            refund_ratio_threshold: default_refund_ratio_threshold(),
            topup_refund_window_secs: default_topup_refund_window_secs(),
            order_spike_multiplier: default_order_spike_multiplier(),
            order_spike_min_history: default_order_spike_min_history(),
        }
    }
}

/// Hosted-redirect (PayPal REST) gateway
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaypalSettings {
    #[serde(default = "default_paypal_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_gateway_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PaypalSettings {
    fn default() -> Self {
        Self {
            base_url: default_paypal_base_url(),
            client_id: String::new(),
            client_secret: String::new(),
            timeout_secs: default_gateway_timeout_secs(),
        }
    }
}

/// QR (NETS) gateway
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetsSettings {
    #[serde(default = "default_nets_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub project_id: String,
    /// Merchant prefix for generated transaction ids
    #[serde(default = "default_nets_txn_id_prefix")]
    pub txn_id_prefix: String,
    /// Public base URL the gateway pushes status payloads to
    #[serde(default)]
    pub webhook_base_url: Option<String>,
    /// HMAC secret for push payloads; unsigned pushes are accepted when absent
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: u64,
    /// Seconds a generated QR code waits for confirmation
    #[serde(default = "default_qr_timeout_secs")]
    pub qr_timeout_secs: u64,
    #[serde(default = "default_gateway_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for NetsSettings {
    fn default() -> Self {
        Self {
            base_url: default_nets_base_url(),
            api_key: String::new(),
            project_id: String::new(),
            txn_id_prefix: default_nets_txn_id_prefix(),
            webhook_base_url: None,
            webhook_secret: None,
            webhook_tolerance_secs: default_webhook_tolerance_secs(),
            qr_timeout_secs: default_qr_timeout_secs(),
            timeout_secs: default_gateway_timeout_secs(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// JWT secret key
    #[validate(length(min = 32))]
    pub jwt_secret: String,

    /// JWT expiration time in seconds
    #[serde(default = "default_jwt_expiration")]
    pub jwt_expiration_secs: u64,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Per-request timeout (seconds) applied to every route
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// ISO currency code shared by every gateway exchange
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub currency: String,

    /// Admin account created at startup when missing
    #[serde(default)]
    pub admin_email: Option<String>,
    #[serde(default)]
    pub admin_password: Option<String>,

    #[serde(default)]
    pub pricing: PricingSettings,

    #[serde(default)]
    pub refunds: RefundSettings,

    #[serde(default)]
    pub fraud: FraudSettings,

    #[serde(default)]
    pub paypal: PaypalSettings,

    #[serde(default)]
    pub nets: NetsSettings,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials
    pub fn new(database_url: String, jwt_secret: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            jwt_secret,
            jwt_expiration_secs: default_jwt_expiration(),
            host: "0.0.0.0".to_string(),
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            request_timeout_secs: default_request_timeout_secs(),
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            currency: default_currency(),
            admin_email: None,
            admin_password: None,
            pricing: PricingSettings::default(),
            refunds: RefundSettings::default(),
            fraud: FraudSettings::default(),
            paypal: PaypalSettings::default(),
            nets: NetsSettings::default(),
        }
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        let pricing = &self.pricing;
        if pricing.loyalty_point_value <= Decimal::ZERO {
            let mut err = ValidationError::new("loyalty_point_value");
            err.message = Some("pricing.loyalty_point_value must be positive".into());
            errors.add("pricing", err);
        }
        if pricing.loyalty_max_redemption_percent < Decimal::ZERO
            || pricing.loyalty_max_redemption_percent > dec!(100)
        {
            let mut err = ValidationError::new("loyalty_max_redemption_percent");
            err.message =
                Some("pricing.loyalty_max_redemption_percent must be between 0 and 100".into());
            errors.add("pricing", err);
        }
        if pricing.promotion_percent < Decimal::ZERO || pricing.promotion_percent > dec!(100) {
            let mut err = ValidationError::new("promotion_percent");
            err.message = Some("pricing.promotion_percent must be between 0 and 100".into());
            errors.add("pricing", err);
        }
        if self.nets.qr_timeout_secs == 0 {
            let mut err = ValidationError::new("qr_timeout_secs");
            err.message = Some("nets.qr_timeout_secs must be greater than 0".into());
            errors.add("nets", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_jwt_expiration() -> u64 {
    3600
}
fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_request_timeout_secs() -> u64 {
    30
}

fn default_event_channel_capacity() -> usize {
    1024
}
fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}
fn default_point_value() -> Decimal {
    dec!(0.01)
}
fn default_max_redemption_percent() -> Decimal {
    dec!(50)
}
fn default_earn_rate() -> Decimal {
    dec!(10)
}
fn default_promotion_keywords() -> Vec<String> {
    ["milk", "yogurt", "cheese", "butter", "dairy"]
        .iter()
        .map(|k| k.to_string())
        .collect()
}
fn default_promotion_percent() -> Decimal {
    dec!(10)
}
fn default_refund_window_minutes() -> i64 {
    30
}
fn default_refund_velocity_max() -> u64 {
    3
}
fn default_refund_velocity_hours() -> i64 {
    24
}
fn default_refund_suspension_minutes() -> i64 {
    30
}
fn default_payment_burst_count() -> u64 {
    5
}
fn default_payment_burst_window_secs() -> i64 {
    180
}
fn default_refund_burst_count() -> u64 {
    5
}
fn default_refund_burst_window_secs() -> i64 {
    60
}
fn default_refund_ratio_window_days() -> i64 {
    30
}
fn default_refund_ratio_threshold() -> Decimal {
    dec!(0.5)
}
fn default_topup_refund_window_secs() -> i64 {
    600
}
fn default_order_spike_multiplier() -> Decimal {
    dec!(5)
}
fn default_order_spike_min_history() -> usize {
    3
}
fn default_paypal_base_url() -> String {
    "https://api-m.sandbox.paypal.com".to_string()
}
fn default_nets_base_url() -> String {
    "https://sandbox.nets.openapipaas.com".to_string()
}
fn default_nets_txn_id_prefix() -> String {
    "sandbox_nets|m|".to_string()
}
fn default_gateway_timeout_secs() -> u64 {
    10
}
fn default_webhook_tolerance_secs() -> u64 {
    300
}
fn default_qr_timeout_secs() -> u64 {
    240
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("supermarket_checkout={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(Path::new(CONFIG_DIR))
}

/// Loads configuration with `dir` standing in for the `config/` directory
pub fn load_config_from(dir: &Path) -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            dir.display()
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://checkout.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::from(dir.join("default")).required(false))
        .add_source(File::from(dir.join(&run_env)).required(false))
        .add_source(
            Environment::with_prefix("APP")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("pricing.promotion_keywords")
                .try_parsing(true),
        )
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET to a random string of at least 32 characters.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured. Set APP__JWT_SECRET environment variable."
                .into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
