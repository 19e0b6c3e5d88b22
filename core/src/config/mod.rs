//! Engine configuration
//!
//! Loaded from an optional TOML file, then overridden by the environment variables the
//! deployment has always used (`ODK_BASE_URL`, `AWS_BUCKET_NAME`, `SYNC_INTERVAL`, ...).

use std::{
	env, fs,
	path::{Path, PathBuf},
	time::Duration,
};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config file <path='{}'>: {source}", .path.display())]
	Read {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error("failed to parse config file: {0}")]
	Parse(#[from] toml::de::Error),
	#[error("invalid value for environment variable {name}: '{value}'")]
	InvalidEnv { name: &'static str, value: String },
	#[error("invalid configuration: {0}")]
	Invalid(String),
}

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
	/// Directory holding rolling log files
	pub data_dir: PathBuf,

	/// Default log filter, `RUST_LOG` still wins when set
	pub log_level: String,

	pub database: DatabaseConfig,
	pub source: SourceConfig,

	/// Image ingestion is skipped entirely when no object storage is configured
	pub storage: Option<StorageConfig>,

	pub sync: SyncConfig,
	pub unified: UnifiedConfig,
	pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
	pub url: String,
	pub max_connections: u32,
}

impl Default for DatabaseConfig {
	fn default() -> Self {
		Self {
			url: "sqlite://formsync.db?mode=rwc".to_string(),
			max_connections: 10,
		}
	}
}

/// Form server (OData) access
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
	pub base_url: String,
	pub project_id: String,
	pub form_id: String,
	pub email: String,
	pub password: String,

	/// Repeat group exposed as `Submissions.{child_table}`
	pub child_table: String,

	pub page_size: u32,
	pub request_timeout_secs: u64,

	/// Upper bound for retrying transient failures of a single request
	pub retry_max_elapsed_secs: u64,
}

impl Default for SourceConfig {
	fn default() -> Self {
		Self {
			base_url: String::new(),
			project_id: String::new(),
			form_id: String::new(),
			email: String::new(),
			password: String::new(),
			child_table: "person_details".to_string(),
			page_size: 250,
			request_timeout_secs: 60,
			retry_max_elapsed_secs: 120,
		}
	}
}

impl SourceConfig {
	#[must_use]
	pub const fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_secs)
	}

	#[must_use]
	pub const fn retry_max_elapsed(&self) -> Duration {
		Duration::from_secs(self.retry_max_elapsed_secs)
	}
}

/// S3 compatible object storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
	pub bucket: String,
	pub region: String,
	pub access_key_id: String,
	pub secret_access_key: String,
	pub endpoint: Option<String>,

	pub base_folder: String,
	pub building_folder: String,
	pub plus_code_folder: String,
	pub placeholder_folder: String,

	pub request_timeout_secs: u64,
}

impl Default for StorageConfig {
	fn default() -> Self {
		Self {
			bucket: String::new(),
			region: "us-east-1".to_string(),
			access_key_id: String::new(),
			secret_access_key: String::new(),
			endpoint: None,
			base_folder: "odk_images".to_string(),
			building_folder: "building-images".to_string(),
			plus_code_folder: "address-plus-code-images".to_string(),
			placeholder_folder: "placeholders".to_string(),
			request_timeout_secs: 60,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
	pub interval_secs: u64,
	pub max_workers: usize,

	/// Images of new records go on the high priority lane
	pub prioritize_new: bool,

	pub image_job_timeout_secs: u64,

	/// Downloads smaller than this are treated as corrupt
	pub min_image_bytes: usize,

	pub signed_url_ttl_secs: u64,
	pub enable_url_refresh: bool,
	pub url_refresh_threshold_hours: u64,
	pub history_retention_days: u64,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			interval_secs: 60,
			max_workers: 10,
			prioritize_new: true,
			image_job_timeout_secs: 120,
			min_image_bytes: 100,
			signed_url_ttl_secs: 24 * 60 * 60,
			enable_url_refresh: true,
			url_refresh_threshold_hours: 2,
			history_retention_days: 30,
		}
	}
}

impl SyncConfig {
	#[must_use]
	pub const fn interval(&self) -> Duration {
		Duration::from_secs(self.interval_secs)
	}

	#[must_use]
	pub const fn image_job_timeout(&self) -> Duration {
		Duration::from_secs(self.image_job_timeout_secs)
	}

	#[must_use]
	pub const fn signed_url_ttl(&self) -> Duration {
		Duration::from_secs(self.signed_url_ttl_secs)
	}

	#[must_use]
	pub fn url_refresh_threshold(&self) -> chrono::Duration {
		chrono::Duration::hours(i64::try_from(self.url_refresh_threshold_hours).unwrap_or(i64::MAX))
	}

	#[must_use]
	pub fn history_retention(&self) -> chrono::Duration {
		chrono::Duration::days(i64::try_from(self.history_retention_days).unwrap_or(i64::MAX))
	}
}

/// Validation bounds and conversion tables used when materializing the unified table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnifiedConfig {
	pub latitude: (f64, f64),
	pub longitude: (f64, f64),
	pub max_amount: f64,
	pub max_units: i32,
	pub phone_pattern: String,
	pub tin_pattern: String,
	pub nin_pattern: String,
	pub email_pattern: String,
	pub currencies: Vec<CurrencyRate>,
	pub tax_rates: TaxRates,
}

impl Default for UnifiedConfig {
	fn default() -> Self {
		Self {
			latitude: (13.0, 13.9),
			longitude: (-17.0, -13.5),
			max_amount: 10_000_000.0,
			max_units: 1000,
			phone_pattern: r"^(\+220|220)?[0-9]{7,8}$".to_string(),
			tin_pattern: "^[0-9]{10}$".to_string(),
			nin_pattern: "^[0-9]{9}$".to_string(),
			email_pattern: "^[A-Za-z0-9._%-]+@[A-Za-z0-9.-]+[.][A-Za-z]+$".to_string(),
			currencies: vec![
				CurrencyRate::new("dalasi", &["dalasi", "gmd"], 1.0),
				CurrencyRate::new("usd", &["usd", "dollar", "dollars", "$"], 71.43),
				CurrencyRate::new("euro", &["euro", "eur", "€"], 76.92),
				CurrencyRate::new("pound", &["pound", "pounds", "gbp", "£"], 90.91),
			],
			tax_rates: TaxRates::default(),
		}
	}
}

/// Conversion of one currency to the base unit. The first entry of
/// [`UnifiedConfig::currencies`] is the base currency and the fallback for unknown names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrencyRate {
	pub name: String,
	pub aliases: Vec<String>,
	pub rate: f64,
}

impl CurrencyRate {
	fn new(name: &str, aliases: &[&str], rate: f64) -> Self {
		Self {
			name: name.to_string(),
			aliases: aliases.iter().map(ToString::to_string).collect(),
			rate,
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxRates {
	pub commercial: f64,
	pub residential: f64,
	pub business: f64,
}

impl Default for TaxRates {
	fn default() -> Self {
		Self {
			commercial: 0.15,
			residential: 0.08,
			business: 0.27,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
	pub bind: String,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			bind: "0.0.0.0:8080".to_string(),
		}
	}
}

impl AppConfig {
	/// Load configuration from an optional TOML file, apply environment overrides and validate.
	pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
		let mut config = match path {
			Some(path) => {
				info!(path = %path.display(), "Loading config");
				Self::from_toml(&fs::read_to_string(path).map_err(|source| {
					ConfigError::Read {
						path: path.to_path_buf(),
						source,
					}
				})?)?
			}
			None => Self::with_defaults(),
		};

		config.apply_env(|name| env::var(name).ok())?;
		config.validate()?;

		Ok(config)
	}

	pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
		let mut config = toml::from_str::<Self>(contents)?;
		config.fill_defaults();
		Ok(config)
	}

	#[must_use]
	pub fn with_defaults() -> Self {
		let mut config = Self::default();
		config.fill_defaults();
		config
	}

	fn fill_defaults(&mut self) {
		if self.data_dir.as_os_str().is_empty() {
			self.data_dir = PathBuf::from(".");
		}
		if self.log_level.is_empty() {
			self.log_level = "info".to_string();
		}
	}

	/// Overrides values with the ones found through `lookup`, empty values are ignored.
	pub fn apply_env(
		&mut self,
		lookup: impl Fn(&str) -> Option<String>,
	) -> Result<(), ConfigError> {
		let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

		if let Some(value) = var("DATABASE_URL") {
			self.database.url = value;
		}

		if let Some(value) = var("ODK_BASE_URL") {
			self.source.base_url = value;
		}
		if let Some(value) = var("ODK_PROJECT_ID") {
			self.source.project_id = value;
		}
		if let Some(value) = var("ODK_FORM_ID") {
			self.source.form_id = value;
		}
		if let Some(value) = var("ODATA_USER") {
			self.source.email = value;
		}
		if let Some(value) = var("ODATA_PASS") {
			self.source.password = value;
		}

		if let Some(bucket) = var("AWS_BUCKET_NAME") {
			let storage = self.storage.get_or_insert_with(StorageConfig::default);
			storage.bucket = bucket;
		}
		if let Some(storage) = self.storage.as_mut() {
			if let Some(value) = var("AWS_REGION") {
				storage.region = value;
			}
			if let Some(value) = var("AWS_ACCESS_KEY_ID") {
				storage.access_key_id = value;
			}
			if let Some(value) = var("AWS_SECRET_ACCESS_KEY") {
				storage.secret_access_key = value;
			}
			if let Some(value) = var("S3_BASE_FOLDER") {
				storage.base_folder = value;
			}
		}

		if let Some(value) = var("SYNC_INTERVAL") {
			self.sync.interval_secs = parse_env("SYNC_INTERVAL", &value)?;
		}
		if let Some(value) = var("MAX_WORKERS") {
			self.sync.max_workers = parse_env("MAX_WORKERS", &value)?;
		}
		if let Some(value) = var("PRIORITIZE_NEW") {
			self.sync.prioritize_new = parse_bool_env("PRIORITIZE_NEW", &value)?;
		}
		if let Some(value) = var("URL_REFRESH_THRESHOLD_HOURS") {
			self.sync.url_refresh_threshold_hours =
				parse_env("URL_REFRESH_THRESHOLD_HOURS", &value)?;
		}
		if let Some(value) = var("ENABLE_URL_REFRESH") {
			self.sync.enable_url_refresh = parse_bool_env("ENABLE_URL_REFRESH", &value)?;
		}

		debug!("Environment overrides applied");

		Ok(())
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		Url::parse(&self.source.base_url).map_err(|e| {
			ConfigError::Invalid(format!(
				"source.base_url '{}' is not a valid url: {e}",
				self.source.base_url
			))
		})?;

		for (name, value) in [
			("source.project_id", &self.source.project_id),
			("source.form_id", &self.source.form_id),
			("source.child_table", &self.source.child_table),
			("database.url", &self.database.url),
		] {
			if value.trim().is_empty() {
				return Err(ConfigError::Invalid(format!("{name} must not be empty")));
			}
		}

		if self.source.page_size == 0 {
			return Err(ConfigError::Invalid("source.page_size must be positive".into()));
		}
		if self.sync.max_workers == 0 {
			return Err(ConfigError::Invalid("sync.max_workers must be positive".into()));
		}
		if self.unified.currencies.is_empty() {
			return Err(ConfigError::Invalid(
				"unified.currencies needs at least the base currency".into(),
			));
		}
		if let Some(storage) = &self.storage {
			if storage.bucket.trim().is_empty() {
				return Err(ConfigError::Invalid("storage.bucket must not be empty".into()));
			}
		}

		Ok(())
	}

	#[must_use]
	pub fn logs_dir(&self) -> PathBuf {
		self.data_dir.join("logs")
	}
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
	value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
		name,
		value: value.to_string(),
	})
}

fn parse_bool_env(name: &'static str, value: &str) -> Result<bool, ConfigError> {
	match value.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" => Ok(false),
		_ => Err(ConfigError::InvalidEnv {
			name,
			value: value.to_string(),
		}),
	}
}
