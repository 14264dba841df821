//! Environment-driven settings.
//!
//! Mirrors `ExecutorType::from_env()`'s pattern of reading a handful of
//! environment variables once at startup rather than parsing a project
//! config file: this service has no per-project DSL to load, just the
//! deployment knobs named below.

use std::env;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Deployment environment. Controls whether error bodies and interactive
/// docs are exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Main,
}

impl Environment {
    pub fn is_dev(&self) -> bool {
        matches!(self, Environment::Dev)
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Dev),
            "main" | "prod" | "production" => Ok(Environment::Main),
            other => Err(ConfigError::InvalidValue {
                name: "ENV",
                value: other.to_string(),
            }),
        }
    }
}

/// Settings read once at process startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub env: Environment,
    pub tmp_dir: String,
    pub data_storage_bucket: String,
    pub database_url: String,
    pub rabbitmq_url: String,
    pub redis_url: String,
    pub queue_image_tag: String,
    /// Registry prefix stage images are pulled from, e.g.
    /// `registry.example.com/sdcloud`. Not named in spec.md's env table but
    /// required to resolve a bare image name like `sd-tools` to something
    /// `bollard` can pull; defaults to a placeholder registry.
    pub image_registry: String,
    /// Base URL the packaged output archive is made reachable under once a
    /// job succeeds. Joined with `{job_id}/data.zip` by
    /// `sdcloud_storage::public_download_url`.
    pub public_base_url: String,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let env = env::var("ENV")
            .ok()
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(Environment::Dev);

        let tmp_dir = env::var("TMP_DIR").unwrap_or_else(|_| "/tmp".to_string());

        let data_storage_bucket = env::var("SD_DATA_STORAGE_BUCKET_NAME")
            .unwrap_or_else(|_| "sd-experiments".to_string());

        let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| match env {
            Environment::Dev => "postgres://localhost/sdcloud_dev".to_string(),
            Environment::Main => "postgres://localhost/sdcloud".to_string(),
        });

        let rabbitmq_url =
            env::var("RABBITMQ_URL").map_err(|_| ConfigError::MissingVar("RABBITMQ_URL"))?;
        let redis_url = env::var("REDIS_URL").map_err(|_| ConfigError::MissingVar("REDIS_URL"))?;

        let queue_image_tag =
            env::var("QUEUE_IMAGE_TAG").unwrap_or_else(|_| "stable".to_string());

        let image_registry = env::var("SD_IMAGE_REGISTRY")
            .unwrap_or_else(|_| "registry.sdcloud.internal/sdcloud".to_string());

        let public_base_url = env::var("SD_PUBLIC_BASE_URL").unwrap_or_else(|_| {
            format!("https://storage.googleapis.com/{data_storage_bucket}")
        });

        Ok(Self {
            env,
            tmp_dir,
            data_storage_bucket,
            database_url,
            rabbitmq_url,
            redis_url,
            queue_image_tag,
            image_registry,
            public_base_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parses_common_spellings() {
        assert_eq!("dev".parse::<Environment>().unwrap(), Environment::Dev);
        assert_eq!(
            "production".parse::<Environment>().unwrap(),
            Environment::Main
        );
        assert!("staging".parse::<Environment>().is_err());
    }
}
