//! Runtime configuration for the Ragnar service.
//!
//! Configuration is collected once at startup from CLI flags with `RAGNAR_*`
//! environment fallbacks and is passed down to the components that need it.
//! It covers:
//!
//! - Database connectivity (`--db-uri`).
//! - Object storage (`--s3-endpoint`, `--s3-bucket`, `--s3-access-key`,
//!   `--s3-secret-key`).
//! - The HTTP surface (`--http-uri`, `--http-port`, `--http-upload-limit`).
//! - The embedding service (`--bellman-uri`, `--bellman-name`,
//!   `--bellman-key`, `--default-embed-model`).
//! - Logging (`--log-level`, `--log-format`).
//!
//! Invalid combinations are rejected up front by [`Config::validate`] so that
//! misconfiguration is easy to diagnose before any component starts.

use clap::Parser;
use thiserror::Error;

/// Errors raised while validating the parsed configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A flag carried a value outside its accepted range.
    #[error("invalid value for {flag}: {reason}")]
    InvalidValue {
        /// The offending flag name.
        flag: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Command line and environment configuration for `ragnard`.
#[derive(Debug, Clone, Parser)]
#[command(name = "ragnard", about = "Multi-tenant RAG ingestion and search service")]
pub struct Config {
    /// Log level: debug, info, warn or error.
    #[arg(long, env = "RAGNAR_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format: json or text.
    #[arg(long, env = "RAGNAR_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Postgres connection URI.
    #[arg(long, env = "RAGNAR_DB_URI")]
    pub db_uri: String,

    /// S3 endpoint used for document storage.
    #[arg(long, env = "RAGNAR_S3_ENDPOINT")]
    pub s3_endpoint: String,

    /// S3 bucket used for document storage.
    #[arg(long, env = "RAGNAR_S3_BUCKET")]
    pub s3_bucket: String,

    /// S3 access key.
    #[arg(long, env = "RAGNAR_S3_ACCESS_KEY")]
    pub s3_access_key: String,

    /// S3 secret key.
    #[arg(long, env = "RAGNAR_S3_SECRET_KEY")]
    pub s3_secret_key: String,

    /// Run in production mode (TLS towards S3, no dev schema bootstrap).
    #[arg(long, env = "RAGNAR_PRODUCTION", default_value_t = false)]
    pub production: bool,

    /// Base URI the HTTP server is reachable at.
    #[arg(long, env = "RAGNAR_HTTP_URI", default_value = "http://localhost:7100")]
    pub http_uri: String,

    /// Port for the HTTP server.
    #[arg(long, env = "RAGNAR_HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// Maximum accepted upload size in bytes.
    #[arg(long, env = "RAGNAR_HTTP_UPLOAD_LIMIT", default_value_t = 100 << 20)]
    pub http_upload_limit: u64,

    /// Base URI of the bellman embedding service.
    #[arg(long, env = "RAGNAR_BELLMAN_URI", default_value = "")]
    pub bellman_uri: String,

    /// Client name presented to the bellman service.
    #[arg(long, env = "RAGNAR_BELLMAN_NAME", default_value = "ragnar")]
    pub bellman_name: String,

    /// API key for the bellman service.
    #[arg(long, env = "RAGNAR_BELLMAN_KEY", default_value = "")]
    pub bellman_key: String,

    /// Embedding model used when a tub does not configure one.
    #[arg(
        long,
        env = "RAGNAR_DEFAULT_EMBED_MODEL",
        default_value = "voyageai/voyage-context-3"
    )]
    pub default_embed_model: String,
}

impl Config {
    /// Check cross-field constraints that clap cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http_upload_limit == 0 {
            return Err(ConfigError::InvalidValue {
                flag: "http-upload-limit",
                reason: "must be at least 1 byte".into(),
            });
        }
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    flag: "log-format",
                    reason: format!("unknown format '{other}', expected json or text"),
                });
            }
        }
        if crate::embedding::EmbedModel::lookup(&self.default_embed_model).is_none() {
            return Err(ConfigError::InvalidValue {
                flag: "default-embed-model",
                reason: format!("unknown embedding model '{}'", self.default_embed_model),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Config;
    use clap::Parser;

    fn base_args() -> Vec<&'static str> {
        vec![
            "ragnard",
            "--db-uri",
            "postgres://localhost/ragnar",
            "--s3-endpoint",
            "localhost:9000",
            "--s3-bucket",
            "ragnar",
            "--s3-access-key",
            "minio",
            "--s3-secret-key",
            "minio123",
        ]
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::try_parse_from(base_args()).expect("config parses");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, "json");
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.http_upload_limit, 100 << 20);
        assert_eq!(config.http_uri, "http://localhost:7100");
        assert_eq!(config.default_embed_model, "voyageai/voyage-context-3");
        assert!(!config.production);
        config.validate().expect("defaults validate");
    }

    #[test]
    fn rejects_zero_upload_limit() {
        let mut args = base_args();
        args.extend(["--http-upload-limit", "0"]);
        let config = Config::try_parse_from(args).expect("config parses");
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_log_format() {
        let mut args = base_args();
        args.extend(["--log-format", "yaml"]);
        let config = Config::try_parse_from(args).expect("config parses");
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_default_model() {
        let mut args = base_args();
        args.extend(["--default-embed-model", "acme/not-a-model"]);
        let config = Config::try_parse_from(args).expect("config parses");
        assert!(config.validate().is_err());
    }
}
