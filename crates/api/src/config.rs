//! Server configuration

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Direct (non-pooler) URL for migrations; falls back to `database_url`
    pub migration_database_url: Option<String>,
    pub bind_address: String,
    pub run_migrations: bool,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let migration_database_url = std::env::var("MIGRATION_DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let run_migrations = match std::env::var("RUN_MIGRATIONS") {
            Ok(v) => parse_bool("RUN_MIGRATIONS", &v)?,
            Err(_) => false,
        };

        let allowed_origins = parse_origins(
            &std::env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string()),
        );

        Ok(Self {
            database_url,
            migration_database_url,
            bind_address,
            run_migrations,
            allowed_origins,
        })
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
        }),
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 5] = [
        "DATABASE_URL",
        "MIGRATION_DATABASE_URL",
        "BIND_ADDRESS",
        "RUN_MIGRATIONS",
        "CORS_ORIGINS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_requires_database_url() {
        clear_env();
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/clinicpay");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert!(!config.run_migrations);
        assert!(config.migration_database_url.is_none());
        assert_eq!(config.allowed_origins.len(), 2);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_flag() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/clinicpay");
        std::env::set_var("RUN_MIGRATIONS", "maybe");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid {
                name: "RUN_MIGRATIONS",
                ..
            })
        ));

        clear_env();
    }

    #[test]
    fn test_parse_origins_skips_blanks() {
        let origins = parse_origins(" https://app.clinicpay.kr , ,http://localhost:3000");
        assert_eq!(
            origins,
            vec!["https://app.clinicpay.kr", "http://localhost:3000"]
        );
    }
}
