use anyhow::Context;
use std::env;

pub const DEFAULT_DB_NAME: &str = "deployment_service";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_name: String,
    pub automigrate: bool,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Config {
    pub fn new() -> anyhow::Result<Config> {
        _ = dotenvy::dotenv();

        Ok(Config {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL is required.")?,
            db_name: env::var("DEPLOYMENTS_DB_NAME").unwrap_or_else(|_| DEFAULT_DB_NAME.to_string()),
            automigrate: env::var("DEPLOYMENTS_AUTOMIGRATE")
                .ok()
                .map(|value| parse_flag(&value))
                .transpose()
                .context("DEPLOYMENTS_AUTOMIGRATE must be a boolean.")?
                .unwrap_or(false),
            max_connections: env::var("DEPLOYMENTS_MAX_CONNECTIONS")
                .ok()
                .map(|value| value.parse())
                .transpose()
                .context("DEPLOYMENTS_MAX_CONNECTIONS must be a number.")?
                .unwrap_or(20),
            acquire_timeout_secs: env::var("DEPLOYMENTS_ACQUIRE_TIMEOUT")
                .ok()
                .map(|value| value.parse())
                .transpose()
                .context("DEPLOYMENTS_ACQUIRE_TIMEOUT must be a number of seconds.")?
                .unwrap_or(30),
        })
    }
}

fn parse_flag(value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("unrecognised flag value '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags() {
        assert!(parse_flag("TRUE").unwrap());
        assert!(parse_flag(" 1").unwrap());
        assert!(!parse_flag("off").unwrap());
        assert!(parse_flag("maybe").is_err());
    }
}
