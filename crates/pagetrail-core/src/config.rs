use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    pub url: String,
    pub database: String,
    pub user: String,
    pub password: String,
    pub query_timeout_secs: u64,
}

impl ClickHouseConfig {
    pub fn from_env() -> Result<Self, String> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Builds the config from any variable source; `from_env` passes the process environment.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        Ok(Self {
            url: var("PAGETRAIL_CLICKHOUSE_URL")
                .unwrap_or_else(|| "http://localhost:8123".to_string()),
            database: var("PAGETRAIL_CLICKHOUSE_DATABASE")
                .unwrap_or_else(|| "pagetrail".to_string()),
            user: var("PAGETRAIL_CLICKHOUSE_USER").unwrap_or_else(|| "default".to_string()),
            password: var("PAGETRAIL_CLICKHOUSE_PASSWORD").unwrap_or_default(),
            query_timeout_secs: var("PAGETRAIL_QUERY_TIMEOUT_SECS")
                .unwrap_or_else(|| "60".to_string())
                .parse()
                .map_err(|e| format!("invalid query timeout: {e}"))?,
        })
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        let config = ClickHouseConfig::from_vars(|_| None).expect("config");
        assert_eq!(config.url, "http://localhost:8123");
        assert_eq!(config.database, "pagetrail");
        assert_eq!(config.user, "default");
        assert_eq!(config.password, "");
        assert_eq!(config.query_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn variables_override_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("PAGETRAIL_CLICKHOUSE_URL", "http://ch:8123"),
            ("PAGETRAIL_CLICKHOUSE_DATABASE", "analytics"),
            ("PAGETRAIL_QUERY_TIMEOUT_SECS", "5"),
        ]);
        let config =
            ClickHouseConfig::from_vars(|key| vars.get(key).map(|v| v.to_string())).expect("config");
        assert_eq!(config.url, "http://ch:8123");
        assert_eq!(config.database, "analytics");
        assert_eq!(config.query_timeout_secs, 5);
    }

    #[test]
    fn invalid_timeout_is_rejected() {
        let err = ClickHouseConfig::from_vars(|key| {
            (key == "PAGETRAIL_QUERY_TIMEOUT_SECS").then(|| "soon".to_string())
        })
        .expect_err("should fail");
        assert!(err.contains("invalid query timeout"));
    }
}
