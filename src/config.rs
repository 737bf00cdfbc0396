use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// PostgreSQL URL. When unset the registry lives in memory.
    pub database_url: Option<String>,
    /// Redis URL for shared rate counters. When unset counters are per-process.
    pub redis_url: Option<String>,
    pub admin_key: Option<String>,
    /// Rate limit window. Set via SVCGW_RATE_WINDOW_SECS. Default: 60.
    pub rate_window: Duration,
    pub upstream_timeout: Duration,
    /// Internal upstream retries. 0 = caller decides.
    pub upstream_max_retries: u32,
    /// Health probe period. None disables the health checker.
    pub health_interval: Option<Duration>,
    pub session_ttl: Duration,
    /// Events buffered per streaming session before it is aborted.
    pub session_buffer: usize,
    pub log_json: bool,
    pub production: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8787,
            database_url: None,
            redis_url: None,
            admin_key: None,
            rate_window: Duration::from_secs(60),
            upstream_timeout: Duration::from_secs(60),
            upstream_max_retries: 0,
            health_interval: Some(Duration::from_secs(30)),
            session_ttl: Duration::from_secs(300),
            session_buffer: 1024,
            log_json: false,
            production: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let defaults = Config::default();
    let production = std::env::var("SVCGW_ENV")
        .or_else(|_| std::env::var("RUST_ENV"))
        .map(|v| v == "production")
        .unwrap_or(false);

    let admin_key = env_nonempty("SVCGW_ADMIN_KEY");
    if admin_key.is_none() {
        if production {
            anyhow::bail!("SVCGW_ADMIN_KEY must be set when SVCGW_ENV=production");
        }
        eprintln!("⚠️  SVCGW_ADMIN_KEY is not set; the admin API will reject every request.");
    }

    let health_secs: u64 = env_parse("SVCGW_HEALTH_INTERVAL_SECS", 30);
    let window_secs: u64 = env_parse("SVCGW_RATE_WINDOW_SECS", 60);
    if window_secs == 0 {
        anyhow::bail!("SVCGW_RATE_WINDOW_SECS must be positive");
    }

    Ok(Config {
        port: env_parse("SVCGW_PORT", defaults.port),
        database_url: env_nonempty("DATABASE_URL"),
        redis_url: env_nonempty("REDIS_URL"),
        admin_key,
        rate_window: Duration::from_secs(window_secs),
        upstream_timeout: Duration::from_secs(env_parse("SVCGW_UPSTREAM_TIMEOUT_SECS", 60)),
        upstream_max_retries: env_parse("SVCGW_UPSTREAM_MAX_RETRIES", 0),
        health_interval: (health_secs > 0).then(|| Duration::from_secs(health_secs)),
        session_ttl: Duration::from_secs(env_parse("SVCGW_SESSION_TTL_SECS", 300)),
        session_buffer: env_parse("SVCGW_SESSION_BUFFER", defaults.session_buffer),
        log_json: env_parse("SVCGW_LOG_JSON", 0u8) == 1,
        production,
    })
}

/// Named environment-style overrides consulted by migrations.
///
/// A value is taken from the override when present and non-empty, otherwise
/// the caller's literal default applies.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    values: HashMap<String, String>,
    production: bool,
}

impl Overrides {
    /// Snapshot of the process environment (after `.env` loading).
    pub fn from_env(production: bool) -> Self {
        Self {
            values: std::env::vars().collect(),
            production,
        }
    }

    pub fn from_map<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            production: false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn resolve(&self, name: &str, default: &str) -> String {
        match self.get(name) {
            Some(v) => v.to_string(),
            None => {
                tracing::debug!(setting = name, "override not set, using literal default");
                default.to_string()
            }
        }
    }

    /// Like [`resolve`](Self::resolve) for secrets: refuses literal defaults in
    /// production.
    pub fn resolve_secret(&self, name: &str, default: Option<&str>) -> anyhow::Result<Option<String>> {
        if let Some(v) = self.get(name) {
            return Ok(Some(v.to_string()));
        }
        match default {
            Some(_) if self.production => {
                anyhow::bail!("{} must be set in production; refusing literal default", name)
            }
            Some(d) => {
                tracing::warn!(setting = name, "secret override not set, using literal default");
                Ok(Some(d.to_string()))
            }
            None => Ok(None),
        }
    }
}
