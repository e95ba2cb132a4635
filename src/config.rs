use std::{env, time::Duration};

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: String,
    pub db_path: String,
    pub cors_allow_any: bool,
    pub cors_origins: Vec<String>,
    pub keepalive_secs: u64,
    pub channel_capacity: usize,
    pub service_durations: Vec<u32>,
    pub confirmation_code_len: usize,
    pub admin_broadcast_enabled: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr = env_or("BIND_ADDR", "0.0.0.0:3000");
        let db_path = env_or("DB_PATH", "negotiation.redb");
        let cors_raw = env_or("CORS_ORIGINS", "http://localhost:3000");
        let (cors_allow_any, cors_origins) = parse_cors_origins(&cors_raw);
        let keepalive_secs = env_or_parse("KEEPALIVE_SECS", 25)?;
        let channel_capacity = env_or_parse("CHANNEL_CAPACITY", 64)?;
        let service_durations = parse_durations(&env_or("SERVICE_DURATIONS", "30,60,90,120"))?;
        let confirmation_code_len = env_or_parse("CONFIRMATION_CODE_LEN", 8)?;
        let admin_broadcast_enabled = env_or_parse("ADMIN_BROADCAST_ENABLED", true)?;

        let cfg = Self {
            bind_addr,
            db_path,
            cors_allow_any,
            cors_origins,
            keepalive_secs,
            channel_capacity,
            service_durations,
            confirmation_code_len,
            admin_broadcast_enabled,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.keepalive_secs == 0 {
            anyhow::bail!("KEEPALIVE_SECS must be > 0");
        }
        if self.channel_capacity == 0 {
            anyhow::bail!("CHANNEL_CAPACITY must be > 0");
        }
        if self.service_durations.is_empty() {
            anyhow::bail!("SERVICE_DURATIONS must list at least one duration");
        }
        if !(4..=16).contains(&self.confirmation_code_len) {
            anyhow::bail!("CONFIRMATION_CODE_LEN must be between 4 and 16");
        }
        Ok(())
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            db_path: "negotiation.redb".to_string(),
            cors_allow_any: true,
            cors_origins: Vec::new(),
            keepalive_secs: 25,
            channel_capacity: 64,
            service_durations: vec![30, 60, 90, 120],
            confirmation_code_len: 8,
            admin_broadcast_enabled: true,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => Ok(value.parse()?),
        Err(_) => Ok(default),
    }
}

fn parse_cors_origins(value: &str) -> (bool, Vec<String>) {
    let origins = parse_list(value);

    if origins.iter().any(|item| item == "*") {
        (true, Vec::new())
    } else {
        (false, origins)
    }
}

fn parse_durations(value: &str) -> anyhow::Result<Vec<u32>> {
    let mut durations = parse_list(value)
        .iter()
        .map(|item| item.parse::<u32>())
        .collect::<Result<Vec<_>, _>>()?;
    if durations.iter().any(|minutes| *minutes == 0) {
        anyhow::bail!("SERVICE_DURATIONS entries must be > 0");
    }
    durations.sort_unstable();
    durations.dedup();
    Ok(durations)
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}
