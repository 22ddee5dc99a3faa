use tracing::level_filters::LevelFilter;

const ENABLE_SHUTDOWN: &str = "HOMEWATCH_ENABLE_SHUTDOWN";

/// Override for `power.enable_shutdown`
pub fn get_enable_shutdown() -> Option<bool> {
    std::env::var(ENABLE_SHUTDOWN)
        .ok()
        .and_then(|value| parse_bool(&value))
}

const MAX_RESTART_ATTEMPTS: &str = "HOMEWATCH_MAX_RESTART_ATTEMPTS";

pub fn get_max_restart_attempts() -> Option<u32> {
    let attempts_from_env = std::env::var(MAX_RESTART_ATTEMPTS);
    attempts_from_env.ok().and_then(|res| res.parse().ok())
}

const LOG_LEVEL: &str = "HOMEWATCH_LOG";

const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::INFO;

pub fn get_log_level() -> LevelFilter {
    let level_from_env = std::env::var(LOG_LEVEL);
    level_from_env.map_or(DEFAULT_LOG_LEVEL, |res| {
        res.parse().unwrap_or(DEFAULT_LOG_LEVEL)
    })
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
