// =============================================================================
// Engine Configuration — environment-driven settings
// =============================================================================
//
// Every tunable of the engine is read from the environment once at startup.
// Numeric risk parameters are fractions (0.015 = 1.5 %); the documented
// defaults apply whenever a variable is unset or fails to parse.
// =============================================================================

use serde::Serialize;
use tracing::warn;

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
    ]
}

const DEFAULT_ACCOUNT_RISK_PCT: f64 = 0.015;
const DEFAULT_MAX_SLIPPAGE_PCT: f64 = 0.002;
const DEFAULT_TRAILING_TRIGGER_PCT: f64 = 0.02;
const DEFAULT_DAILY_DRAWDOWN_LIMIT: f64 = 0.05;
const DEFAULT_EMA_PERIOD: usize = 20;
const DEFAULT_EMA_DEVIATION_THRESHOLD: f64 = 0.005;
const DEFAULT_VOLUME_ANOMALY_THRESHOLD: f64 = 2.0;
const DEFAULT_DATABASE_PATH: &str = "spotmind.db";

// =============================================================================
// Config
// =============================================================================

/// Immutable engine configuration assembled from the environment at boot.
#[derive(Clone, Serialize)]
pub struct Config {
    /// Trading pairs the engine evaluates, e.g. ["BTCUSDT", "ETHUSDT"].
    pub symbols: Vec<String>,

    /// Fraction of the account risked per trade (default 0.015 = 1.5 %).
    pub account_risk_pct: f64,
    /// Maximum acceptable slippage as a fraction (default 0.002 = 0.2 %).
    pub max_slippage_pct: f64,
    /// Unrealized-profit fraction that activates the trailing stop (default 2 %).
    pub trailing_trigger_pct: f64,
    /// Daily drawdown fraction that trips the circuit breaker (default 5 %).
    pub daily_drawdown_limit: f64,

    /// EMA look-back period for trend analysis.
    pub ema_period: usize,
    /// Minimum |price - EMA| / EMA deviation required to act.
    pub ema_deviation_threshold: f64,
    /// Volume z-score treated as anomalous by the VPA analyzer.
    pub volume_anomaly_threshold: f64,

    /// Exchange credentials. The secret is redacted from Debug output by
    /// never being stored here — it goes straight into the REST client.
    pub api_key: String,
    #[serde(skip)]
    pub api_secret: String,
    pub testnet: bool,

    /// SQLite path for the durable trade/position/risk store.
    pub database_path: String,
}

impl Config {
    /// Build the configuration from the process environment.
    ///
    /// Unset or malformed variables fall back to the documented defaults;
    /// each fallback for a malformed value is logged once.
    pub fn from_env() -> Self {
        let symbols = match std::env::var("TRADING_PAIRS") {
            Ok(raw) => {
                let parsed: Vec<String> = raw
                    .split(',')
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty())
                    .collect();
                if parsed.is_empty() {
                    default_symbols()
                } else {
                    parsed
                }
            }
            Err(_) => default_symbols(),
        };

        Self {
            symbols,
            account_risk_pct: env_f64("ACCOUNT_RISK_PCT", DEFAULT_ACCOUNT_RISK_PCT),
            max_slippage_pct: env_f64("MAX_SLIPPAGE_PCT", DEFAULT_MAX_SLIPPAGE_PCT),
            trailing_trigger_pct: env_f64("TRAILING_TRIGGER_PCT", DEFAULT_TRAILING_TRIGGER_PCT),
            daily_drawdown_limit: env_f64("DAILY_DRAWDOWN_LIMIT", DEFAULT_DAILY_DRAWDOWN_LIMIT),
            ema_period: env_usize("EMA_PERIOD", DEFAULT_EMA_PERIOD),
            ema_deviation_threshold: env_f64(
                "EMA_DEVIATION_THRESHOLD",
                DEFAULT_EMA_DEVIATION_THRESHOLD,
            ),
            volume_anomaly_threshold: env_f64(
                "VOLUME_ANOMALY_THRESHOLD",
                DEFAULT_VOLUME_ANOMALY_THRESHOLD,
            ),
            api_key: std::env::var("BINANCE_API_KEY").unwrap_or_default(),
            api_secret: std::env::var("BINANCE_API_SECRET").unwrap_or_default(),
            testnet: std::env::var("BINANCE_TESTNET")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            database_path: std::env::var("DATABASE_PATH")
                .unwrap_or_else(|_| DEFAULT_DATABASE_PATH.to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            account_risk_pct: DEFAULT_ACCOUNT_RISK_PCT,
            max_slippage_pct: DEFAULT_MAX_SLIPPAGE_PCT,
            trailing_trigger_pct: DEFAULT_TRAILING_TRIGGER_PCT,
            daily_drawdown_limit: DEFAULT_DAILY_DRAWDOWN_LIMIT,
            ema_period: DEFAULT_EMA_PERIOD,
            ema_deviation_threshold: DEFAULT_EMA_DEVIATION_THRESHOLD,
            volume_anomaly_threshold: DEFAULT_VOLUME_ANOMALY_THRESHOLD,
            api_key: String::new(),
            api_secret: String::new(),
            testnet: false,
            database_path: DEFAULT_DATABASE_PATH.to_string(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("symbols", &self.symbols)
            .field("account_risk_pct", &self.account_risk_pct)
            .field("max_slippage_pct", &self.max_slippage_pct)
            .field("trailing_trigger_pct", &self.trailing_trigger_pct)
            .field("daily_drawdown_limit", &self.daily_drawdown_limit)
            .field("ema_period", &self.ema_period)
            .field("testnet", &self.testnet)
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("database_path", &self.database_path)
            .finish()
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, default, "unparseable numeric env var — using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, default, "unparseable integer env var — using default");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert!((cfg.account_risk_pct - 0.015).abs() < 1e-12);
        assert!((cfg.max_slippage_pct - 0.002).abs() < 1e-12);
        assert!((cfg.trailing_trigger_pct - 0.02).abs() < 1e-12);
        assert!((cfg.daily_drawdown_limit - 0.05).abs() < 1e-12);
        assert_eq!(cfg.ema_period, 20);
        assert!((cfg.ema_deviation_threshold - 0.005).abs() < 1e-12);
        assert!(!cfg.symbols.is_empty());
    }
}
