use crate::error::ArbError;
use crate::protocol::Command;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// Where the brain gets its ticker snapshots from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickerSource {
    /// Round-robin through registered collectors
    Collectors,
    /// The brain polls the exchange itself
    Direct,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub exchange: String,
    pub binance_api_url: String,
    pub binance_ws_url: String,
    pub binance_api_key: String,
    pub binance_api_secret: String,
    pub orchestrator_address: String,
    pub connection_receiver_port: u16,
    pub base_port: u16,
    /// exchange -> command -> minimum interval between requests, in microseconds
    pub fetch_delays_micros: HashMap<String, HashMap<String, u64>>,
    /// exchange -> symbols whose depth is tracked
    pub depth_pairs: HashMap<String, Vec<String>>,
    pub depth_limit: u32,
    pub ticker_source: TickerSource,
    pub tickers_update_period_micros: u64,
    pub arb_staleness_threshold_micros: u64,
    pub reaper_tick_micros: u64,
    pub scan_interval_micros: u64,
    pub min_profit_relative: f64,
    pub min_frames_seen: u32,
    pub taker_fee: f64,
    pub native_token: String,
    pub native_token_fee: f64,
    pub execution_enabled: bool,
    pub execution_test_mode: bool,
    pub exchange_info_refresh_secs: u64,
    pub account_refresh_secs: u64,
    pub user_stream_keepalive_secs: u64,
    pub event_log_path: String,
    pub event_queue_size: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: "binance".to_string(),
            binance_api_url: "https://api.binance.com".to_string(),
            binance_ws_url: "wss://stream.binance.com:9443/ws".to_string(),
            binance_api_key: String::new(),
            binance_api_secret: String::new(),
            orchestrator_address: "127.0.0.1".to_string(),
            connection_receiver_port: 7000,
            base_port: 7100,
            fetch_delays_micros: parse_fetch_delays(
                "binance:ticker-request:50000,binance:depth-request:100000",
            ),
            depth_pairs: parse_depth_pairs("binance:ETHBTC"),
            depth_limit: 100,
            ticker_source: TickerSource::Collectors,
            tickers_update_period_micros: 200_000,
            arb_staleness_threshold_micros: 1_000_000,
            reaper_tick_micros: 100_000,
            scan_interval_micros: 0,
            min_profit_relative: 0.0,
            min_frames_seen: 2,
            taker_fee: 0.001,
            native_token: "BNB".to_string(),
            native_token_fee: 0.0005,
            execution_enabled: false,
            execution_test_mode: true,
            exchange_info_refresh_secs: 60,
            account_refresh_secs: 60,
            user_stream_keepalive_secs: 1800,
            event_log_path: "events.jsonl".to_string(),
            event_queue_size: 1000,
            log_level: "info".to_string(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Parses `exchange:command:micros` triples separated by commas.
pub fn parse_fetch_delays(raw: &str) -> HashMap<String, HashMap<String, u64>> {
    let mut delays: HashMap<String, HashMap<String, u64>> = HashMap::new();
    for part in raw.split(',') {
        let mut kv = part.split(':');
        let (Some(exchange), Some(command), Some(micros)) = (kv.next(), kv.next(), kv.next()) else {
            continue;
        };
        let Ok(micros) = micros.trim().parse::<u64>() else {
            log::warn!("Ignoring malformed fetch delay entry '{}'", part);
            continue;
        };
        delays
            .entry(exchange.trim().to_string())
            .or_default()
            .insert(command.trim().to_string(), micros);
    }
    delays
}

/// Parses `exchange:SYMBOL` pairs separated by commas.
pub fn parse_depth_pairs(raw: &str) -> HashMap<String, Vec<String>> {
    let mut pairs: HashMap<String, Vec<String>> = HashMap::new();
    for part in raw.split(',') {
        if let Some((exchange, symbol)) = part.split_once(':') {
            let symbol = symbol.trim().to_uppercase();
            if !symbol.is_empty() {
                pairs.entry(exchange.trim().to_string()).or_default().push(symbol);
            }
        }
    }
    pairs
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            exchange: env::var("EXCHANGE").unwrap_or(defaults.exchange),
            binance_api_url: env::var("BINANCE_API_URL").unwrap_or(defaults.binance_api_url),
            binance_ws_url: env::var("BINANCE_WS_URL").unwrap_or(defaults.binance_ws_url),
            binance_api_key: env::var("BINANCE_API_KEY").unwrap_or_default(),
            binance_api_secret: env::var("BINANCE_API_SECRET").unwrap_or_default(),
            orchestrator_address: env::var("ORCHESTRATOR_ADDRESS")
                .unwrap_or(defaults.orchestrator_address),
            connection_receiver_port: env_or(
                "CONNECTION_RECEIVER_PORT",
                defaults.connection_receiver_port,
            ),
            base_port: env_or("BASE_PORT", defaults.base_port),
            fetch_delays_micros: env::var("FETCH_DELAYS_MICROS")
                .ok()
                .map(|s| parse_fetch_delays(&s))
                .unwrap_or(defaults.fetch_delays_micros),
            depth_pairs: env::var("DEPTH_PAIRS")
                .ok()
                .map(|s| parse_depth_pairs(&s))
                .unwrap_or(defaults.depth_pairs),
            depth_limit: env_or("DEPTH_LIMIT", defaults.depth_limit).clamp(5, 100),
            ticker_source: match env::var("TICKER_SOURCE").ok().as_deref() {
                Some("direct") => TickerSource::Direct,
                _ => TickerSource::Collectors,
            },
            tickers_update_period_micros: env_or(
                "TICKERS_UPDATE_PERIOD_MICROS",
                defaults.tickers_update_period_micros,
            ),
            arb_staleness_threshold_micros: env_or(
                "ARB_STALENESS_THRESHOLD_MICROS",
                defaults.arb_staleness_threshold_micros,
            ),
            reaper_tick_micros: env_or("REAPER_TICK_MICROS", defaults.reaper_tick_micros),
            scan_interval_micros: env_or("SCAN_INTERVAL_MICROS", defaults.scan_interval_micros),
            min_profit_relative: env_or("MIN_PROFIT_RELATIVE", defaults.min_profit_relative),
            min_frames_seen: env_or("MIN_FRAMES_SEEN", defaults.min_frames_seen),
            taker_fee: env_or("TAKER_FEE", defaults.taker_fee),
            native_token: env::var("NATIVE_TOKEN").unwrap_or(defaults.native_token),
            native_token_fee: env_or("NATIVE_TOKEN_FEE", defaults.native_token_fee),
            execution_enabled: env_or("EXECUTION_ENABLED", defaults.execution_enabled),
            execution_test_mode: env_or("EXECUTION_TEST_MODE", defaults.execution_test_mode),
            exchange_info_refresh_secs: env_or(
                "EXCHANGE_INFO_REFRESH_SECS",
                defaults.exchange_info_refresh_secs,
            ),
            account_refresh_secs: env_or("ACCOUNT_REFRESH_SECS", defaults.account_refresh_secs),
            user_stream_keepalive_secs: env_or(
                "USER_STREAM_KEEPALIVE_SECS",
                defaults.user_stream_keepalive_secs,
            ),
            event_log_path: env::var("EVENT_LOG_PATH").unwrap_or(defaults.event_log_path),
            event_queue_size: env_or("EVENT_QUEUE_SIZE", defaults.event_queue_size),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }

    pub fn validate(&self) -> Result<(), ArbError> {
        if self.exchange.is_empty() {
            return Err(ArbError::ConfigError("EXCHANGE cannot be empty".to_string()));
        }
        if self.base_port <= self.connection_receiver_port
            && self.connection_receiver_port - self.base_port < 2
        {
            return Err(ArbError::ConfigError(format!(
                "CONNECTION_RECEIVER_PORT {} collides with the collector port range starting at {}",
                self.connection_receiver_port, self.base_port
            )));
        }
        if self.taker_fee < 0.0 || self.taker_fee >= 1.0 {
            return Err(ArbError::ConfigError(format!("TAKER_FEE out of range: {}", self.taker_fee)));
        }
        if self.native_token_fee < 0.0 || self.native_token_fee >= 1.0 {
            return Err(ArbError::ConfigError(format!(
                "NATIVE_TOKEN_FEE out of range: {}",
                self.native_token_fee
            )));
        }
        if self.arb_staleness_threshold_micros == 0 {
            return Err(ArbError::ConfigError(
                "ARB_STALENESS_THRESHOLD_MICROS must be positive".to_string(),
            ));
        }
        if self.execution_enabled
            && (self.binance_api_key.is_empty() || self.binance_api_secret.is_empty())
        {
            return Err(ArbError::ConfigError(
                "EXECUTION_ENABLED requires BINANCE_API_KEY and BINANCE_API_SECRET".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_and_log(&self) -> Result<(), ArbError> {
        self.validate()?;
        log::info!(
            "Configuration loaded: exchange={} receiver_port={} base_port={} ticker_source={:?} staleness={}us min_profit={} min_frames={} execution_enabled={} test_mode={}",
            self.exchange,
            self.connection_receiver_port,
            self.base_port,
            self.ticker_source,
            self.arb_staleness_threshold_micros,
            self.min_profit_relative,
            self.min_frames_seen,
            self.execution_enabled,
            self.execution_test_mode
        );
        Ok(())
    }

    /// Minimum interval between two requests of `command` to `exchange`, across all collectors.
    pub fn fetch_delay(&self, exchange: &str, command: Command) -> Duration {
        let micros = self
            .fetch_delays_micros
            .get(exchange)
            .and_then(|per_command| per_command.get(command.as_str()))
            .copied()
            .unwrap_or(0);
        Duration::from_micros(micros)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_micros(self.arb_staleness_threshold_micros)
    }

    pub fn reaper_tick(&self) -> Duration {
        Duration::from_micros(self.reaper_tick_micros.max(1))
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_micros(self.scan_interval_micros)
    }

    pub fn tickers_update_period(&self) -> Duration {
        Duration::from_micros(self.tickers_update_period_micros)
    }
}
