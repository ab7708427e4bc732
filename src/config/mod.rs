pub mod settings;

pub use settings::{Config, TickerSource};

use crate::error::ArbError;
use std::sync::Arc;

/// Loads `.env` (if present), reads the environment and validates the result.
pub fn load_config() -> Result<Arc<settings::Config>, ArbError> {
    dotenv::dotenv().ok();

    let config = settings::Config::from_env();
    config.validate_and_log()?;

    Ok(Arc::new(config))
}
