use super::types::{Coin, CoinPair};
use crate::config::Config;

/// Taker fee per pair. Pairs quoted in the exchange's native token get the discounted rate.
#[derive(Debug, Clone, PartialEq)]
pub struct FeeSchedule {
    pub taker_fee: f64,
    pub native_token: Coin,
    pub native_token_fee: f64,
}

impl FeeSchedule {
    pub fn from_config(config: &Config) -> Self {
        FeeSchedule {
            taker_fee: config.taker_fee,
            native_token: Coin::new(config.native_token.clone()),
            native_token_fee: config.native_token_fee,
        }
    }

    /// No fees at all; used for pure price simulations.
    pub fn zero() -> Self {
        FeeSchedule {
            taker_fee: 0.0,
            native_token: Coin::new(""),
            native_token_fee: 0.0,
        }
    }

    pub fn fee_for(&self, pair: &CoinPair) -> f64 {
        if pair.quote == self.native_token {
            self.native_token_fee
        } else {
            self.taker_fee
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_quote_gets_discount() {
        let fees = FeeSchedule::from_config(&Config::default());
        assert_eq!(fees.fee_for(&CoinPair::new("ADA", "BNB")), 0.0005);
        assert_eq!(fees.fee_for(&CoinPair::new("BNB", "BTC")), 0.001);
        assert_eq!(fees.fee_for(&CoinPair::new("ETH", "BTC")), 0.001);
    }
}
