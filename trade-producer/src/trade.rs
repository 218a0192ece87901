use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const SYMBOLS: &[&str] = &["AAPL", "GOOGL", "MSFT", "AMZN", "TSLA", "META", "NVDA"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeType {
    Buy,
    Sell,
}

/// A simulated trade event, keyed on its account when published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub account_id: String,
    pub trade_id: String,
    pub symbol: String,
    pub trade_type: TradeType,
    pub quantity: u32,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

impl Trade {
    pub fn random<R: Rng + ?Sized>(rng: &mut R, timestamp: DateTime<Utc>) -> Self {
        let symbol = SYMBOLS.choose(rng).copied().unwrap_or("AAPL");
        let trade_type = if rng.gen_bool(0.5) {
            TradeType::Buy
        } else {
            TradeType::Sell
        };
        // Cents precision
        let price = (rng.gen_range(50.0..=500.0_f64) * 100.0).round() / 100.0;

        Self {
            account_id: format!("ACC{}", rng.gen_range(1000..=9999)),
            trade_id: format!("TRD{}", rng.gen_range(100000..=999999)),
            symbol: symbol.to_owned(),
            trade_type,
            quantity: rng.gen_range(1..=1000),
            price,
            timestamp,
        }
    }

    /// Record key: all trades of an account land on the same partition.
    pub fn key(&self) -> &str {
        &self.account_id
    }
}
