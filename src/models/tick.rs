use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// One decoded price update from the upstream feed
///
/// Prices are fixed-point with two fractional digits. `observed_at` is
/// stamped by the decoder, the wire frame carries no timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Exchange token as sent by the feed (no exchange code on the wire)
    pub token: String,
    pub last_traded_price: Decimal,
    pub open: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub close: Option<Decimal>,
    pub observed_at: DateTime<Utc>,
}

impl Tick {
    /// A zero or negative last price cannot come from a real trade.
    /// It means the frame was misaligned, so the tick must not be broadcast.
    pub fn is_valid(&self) -> bool {
        self.last_traded_price > Decimal::ZERO
    }

    /// Broadcast room for this tick's token
    pub fn room(&self) -> String {
        token_room(&self.token)
    }

    pub fn to_market_update(&self) -> MarketUpdate {
        MarketUpdate {
            symbol_token: self.token.clone(),
            ltp: self.last_traded_price,
            open_price: self.open,
            high_price: self.high,
            low_price: self.low,
            close_price: self.close,
            updated_at: self.observed_at,
        }
    }
}

/// Room naming for per-instrument broadcast grouping
pub fn token_room(token: &str) -> String {
    format!("TOKEN:{}", token)
}

/// Outbound tick message delivered to subscriber sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MarketUpdate {
    #[schema(example = "99926000")]
    pub symbol_token: String,
    #[schema(value_type = f64, example = 24510.35)]
    pub ltp: Decimal,
    #[schema(value_type = Option<f64>)]
    pub open_price: Option<Decimal>,
    #[schema(value_type = Option<f64>)]
    pub high_price: Option<Decimal>,
    #[schema(value_type = Option<f64>)]
    pub low_price: Option<Decimal>,
    #[schema(value_type = Option<f64>)]
    pub close_price: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

impl MarketUpdate {
    pub fn room(&self) -> String {
        token_room(&self.symbol_token)
    }
}
