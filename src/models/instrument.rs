use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

use crate::errors::SubscriptionError;

/// Exchange segment an instrument trades on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExchangeCode {
    /// NSE cash market
    Nse,
    /// NSE futures & options
    Nfo,
    /// BSE cash market
    Bse,
    /// BSE futures & options
    Bfo,
    /// MCX commodities
    Mcx,
    /// NSE currency derivatives
    Cds,
}

impl ExchangeCode {
    /// Numeric `exchangeType` the upstream feed expects in control messages.
    ///
    /// Only NSE, NFO and BSE are mapped. Anything else has no wire code and
    /// must be rejected by the caller.
    pub fn exchange_type(&self) -> Option<u8> {
        match self {
            ExchangeCode::Nse => Some(1),
            ExchangeCode::Nfo => Some(2),
            ExchangeCode::Bse => Some(3),
            ExchangeCode::Bfo | ExchangeCode::Mcx | ExchangeCode::Cds => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeCode::Nse => "NSE",
            ExchangeCode::Nfo => "NFO",
            ExchangeCode::Bse => "BSE",
            ExchangeCode::Bfo => "BFO",
            ExchangeCode::Mcx => "MCX",
            ExchangeCode::Cds => "CDS",
        }
    }
}

impl fmt::Display for ExchangeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeCode {
    type Err = SubscriptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NSE" => Ok(ExchangeCode::Nse),
            "NFO" => Ok(ExchangeCode::Nfo),
            "BSE" => Ok(ExchangeCode::Bse),
            "BFO" => Ok(ExchangeCode::Bfo),
            "MCX" => Ok(ExchangeCode::Mcx),
            "CDS" => Ok(ExchangeCode::Cds),
            _ => Err(SubscriptionError::UnknownExchange(s.to_string())),
        }
    }
}

/// Registry lookup key: exchange segment + exchange-assigned token
///
/// Fields are private so every key goes through [`InstrumentKey::new`],
/// which normalizes the token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, ToSchema)]
pub struct InstrumentKey {
    exchange: ExchangeCode,
    token: String,
}

impl InstrumentKey {
    /// Build a key, trimming the token.
    ///
    /// Empty tokens, embedded null bytes and non-printable characters are rejected.
    pub fn new(exchange: ExchangeCode, token: &str) -> Result<Self, SubscriptionError> {
        let token = normalize_token(token)?;
        Ok(Self { exchange, token })
    }

    pub fn exchange(&self) -> ExchangeCode {
        self.exchange
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.exchange, self.token)
    }
}

/// Trim a token and verify it is usable as a key
pub fn normalize_token(raw: &str) -> Result<String, SubscriptionError> {
    let token = raw.trim();

    if token.is_empty() {
        return Err(SubscriptionError::InvalidToken("token is empty".to_string()));
    }

    if token.contains('\0') {
        return Err(SubscriptionError::InvalidToken(
            "token contains a null byte".to_string(),
        ));
    }

    if !token.chars().all(|c| c.is_ascii_graphic()) {
        return Err(SubscriptionError::InvalidToken(format!(
            "token '{}' contains non-printable characters",
            token.escape_default()
        )));
    }

    Ok(token.to_string())
}
