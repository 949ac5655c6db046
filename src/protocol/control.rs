use serde::Serialize;
use std::collections::BTreeMap;

use crate::errors::FeedError;
use crate::models::InstrumentKey;

/// Upstream subscription mode sent in every control message (quote mode)
pub const DEFAULT_MODE: u8 = 2;

/// Control action codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

impl SubscriptionAction {
    pub fn code(&self) -> u8 {
        match self {
            SubscriptionAction::Subscribe => 1,
            SubscriptionAction::Unsubscribe => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionAction::Subscribe => "subscribe",
            SubscriptionAction::Unsubscribe => "unsubscribe",
        }
    }
}

/// Outbound control message
///
/// ```json
/// {"action":1,"params":{"mode":2,"tokenList":[{"exchangeType":1,"tokens":["99926000"]}]}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlRequest {
    pub action: u8,
    pub params: ControlParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlParams {
    pub mode: u8,
    pub token_list: Vec<TokenGroup>,
}

/// All tokens of one exchange type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGroup {
    pub exchange_type: u8,
    pub tokens: Vec<String>,
}

impl ControlRequest {
    /// Build one request grouping `keys` by exchange type
    ///
    /// Returns `Ok(None)` for an empty key list. Fails on the first key whose
    /// exchange has no upstream code; nothing is defaulted.
    pub fn for_instruments(
        action: SubscriptionAction,
        mode: u8,
        keys: &[InstrumentKey],
    ) -> Result<Option<Self>, FeedError> {
        let mut groups: BTreeMap<u8, Vec<String>> = BTreeMap::new();

        for key in keys {
            let exchange_type = key
                .exchange()
                .exchange_type()
                .ok_or(FeedError::UnmappedExchange(key.exchange()))?;

            let tokens = groups.entry(exchange_type).or_default();
            if !tokens.iter().any(|t| t == key.token()) {
                tokens.push(key.token().to_string());
            }
        }

        if groups.is_empty() {
            return Ok(None);
        }

        let token_list = groups
            .into_iter()
            .map(|(exchange_type, tokens)| TokenGroup {
                exchange_type,
                tokens,
            })
            .collect();

        Ok(Some(Self {
            action: action.code(),
            params: ControlParams { mode, token_list },
        }))
    }

    /// Total number of tokens across all groups
    pub fn token_count(&self) -> usize {
        self.params.token_list.iter().map(|g| g.tokens.len()).sum()
    }

    pub fn to_json(&self) -> Result<String, FeedError> {
        Ok(serde_json::to_string(self)?)
    }
}
