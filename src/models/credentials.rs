use serde::Deserialize;
use std::fmt;
use utoipa::ToSchema;

/// Upstream feed credentials
///
/// Supplied by the credential collaborator (HTTP endpoint or environment).
/// Never serialized back out and never printed in full.
#[derive(Clone, PartialEq, Eq, Deserialize, ToSchema)]
pub struct UpstreamCredentials {
    pub feed_token: String,
    #[serde(alias = "angel_client_id", alias = "clientCode")]
    pub client_code: String,
    #[serde(alias = "angel_api_key", alias = "apiKey")]
    pub api_key: String,
}

impl UpstreamCredentials {
    pub fn new(
        feed_token: impl Into<String>,
        client_code: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            feed_token: feed_token.into(),
            client_code: client_code.into(),
            api_key: api_key.into(),
        }
    }

    /// Read `FEED_TOKEN`, `FEED_CLIENT_CODE` and `FEED_API_KEY`
    pub fn from_env() -> Option<Self> {
        let feed_token = std::env::var("FEED_TOKEN").ok()?;
        let client_code = std::env::var("FEED_CLIENT_CODE").ok()?;
        let api_key = std::env::var("FEED_API_KEY").ok()?;

        let credentials = Self::new(feed_token, client_code, api_key);
        credentials.is_complete().then_some(credentials)
    }

    /// All three fields present after trimming
    pub fn is_complete(&self) -> bool {
        !self.feed_token.trim().is_empty()
            && !self.client_code.trim().is_empty()
            && !self.api_key.trim().is_empty()
    }
}

// Secrets stay out of logs
impl fmt::Debug for UpstreamCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamCredentials")
            .field("feed_token", &mask(&self.feed_token))
            .field("client_code", &self.client_code)
            .field("api_key", &mask(&self.api_key))
            .finish()
    }
}

/// Keep the last four characters of a secret
pub fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}
