//! Access token caching with refresh ahead of expiry.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::info;

use super::oauth::{Audience, OAuth2Client};
use super::secure::SecureString;
use crate::error::AuthError;
use crate::iso8601;

/// A token together with its expiry.
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub secret: SecureString,
    pub expires_at: DateTime<Utc>,
}

impl CachedToken {
    /// True if the token is still usable `margin` from `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expires_at - margin > now
    }

    /// Time left until expiry, zero when already expired.
    pub fn time_remaining(&self, now: DateTime<Utc>) -> Duration {
        if self.expires_at > now {
            self.expires_at - now
        } else {
            Duration::zero()
        }
    }
}

/// Hands out bearer tokens per audience, refreshing them before they expire.
///
/// The lock is held across a refresh so concurrent workers share one token
/// request instead of racing the token endpoint.
pub struct TokenManager {
    oauth_client: OAuth2Client,
    refresh_before: Duration,
    cache: Mutex<HashMap<Audience, CachedToken>>,
}

impl TokenManager {
    pub fn new(oauth_client: OAuth2Client, refresh_before_expiry_seconds: u64) -> Self {
        Self {
            oauth_client,
            refresh_before: Duration::seconds(refresh_before_expiry_seconds as i64),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Get a bearer token for `audience`.
    pub async fn access_token(&self, audience: Audience) -> Result<SecureString, AuthError> {
        let mut cache = self.cache.lock().await;
        let now = Utc::now();

        if let Some(token) = cache.get(&audience) {
            if token.is_fresh(now, self.refresh_before) {
                return Ok(token.secret.clone());
            }
        }

        let response = self.oauth_client.client_credentials_token(audience).await?;
        let token = CachedToken {
            secret: response.access_token,
            expires_at: now + Duration::seconds(response.expires_in as i64),
        };

        info!(
            "Acquired {:?} token, valid for {}",
            audience,
            iso8601::humanize(token.time_remaining(now))
        );

        let secret = token.secret.clone();
        cache.insert(audience, token);
        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_expiring_in(minutes: i64) -> CachedToken {
        CachedToken {
            secret: SecureString::new("t".into()),
            expires_at: Utc::now() + Duration::minutes(minutes),
        }
    }

    #[test]
    fn test_token_freshness_respects_margin() {
        let now = Utc::now();
        let margin = Duration::minutes(5);

        assert!(token_expiring_in(60).is_fresh(now, margin));
        assert!(!token_expiring_in(3).is_fresh(now, margin));
        assert!(!token_expiring_in(-1).is_fresh(now, margin));
    }

    #[test]
    fn test_time_remaining() {
        let now = Utc::now();
        assert!(token_expiring_in(30).time_remaining(now).num_minutes() >= 29);
        assert_eq!(token_expiring_in(-10).time_remaining(now), Duration::zero());
    }
}
