//! Fee rate provider with an optional HTTP oracle.
//!
//! Three static rates and an absolute ceiling come from configuration.
//! When an oracle URL is set, its published rates take precedence, capped
//! at the ceiling; any fetch or parse failure falls back to the statics.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::RwLock;

use crate::types::FeeLevel;

/// How long a fetched oracle document stays fresh.
const ORACLE_CACHE_TTL: Duration = Duration::from_secs(600);

/// Oracle fetch timeout.
const ORACLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Rate document returned by the fee oracle.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct OracleRates {
    #[serde(rename = "fastestFee")]
    pub fastest: u64,
    #[serde(rename = "halfHourFee")]
    pub half_hour: u64,
    #[serde(rename = "hourFee")]
    pub hour: u64,
}

/// Fee-per-byte provider.
pub struct FeeProvider {
    max_fee: u64,
    priority: u64,
    normal: u64,
    economic: u64,
    oracle_url: Option<String>,
    client: reqwest::Client,
    cache: RwLock<Option<(Instant, OracleRates)>>,
}

impl FeeProvider {
    pub fn new(
        max_fee: u64,
        priority: u64,
        normal: u64,
        economic: u64,
        oracle_url: Option<String>,
    ) -> Self {
        Self {
            max_fee,
            priority,
            normal,
            economic,
            oracle_url,
            client: reqwest::Client::new(),
            cache: RwLock::new(None),
        }
    }

    /// Current satoshi-per-byte rate for a level, never above the ceiling.
    pub async fn fee_per_byte(&self, level: FeeLevel) -> u64 {
        let (priority, normal, economic) = match self.oracle_rates().await {
            Some(rates) => (rates.fastest, rates.half_hour, rates.hour),
            None => (self.priority, self.normal, self.economic),
        };
        let rate = match level {
            FeeLevel::Priority => priority,
            FeeLevel::Normal => normal,
            FeeLevel::Economic => economic,
            FeeLevel::FeeBump => std::cmp::max(priority * 2, priority + 20),
        };
        std::cmp::min(rate, self.max_fee)
    }

    /// The configured ceiling.
    pub fn max_fee(&self) -> u64 {
        self.max_fee
    }

    async fn oracle_rates(&self) -> Option<OracleRates> {
        let url = self.oracle_url.as_deref()?;
        if let Some((fetched, rates)) = *self.cache.read().await {
            if fetched.elapsed() < ORACLE_CACHE_TTL {
                return Some(rates);
            }
        }
        match self.fetch_oracle(url).await {
            Ok(rates) => {
                *self.cache.write().await = Some((Instant::now(), rates));
                Some(rates)
            }
            Err(e) => {
                tracing::warn!("Fee oracle fetch failed, using static rates: {}", e);
                None
            }
        }
    }

    async fn fetch_oracle(&self, url: &str) -> Result<OracleRates, reqwest::Error> {
        self.client
            .get(url)
            .timeout(ORACLE_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json::<OracleRates>()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_provider(max_fee: u64) -> FeeProvider {
        FeeProvider::new(max_fee, 360, 320, 280, None)
    }

    #[tokio::test]
    async fn static_rates_per_level() {
        let fp = static_provider(2000);
        assert_eq!(fp.fee_per_byte(FeeLevel::Priority).await, 360);
        assert_eq!(fp.fee_per_byte(FeeLevel::Normal).await, 320);
        assert_eq!(fp.fee_per_byte(FeeLevel::Economic).await, 280);
        // max(360 * 2, 360 + 20)
        assert_eq!(fp.fee_per_byte(FeeLevel::FeeBump).await, 720);
    }

    #[tokio::test]
    async fn ceiling_caps_every_level() {
        let fp = static_provider(100);
        for level in [FeeLevel::Priority, FeeLevel::Normal, FeeLevel::Economic, FeeLevel::FeeBump] {
            assert_eq!(fp.fee_per_byte(level).await, 100);
        }
    }

    #[tokio::test]
    async fn cached_oracle_rates_take_precedence() {
        let fp = FeeProvider::new(
            2000,
            360,
            320,
            280,
            Some("http://127.0.0.1:1/fees".into()),
        );
        *fp.cache.write().await = Some((
            Instant::now(),
            OracleRates {
                fastest: 450,
                half_hour: 420,
                hour: 390,
            },
        ));
        assert_eq!(fp.fee_per_byte(FeeLevel::Priority).await, 450);
        assert_eq!(fp.fee_per_byte(FeeLevel::Normal).await, 420);
        assert_eq!(fp.fee_per_byte(FeeLevel::Economic).await, 390);
        // max(450 * 2, 450 + 20)
        assert_eq!(fp.fee_per_byte(FeeLevel::FeeBump).await, 900);
    }

    #[tokio::test]
    async fn unreachable_oracle_falls_back_to_statics() {
        let fp = FeeProvider::new(
            2000,
            360,
            320,
            280,
            Some("http://127.0.0.1:1/fees".into()),
        );
        assert_eq!(fp.fee_per_byte(FeeLevel::Normal).await, 320);
    }

    #[test]
    fn oracle_document_parses() {
        let rates: OracleRates =
            serde_json::from_str(r#"{"fastestFee":450,"halfHourFee":420,"hourFee":390}"#).unwrap();
        assert_eq!(rates.fastest, 450);
        assert_eq!(rates.half_hour, 420);
        assert_eq!(rates.hour, 390);
    }
}
