//! Display-only price conversion. Nothing in the relay path depends on it.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::chain_adapter::http_error;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Asset {
    Ton,
    Ethereum,
}

impl Asset {
    pub fn coingecko_id(&self) -> &'static str {
        match self {
            Asset::Ton => "the-open-network",
            Asset::Ethereum => "ethereum",
        }
    }

    /// Decimal places of the asset's smallest unit.
    pub fn decimals(&self) -> u32 {
        match self {
            Asset::Ton => 9,
            Asset::Ethereum => 18,
        }
    }

    /// Rounds `amount` to what the asset can represent.
    pub fn round(&self, amount: f64) -> f64 {
        let scale = 10f64.powi(self.decimals() as i32);
        (amount * scale).round() / scale
    }
}

impl FromStr for Asset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ton" | "the-open-network" => Ok(Asset::Ton),
            "eth" | "ethereum" => Ok(Asset::Ethereum),
            other => Err(Error::Config(format!("Unknown asset: {}", other))),
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Ton => f.write_str("TON"),
            Asset::Ethereum => f.write_str("ETH"),
        }
    }
}

#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Converts `amount` of `from` into `to` at current market prices.
    async fn convert(&self, amount: f64, from: Asset, to: Asset) -> Result<f64>;
}

#[derive(Debug, Deserialize)]
struct Quote {
    usd: Option<f64>,
}

/// CoinGecko `simple/price` client.
#[derive(Debug, Clone)]
pub struct CoinGeckoOracle {
    client: Client,
    api_url: String,
}

impl CoinGeckoOracle {
    pub fn new(api_url: &str) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn usd_prices(&self, assets: &[Asset]) -> Result<HashMap<Asset, f64>> {
        let ids = assets
            .iter()
            .map(|a| a.coingecko_id())
            .collect::<Vec<_>>()
            .join(",");
        let response = self
            .client
            .get(format!("{}/simple/price", self.api_url))
            .query(&[("ids", ids.as_str()), ("vs_currencies", "usd")])
            .send()
            .await
            .map_err(|e| http_error("simple/price", e))?
            .error_for_status()
            .map_err(|e| http_error("simple/price", e))?;
        let quotes: HashMap<String, Quote> = response
            .json()
            .await
            .map_err(|e| http_error("simple/price", e))?;

        let mut prices = HashMap::new();
        for asset in assets {
            let price = quotes
                .get(asset.coingecko_id())
                .and_then(|q| q.usd)
                .ok_or_else(|| Error::Chain(format!("No USD price for {}", asset)))?;
            prices.insert(*asset, price);
        }
        Ok(prices)
    }
}

#[async_trait]
impl PriceOracle for CoinGeckoOracle {
    async fn convert(&self, amount: f64, from: Asset, to: Asset) -> Result<f64> {
        if from == to {
            return Ok(amount);
        }
        let prices = self.usd_prices(&[from, to]).await?;
        let price = |asset: Asset| {
            prices
                .get(&asset)
                .copied()
                .ok_or_else(|| Error::Chain(format!("No USD price for {}", asset)))
        };
        let (from_usd, to_usd) = (price(from)?, price(to)?);
        if to_usd <= 0.0 {
            return Err(Error::Chain(format!("Non-positive USD price for {}", to)));
        }
        Ok(to.round(amount * from_usd / to_usd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    async fn quote(server: &mut mockito::Server, ids: &str) -> mockito::Mock {
        server
            .mock("GET", "/simple/price")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("ids".into(), ids.into()),
                Matcher::UrlEncoded("vs_currencies".into(), "usd".into()),
            ]))
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "the-open-network": {"usd": 5.0},
                    "ethereum": {"usd": 2500.0}
                })
                .to_string(),
            )
            .create_async()
            .await
    }

    #[tokio::test]
    async fn converts_both_ways() {
        let mut server = mockito::Server::new_async().await;
        let _ton_eth = quote(&mut server, "the-open-network,ethereum").await;
        let _eth_ton = quote(&mut server, "ethereum,the-open-network").await;
        let oracle = CoinGeckoOracle::new(&server.url());

        let eth = oracle.convert(10.0, Asset::Ton, Asset::Ethereum).await.unwrap();
        assert_eq!(eth, 0.02);
        let ton = oracle.convert(1.0, Asset::Ethereum, Asset::Ton).await.unwrap();
        assert_eq!(ton, 500.0);
    }

    #[tokio::test]
    async fn missing_price_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/simple/price")
            .match_query(Matcher::Any)
            .with_body(json!({"ethereum": {"usd": 2500.0}}).to_string())
            .create_async()
            .await;
        let oracle = CoinGeckoOracle::new(&server.url());
        assert!(matches!(
            oracle.convert(1.0, Asset::Ton, Asset::Ethereum).await,
            Err(Error::Chain(_))
        ));
    }

    #[tokio::test]
    async fn rate_limit_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/simple/price")
            .match_query(Matcher::Any)
            .with_status(429)
            .create_async()
            .await;
        let oracle = CoinGeckoOracle::new(&server.url());
        let err = oracle.convert(1.0, Asset::Ton, Asset::Ethereum).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn parses_asset_names() {
        assert_eq!("TON".parse::<Asset>().unwrap(), Asset::Ton);
        assert_eq!("ethereum".parse::<Asset>().unwrap(), Asset::Ethereum);
        assert!("doge".parse::<Asset>().is_err());
        assert_eq!(Asset::Ton.round(1.23456789012), 1.23456789);
    }
}
