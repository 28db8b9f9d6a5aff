use crate::{
    cache::{Cached, TtlCache},
    credential::CredentialStore,
    error::LookupError,
    http::{HttpRequest, RateLimitedClient},
    market::{MarketDataGateway, PriceOracle},
};
use futures::{StreamExt, stream};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{ops::RangeInclusive, sync::Arc, time::Duration};
use tracing::debug;

/// Instruments quoting above this native-unit price are treated as corrupt.
const MAX_NATIVE_PRICE: f64 = 1e6;
/// Instruments reporting a larger supply are treated as corrupt.
const MAX_SUPPLY: f64 = 1e15;
/// Accepted market cap range, in the reference currency.
const VALID_MARKET_CAP: RangeInclusive<f64> = 100.0..=1e11;

/// One of the originator's recent instruments that passed the sanity bounds.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InstrumentComponent {
    pub pair_address: Option<SmolStr>,
    pub ticker: SmolStr,
    pub mcap: f64,
    pub supply: f64,
    pub peak_mcap: Option<f64>,
}

/// Average current and peak market cap across an originator's recent instruments.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AggregateMarketCap {
    pub avg_mcap: f64,
    /// `None` when no peak lookup succeeded.
    pub avg_peak_mcap: Option<f64>,
    pub valid_instruments: usize,
    pub components: Vec<InstrumentComponent>,
}

#[derive(Deserialize)]
struct DevTokensResponse {
    #[serde(default)]
    tokens: Vec<DevToken>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DevToken {
    #[serde(default)]
    created_at: String,
    price_sol: Option<f64>,
    supply: Option<f64>,
    pair_address: Option<SmolStr>,
    token_ticker: Option<SmolStr>,
}

impl DevToken {
    /// Value the instrument at `reference_price`, rejecting out-of-bounds inputs.
    fn component(&self, reference_price: f64) -> Option<InstrumentComponent> {
        let price = self
            .price_sol
            .filter(|price| *price > 0.0 && *price <= MAX_NATIVE_PRICE)?;
        let supply = self
            .supply
            .filter(|supply| *supply > 0.0 && *supply <= MAX_SUPPLY)?;

        let mcap = price * supply * reference_price;
        if !VALID_MARKET_CAP.contains(&mcap) {
            return None;
        }

        Some(InstrumentComponent {
            pair_address: self.pair_address.clone().filter(|pair| !pair.is_empty()),
            ticker: self.token_ticker.clone().unwrap_or_else(|| SmolStr::new("???")),
            mcap,
            supply,
            peak_mcap: None,
        })
    }
}

fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));

    (count > 0).then(|| sum / count as f64)
}

/// Computes per-originator [`AggregateMarketCap`]s, fanning out peak lookups to the
/// [`MarketDataGateway`] with bounded concurrency.
#[derive(Debug)]
pub struct AggregationEngine {
    client: RateLimitedClient,
    credentials: Arc<CredentialStore>,
    dev_tokens_url: String,
    origin: String,
    market: Arc<MarketDataGateway>,
    oracle: Arc<PriceOracle>,
    cache: TtlCache<SmolStr, AggregateMarketCap>,
    instrument_count: usize,
    fanout_concurrency: usize,
}

impl AggregationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: RateLimitedClient,
        credentials: Arc<CredentialStore>,
        dev_tokens_url: impl Into<String>,
        origin: impl Into<String>,
        market: Arc<MarketDataGateway>,
        oracle: Arc<PriceOracle>,
        ttl: Duration,
        max_entries: usize,
    ) -> Self {
        Self {
            client,
            credentials,
            dev_tokens_url: dev_tokens_url.into(),
            origin: origin.into(),
            market,
            oracle,
            cache: TtlCache::new(ttl, max_entries),
            instrument_count: 10,
            fanout_concurrency: 10,
        }
    }

    pub fn with_instrument_count(mut self, count: usize) -> Self {
        self.instrument_count = count.max(1);
        self
    }

    pub fn with_fanout_concurrency(mut self, concurrency: usize) -> Self {
        self.fanout_concurrency = concurrency.max(1);
        self
    }

    pub async fn aggregate(&self, originator: &str) -> Result<Cached<AggregateMarketCap>, LookupError> {
        self.cache
            .get_or_try_fetch(SmolStr::new(originator), || self.compute(originator))
            .await
    }

    async fn compute(&self, originator: &str) -> Result<AggregateMarketCap, LookupError> {
        let instruments = self.fetch_instruments(originator).await?;
        if instruments.is_empty() {
            return Err(LookupError::NoInstruments);
        }

        let reference_price = self.oracle.price().await;

        let mut components = instruments
            .iter()
            .sorted_by(|a, b| b.created_at.cmp(&a.created_at))
            .take(self.instrument_count)
            .filter_map(|instrument| instrument.component(reference_price))
            .collect::<Vec<_>>();

        if components.is_empty() {
            return Err(LookupError::NoValidInstruments);
        }

        let lookups = components
            .iter()
            .enumerate()
            .filter_map(|(index, component)| {
                component
                    .pair_address
                    .clone()
                    .map(|pair| (index, pair, component.supply))
            })
            .collect::<Vec<_>>();

        let peaks = stream::iter(lookups)
            .map(|(index, pair, supply)| async move {
                match self.market.peak_market_cap(&pair, supply).await {
                    Ok(peak) => Some((index, peak.value)),
                    Err(error) => {
                        debug!(%pair, %error, "peak lookup failed, excluded from average");
                        None
                    }
                }
            })
            .buffer_unordered(self.fanout_concurrency)
            .filter_map(std::future::ready)
            .collect::<Vec<_>>()
            .await;

        for (index, peak) in peaks {
            components[index].peak_mcap = Some(peak);
        }

        let aggregate = AggregateMarketCap {
            avg_mcap: mean(components.iter().map(|component| component.mcap)).unwrap_or_default(),
            avg_peak_mcap: mean(components.iter().filter_map(|component| component.peak_mcap)),
            valid_instruments: components.len(),
            components,
        };

        debug!(
            %originator,
            avg_mcap = aggregate.avg_mcap,
            avg_peak_mcap = ?aggregate.avg_peak_mcap,
            valid = aggregate.valid_instruments,
            "originator aggregate computed"
        );

        Ok(aggregate)
    }

    async fn fetch_instruments(&self, originator: &str) -> Result<Vec<DevToken>, LookupError> {
        let response = self
            .client
            .execute_authorized(&self.credentials, |credential| {
                credential.authorize(
                    HttpRequest::get(self.dev_tokens_url.as_str())
                        .with_query("devAddress", originator)
                        .with_header("Origin", self.origin.as_str()),
                )
            })
            .await?;

        if !response.is_success() {
            return Err(LookupError::from_status(response.status));
        }

        Ok(response.json::<DevTokensResponse>()?.tokens)
    }
}
