use crate::{
    cache::{Cached, TtlCache},
    credential::CredentialStore,
    error::LookupError,
    http::{HttpRequest, RateLimitedClient},
};
use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use smol_str::SmolStr;
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Price-chart lookback used to find the peak.
const CHART_LOOKBACK_DAYS: i64 = 30;
const CHART_INTERVAL: &str = "15m";
const CHART_BAR_COUNT: u32 = 300;

/// Keys under which a chart payload may nest its bar list.
const BAR_CONTAINER_KEYS: [&str; 6] = ["bars", "data", "chart", "candles", "ohlc", "result"];

/// Reference rate used until the oracle answers for the first time.
pub const DEFAULT_REFERENCE_PRICE: f64 = 150.0;

/// Locate the bar list inside a chart payload.
///
/// Accepts a bare list, or an object holding the list under one of
/// [`BAR_CONTAINER_KEYS`] (falling back to the first list-valued field).
pub fn extract_bars(payload: &Value) -> &[Value] {
    match payload {
        Value::Array(bars) => bars,
        Value::Object(object) => BAR_CONTAINER_KEYS
            .iter()
            .filter_map(|key| object.get(*key).and_then(Value::as_array))
            .chain(object.values().filter_map(Value::as_array))
            .next()
            .map(Vec::as_slice)
            .unwrap_or_default(),
        _ => &[],
    }
}

/// Highest of `high` and `close` for one bar, either `[t, o, h, l, c, v]` or an object
/// with `h`/`high` and `c`/`close` fields. Unreadable bars count as zero.
pub fn bar_peak(bar: &Value) -> f64 {
    let (high, close) = match bar {
        Value::Array(fields) if fields.len() >= 5 => (fields.get(2), fields.get(4)),
        Value::Object(fields) => (
            fields.get("h").or_else(|| fields.get("high")),
            fields.get("c").or_else(|| fields.get("close")),
        ),
        _ => (None, None),
    };

    number(high).max(number(close))
}

fn number(value: Option<&Value>) -> f64 {
    let parsed = match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.parse().ok(),
        _ => None,
    };

    parsed.filter(|value| value.is_finite()).unwrap_or(0.0)
}

/// Peak price over every bar of a chart payload.
pub fn peak_price(payload: &Value) -> Result<f64, LookupError> {
    let bars = extract_bars(payload);
    if bars.is_empty() {
        return Err(LookupError::NoBars);
    }

    let peak = bars.iter().map(bar_peak).fold(0.0, f64::max);
    if peak <= 0.0 {
        return Err(LookupError::ZeroPrice);
    }

    Ok(peak)
}

/// Historical price-chart lookups, yielding the peak market cap of a pair.
#[derive(Debug)]
pub struct MarketDataGateway {
    client: RateLimitedClient,
    credentials: Arc<CredentialStore>,
    chart_url: String,
    origin: String,
    peaks: TtlCache<(SmolStr, u64), f64>,
}

impl MarketDataGateway {
    pub fn new(
        client: RateLimitedClient,
        credentials: Arc<CredentialStore>,
        api_host: &str,
        origin: impl Into<String>,
        ttl: Duration,
        max_entries: usize,
    ) -> Self {
        Self {
            client,
            credentials,
            chart_url: format!("{}/pair-chart", api_host.trim_end_matches('/')),
            origin: origin.into(),
            peaks: TtlCache::new(ttl, max_entries),
        }
    }

    /// Peak market cap of `pair` for the given circulating `supply`.
    ///
    /// Cached per `(pair, supply)`; `NoBars` and `ZeroPrice` outcomes are not cached.
    pub async fn peak_market_cap(&self, pair: &str, supply: f64) -> Result<Cached<f64>, LookupError> {
        let key = (SmolStr::new(pair), supply.to_bits());
        self.peaks
            .get_or_try_fetch(key, || async {
                let peak = self.fetch_peak_price(pair).await?;
                debug!(%pair, peak, "fetched peak price");
                Ok::<_, LookupError>(peak * supply)
            })
            .await
    }

    async fn fetch_peak_price(&self, pair: &str) -> Result<f64, LookupError> {
        let to = Utc::now();
        let from = to - TimeDelta::days(CHART_LOOKBACK_DAYS);

        let response = self
            .client
            .execute_authorized(&self.credentials, |credential| {
                credential.authorize(
                    HttpRequest::get(self.chart_url.as_str())
                        .with_query("pairAddress", pair)
                        .with_query("from", from.timestamp_millis())
                        .with_query("to", to.timestamp_millis())
                        .with_query("currency", "USD")
                        .with_query("interval", CHART_INTERVAL)
                        .with_query("countBars", CHART_BAR_COUNT)
                        .with_header("Origin", self.origin.as_str())
                        .with_header("Referer", format!("{}/", self.origin)),
                )
            })
            .await?;

        if !response.is_success() {
            return Err(LookupError::from_status(response.status));
        }

        peak_price(&response.json::<Value>()?)
    }
}

#[derive(Deserialize)]
struct OracleResponse {
    solana: OracleQuote,
}

#[derive(Deserialize)]
struct OracleQuote {
    usd: f64,
}

/// Cached reference rate (quote currency per native unit) used to value instruments.
///
/// A failed refresh falls back to the last known rate.
#[derive(Debug)]
pub struct PriceOracle {
    client: RateLimitedClient,
    url: String,
    cache: TtlCache<(), f64>,
    last_known: Mutex<f64>,
}

impl PriceOracle {
    pub fn new(client: RateLimitedClient, url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            cache: TtlCache::new(ttl, 1),
            last_known: Mutex::new(DEFAULT_REFERENCE_PRICE),
        }
    }

    pub async fn price(&self) -> f64 {
        match self.cache.get_or_try_fetch((), || self.fetch()).await {
            Ok(price) => {
                if !price.cached {
                    *self.last_known.lock() = price.value;
                }
                price.value
            }
            Err(error) => {
                let fallback = *self.last_known.lock();
                warn!(%error, fallback, "reference price unavailable, using last known");
                fallback
            }
        }
    }

    async fn fetch(&self) -> Result<f64, LookupError> {
        let request = HttpRequest::get(self.url.as_str()).with_timeout(Duration::from_secs(3));
        let response = self.client.execute(&request).await?;
        if !response.is_success() {
            return Err(LookupError::from_status(response.status));
        }

        let price = response.json::<OracleResponse>()?.solana.usd;
        if price.is_finite() && price > 0.0 {
            Ok(price)
        } else {
            Err(LookupError::ZeroPrice)
        }
    }
}
