//! Weather forecast providers.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::recommend::Forecast;

#[async_trait]
pub trait ForecastProvider: Send + Sync {
    async fn get_forecast(&self, latitude: f64, longitude: f64) -> Result<Forecast>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenMeteo,
    Static,
    /// No provider; recommendations always run on sensor data alone.
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ForecastSettings {
    pub provider: ProviderKind,
    pub base_url: String,
    pub timeout_ms: u64,
    /// Values served by the static provider.
    pub temperature_c: f64,
    pub humidity_pct: f64,
    pub wind_kph: f64,
    pub rainfall_mm_next_24h: f64,
}

impl Default for ForecastSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenMeteo,
            base_url: "https://api.open-meteo.com".into(),
            timeout_ms: 3_000,
            temperature_c: 22.0,
            humidity_pct: 50.0,
            wind_kph: 5.0,
            rainfall_mm_next_24h: 0.0,
        }
    }
}

impl ForecastSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn build(&self) -> Option<Arc<dyn ForecastProvider>> {
        match self.provider {
            ProviderKind::OpenMeteo => Some(Arc::new(OpenMeteo::new(&self.base_url, self.timeout()))),
            ProviderKind::Static => Some(Arc::new(StaticForecast(Forecast {
                temperature_c: self.temperature_c,
                humidity_pct: self.humidity_pct,
                wind_kph: self.wind_kph,
                rainfall_mm_next_24h: self.rainfall_mm_next_24h,
            }))),
            ProviderKind::Disabled => None,
        }
    }
}

/// Serves the same forecast for every location.
pub struct StaticForecast(pub Forecast);

#[async_trait]
impl ForecastProvider for StaticForecast {
    async fn get_forecast(&self, _latitude: f64, _longitude: f64) -> Result<Forecast> {
        Ok(self.0.clone())
    }
}

/// Client for the Open-Meteo `/v1/forecast` endpoint.
pub struct OpenMeteo {
    base_url: String,
    client: reqwest::Client,
}

impl OpenMeteo {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    current: Current,
    hourly: Hourly,
}

#[derive(Debug, Deserialize)]
struct Current {
    time: String,
    temperature_2m: f64,
    relative_humidity_2m: f64,
    wind_speed_10m: f64,
}

#[derive(Debug, Deserialize)]
struct Hourly {
    time: Vec<String>,
    precipitation: Vec<Option<f64>>,
}

#[async_trait]
impl ForecastProvider for OpenMeteo {
    async fn get_forecast(&self, latitude: f64, longitude: f64) -> Result<Forecast> {
        let url = format!("{}/v1/forecast", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("latitude", latitude.to_string()),
                ("longitude", longitude.to_string()),
                (
                    "current",
                    "temperature_2m,relative_humidity_2m,wind_speed_10m".to_string(),
                ),
                ("hourly", "precipitation".to_string()),
                ("forecast_days", "2".to_string()),
            ])
            .send()
            .await
            .context("forecast request failed")?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("forecast provider returned {status}"));
        }
        let body: OpenMeteoResponse = resp.json().await.context("invalid forecast response")?;
        summarize(body)
    }
}

/// Current conditions plus precipitation summed over the 24 hours starting
/// at the current hour.
fn summarize(resp: OpenMeteoResponse) -> Result<Forecast> {
    let Hourly {
        time,
        precipitation,
    } = resp.hourly;
    if time.len() != precipitation.len() {
        return Err(anyhow!(
            "hourly series length mismatch: {} times, {} values",
            time.len(),
            precipitation.len()
        ));
    }
    // Both series use the same ISO-8601 layout, so string order is time order.
    let now = resp.current.time.as_str();
    let hour = now.get(..13).unwrap_or(now);
    let rain: f64 = time
        .iter()
        .zip(precipitation)
        .skip_while(|(t, _)| t.get(..13).unwrap_or(t.as_str()) < hour)
        .take(24)
        .filter_map(|(_, mm)| mm)
        .sum();

    Ok(Forecast {
        temperature_c: resp.current.temperature_2m,
        humidity_pct: resp.current.relative_humidity_2m,
        wind_kph: resp.current.wind_speed_10m,
        rainfall_mm_next_24h: rain,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hours(day: u32, from: u32, to: u32) -> Vec<String> {
        (from..to).map(|h| format!("2026-06-{day:02}T{h:02}:00")).collect()
    }

    #[test]
    fn sums_rain_from_current_hour() {
        let mut time = hours(1, 0, 24);
        time.extend(hours(2, 0, 24));
        // 0.5mm every hour, 3mm at 11:00 (before "now") is ignored.
        let mut precipitation: Vec<Option<f64>> = vec![Some(0.5); 48];
        precipitation[11] = Some(3.0);
        precipitation[20] = None;

        let resp: OpenMeteoResponse = serde_json::from_value(json!({
            "current": {
                "time": "2026-06-01T12:15",
                "temperature_2m": 31.4,
                "relative_humidity_2m": 40.0,
                "wind_speed_10m": 12.0
            },
            "hourly": { "time": time, "precipitation": precipitation }
        }))
        .unwrap();

        let f = summarize(resp).unwrap();
        assert_eq!(f.temperature_c, 31.4);
        assert_eq!(f.wind_kph, 12.0);
        // 24 hours from 12:00, one of them missing.
        assert!((f.rainfall_mm_next_24h - 23.0 * 0.5).abs() < 1e-9);
    }

    #[test]
    fn mismatched_series_is_an_error() {
        let resp: OpenMeteoResponse = serde_json::from_value(json!({
            "current": {
                "time": "2026-06-01T12:00",
                "temperature_2m": 20.0,
                "relative_humidity_2m": 50.0,
                "wind_speed_10m": 3.0
            },
            "hourly": { "time": ["2026-06-01T12:00"], "precipitation": [] }
        }))
        .unwrap();
        assert!(summarize(resp).is_err());
    }

    #[tokio::test]
    async fn static_provider_and_settings() {
        let settings: ForecastSettings = toml::from_str(
            r#"
            provider = "static"
            rainfall_mm_next_24h = 7.5
            "#,
        )
        .unwrap();
        let provider = settings.build().unwrap();
        let f = provider.get_forecast(0.0, 0.0).await.unwrap();
        assert_eq!(f.rainfall_mm_next_24h, 7.5);
        assert_eq!(f.humidity_pct, 50.0);

        let off: ForecastSettings = toml::from_str(r#"provider = "disabled""#).unwrap();
        assert!(off.build().is_none());
    }
}
