use super::{parse_value, ObservedAt, RawSample, SampleSource, SourceError};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_CLOUD_BASE_URL: &str = "https://io.adafruit.com/api/v2";
const KEY_HEADER: &str = "X-AIO-Key";

#[derive(Clone)]
pub struct CloudFeedSettings {
    pub base_url: String,
    pub username: String,
    pub key: String,
    pub timeout: Duration,
}

impl fmt::Debug for CloudFeedSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudFeedSettings")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("key", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Polls `GET {base}/{username}/feeds/{metric}/data/last` on a hosted feed service.
#[derive(Clone)]
pub struct CloudFeedSource {
    client: Client,
    base_url: String,
    username: String,
    key: String,
}

#[derive(Debug, Deserialize)]
struct FeedDatum<'a> {
    value: FeedValue,
    #[serde(borrow)]
    created_at: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedValue {
    Number(f64),
    Text(String),
}

impl CloudFeedSource {
    pub fn new(settings: CloudFeedSettings) -> Result<Self, SourceError> {
        let client = Client::builder().timeout(settings.timeout).build()?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            username: settings.username,
            key: settings.key,
        })
    }

    fn feed_url(&self, metric: &str) -> String {
        format!(
            "{}/{}/feeds/{}/data/last",
            self.base_url, self.username, metric
        )
    }
}

/// Decodes a `data/last` payload. A JSON `null` body means the feed is empty.
pub fn decode_feed_payload(
    metric: &str,
    payload: &mut [u8],
) -> Result<Option<RawSample>, SourceError> {
    let datum: Option<FeedDatum> = simd_json::serde::from_slice(payload)
        .map_err(|err| SourceError::Decode(format!("feed {metric}: {err}")))?;
    let Some(datum) = datum else {
        return Ok(None);
    };

    let value = match datum.value {
        FeedValue::Number(value) => value,
        FeedValue::Text(raw) => parse_value(&raw)?,
    };
    let observed_at = ObservedAt::parse(datum.created_at)?;

    Ok(Some(RawSample {
        metric: metric.to_string(),
        value,
        observed_at,
    }))
}

#[async_trait]
impl SampleSource for CloudFeedSource {
    async fn fetch_latest(&self, metric: &str) -> Result<Option<RawSample>, SourceError> {
        let response = self
            .client
            .get(self.feed_url(metric))
            .header(KEY_HEADER, &self.key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                metric: metric.to_string(),
                status,
            });
        }

        let mut body = response.bytes().await?.to_vec();
        decode_feed_payload(metric, &mut body)
    }
}
