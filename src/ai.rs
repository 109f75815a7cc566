//! Summary and sentiment helpers used by subgraph resolvers. Failures here
//! never fail the caller: every call has a documented fallback.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_SUMMARY_URL: &str = "http://localhost:5003/summarize";
pub const DEFAULT_SENTIMENT_URL: &str = "http://127.0.0.1:5002/sentiment";
pub const DEFAULT_AI_TIMEOUT: Duration = Duration::from_secs(10);

pub const UNKNOWN_SENTIMENT: &str = "UNKNOWN";
pub const NEUTRAL_SENTIMENT: &str = "NEUTRAL";

#[derive(Debug, thiserror::Error)]
pub enum AiUnavailable {
    #[error("ai service request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("ai service responded with HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("ai service returned no usable result: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<String, AiUnavailable>;
}

#[async_trait]
pub trait SentimentAnalyzer: Send + Sync {
    /// Label of the strongest sentiment, e.g. `POSITIVE`.
    async fn sentiment(&self, text: &str) -> Result<String, AiUnavailable>;
}

async fn post_text(
    client: &reqwest::Client,
    url: &str,
    text: &str,
) -> Result<reqwest::Response, AiUnavailable> {
    let response = client.post(url).json(&json!({ "text": text })).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(AiUnavailable::Status(status));
    }
    Ok(response)
}

/// `POST {text}` answered with `{summary}`.
#[derive(Clone, Debug)]
pub struct HttpSummarizer {
    client: reqwest::Client,
    url: String,
}

impl HttpSummarizer {
    pub fn new(url: impl Into<String>) -> Result<Self, AiUnavailable> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_AI_TIMEOUT)
            .build()?;
        Ok(HttpSummarizer {
            client,
            url: url.into(),
        })
    }
}

#[derive(Deserialize)]
struct SummaryBody {
    summary: Option<String>,
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(&self, text: &str) -> Result<String, AiUnavailable> {
        let body: SummaryBody = post_text(&self.client, &self.url, text).await?.json().await?;
        body.summary
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AiUnavailable::Malformed("missing summary".to_string()))
    }
}

/// `POST {text}` answered with `[{label, score}]`, strongest first.
#[derive(Clone, Debug)]
pub struct HttpSentimentAnalyzer {
    client: reqwest::Client,
    url: String,
}

impl HttpSentimentAnalyzer {
    pub fn new(url: impl Into<String>) -> Result<Self, AiUnavailable> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_AI_TIMEOUT)
            .build()?;
        Ok(HttpSentimentAnalyzer {
            client,
            url: url.into(),
        })
    }
}

#[derive(Deserialize)]
struct SentimentLabel {
    label: Option<String>,
}

#[async_trait]
impl SentimentAnalyzer for HttpSentimentAnalyzer {
    async fn sentiment(&self, text: &str) -> Result<String, AiUnavailable> {
        let labels: Vec<SentimentLabel> =
            post_text(&self.client, &self.url, text).await?.json().await?;

        Ok(labels
            .into_iter()
            .next()
            .and_then(|l| l.label)
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| NEUTRAL_SENTIMENT.to_string()))
    }
}

/// Summary for new content, or `prior` when there is no new content or the
/// service is down.
pub async fn summary_or_prior(
    summarizer: &dyn Summarizer,
    text: Option<&str>,
    prior: Option<String>,
) -> Option<String> {
    let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
        return prior;
    };
    match summarizer.summarize(text).await {
        Ok(summary) => Some(summary),
        Err(e) => {
            warn!("summary generation failed: {}", e);
            prior
        }
    }
}

pub async fn sentiment_or_unknown(analyzer: &dyn SentimentAnalyzer, text: &str) -> String {
    analyzer.sentiment(text).await.unwrap_or_else(|e| {
        warn!("sentiment analysis failed: {}", e);
        UNKNOWN_SENTIMENT.to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn summary_from_service() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/summarize")
                    .json_body(json!({ "text": "a long post" }));
                then.status(200).json_body(json!({ "summary": "short" }));
            })
            .await;

        let summarizer = HttpSummarizer::new(server.url("/summarize")).unwrap();
        let summary = summary_or_prior(&summarizer, Some("a long post"), None).await;

        assert_eq!(summary, Some("short".to_string()));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn summary_falls_back_to_prior() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/summarize");
                then.status(500)
                    .json_body(json!({ "error": "Failed to generate summary" }));
            })
            .await;
        let summarizer = HttpSummarizer::new(server.url("/summarize")).unwrap();

        assert_eq!(
            summary_or_prior(&summarizer, Some("text"), Some("old".to_string())).await,
            Some("old".to_string())
        );
        assert_eq!(summary_or_prior(&summarizer, Some("text"), None).await, None);
        assert_eq!(
            summary_or_prior(&summarizer, None, Some("kept".to_string())).await,
            Some("kept".to_string())
        );
    }

    #[tokio::test]
    async fn sentiment_label_and_fallbacks() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/sentiment").body_contains("great");
                then.status(200)
                    .json_body(json!([{ "label": "POSITIVE", "score": 0.98 }]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/sentiment").body_contains("meh");
                then.status(200).json_body(json!([]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/sentiment").body_contains("boom");
                then.status(503);
            })
            .await;

        let analyzer = HttpSentimentAnalyzer::new(server.url("/sentiment")).unwrap();
        assert_eq!(sentiment_or_unknown(&analyzer, "great event").await, "POSITIVE");
        assert_eq!(sentiment_or_unknown(&analyzer, "meh").await, NEUTRAL_SENTIMENT);
        assert_eq!(sentiment_or_unknown(&analyzer, "boom").await, UNKNOWN_SENTIMENT);
    }

    #[tokio::test]
    async fn unreachable_service_is_unknown() {
        let analyzer = HttpSentimentAnalyzer::new("http://127.0.0.1:9/sentiment").unwrap();
        assert_eq!(sentiment_or_unknown(&analyzer, "hello").await, UNKNOWN_SENTIMENT);
    }
}
