use std::sync::Arc;
use std::time::Duration;

use pubdatahub_protocol::Item;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::CoreError;
use crate::RateLimiter;
use crate::Result;

/// Typed client for the Hacker News item API.
///
/// Every call acquires a rate-limit token first; cancellation aborts the
/// token wait or the in-flight request, whichever is active.
#[derive(Clone)]
pub struct HnClient {
    http: reqwest::Client,
    base_url: String,
    limiter: Arc<RateLimiter>,
}

impl HnClient {
    pub fn new(base_url: impl Into<String>, limiter: Arc<RateLimiter>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| CoreError::validation(format!("http client: {err}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            limiter,
        })
    }

    /// Highest id the remote has assigned so far.
    pub async fn max_id(&self, cancel: &CancellationToken) -> Result<i64> {
        let url = format!("{}/maxitem.json", self.base_url);
        self.get_json::<i64>(cancel, &url).await
    }

    /// Fetch one item. `Ok(None)` means the remote returned the `null`
    /// tombstone: the id was consulted successfully but holds nothing.
    pub async fn item(&self, cancel: &CancellationToken, id: i64) -> Result<Option<Item>> {
        let url = format!("{}/item/{id}.json", self.base_url);
        let item = self.get_json::<Option<Item>>(cancel, &url).await?;
        trace!(id, present = item.is_some(), "fetched item");
        Ok(item)
    }

    /// Fetch `[start, end]` inclusive, in ascending id order, skipping
    /// missing ids. Checks cancellation between calls.
    pub async fn batch(
        &self,
        cancel: &CancellationToken,
        start: i64,
        end: i64,
    ) -> Result<Vec<Item>> {
        if start > end {
            return Err(CoreError::InvalidRange { start, end });
        }
        let mut items = Vec::with_capacity((end - start + 1) as usize);
        for id in start..=end {
            if cancel.is_cancelled() {
                return Err(CoreError::Canceled);
            }
            if let Some(item) = self.item(cancel, id).await? {
                items.push(item);
            }
        }
        Ok(items)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        url: &str,
    ) -> Result<T> {
        self.limiter.acquire(cancel).await?;
        let request = self.http.get(url).send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(CoreError::Canceled),
            response = request => response.map_err(classify_transport)?,
        };
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }
        response
            .json::<T>()
            .await
            .map_err(|err| CoreError::FatalUpstream(format!("undecodable body from {url}: {err}")))
    }
}

fn classify_transport(err: reqwest::Error) -> CoreError {
    CoreError::TransientUpstream(err.to_string())
}

fn classify_status(status: StatusCode) -> CoreError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        CoreError::TransientUpstream(format!("upstream returned {status}"))
    } else {
        CoreError::FatalUpstream(format!("upstream returned {status}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    fn test_client(server: &MockServer) -> HnClient {
        let limiter = Arc::new(RateLimiter::new(1_000, Duration::from_secs(1)));
        HnClient::new(server.uri() + "/v0", limiter, Duration::from_secs(5)).expect("client")
    }

    #[tokio::test]
    async fn max_id_decodes_bare_integer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v0/maxitem.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("41000000"))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let cancel = CancellationToken::new();
        assert_eq!(client.max_id(&cancel).await.expect("max id"), 41_000_000);
    }

    #[tokio::test]
    async fn null_body_is_missing_not_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v0/item/2.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("null"))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let cancel = CancellationToken::new();
        assert_eq!(client.item(&cancel, 2).await.expect("fetch"), None);
    }

    #[tokio::test]
    async fn batch_skips_missing_and_orders_ascending() {
        let server = MockServer::start().await;
        for id in [1_i64, 3] {
            Mock::given(method("GET"))
                .and(path(format!("/v0/item/{id}.json")))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "id": id,
                    "type": "story",
                })))
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/v0/item/2.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("null"))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let cancel = CancellationToken::new();
        let items = client.batch(&cancel, 1, 3).await.expect("batch");
        let ids: Vec<i64> = items.iter().map(|item| item.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn batch_rejects_inverted_range_and_single_id_works() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v0/item/5.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"id": 5, "type": "job"})),
            )
            .mount(&server)
            .await;

        let client = test_client(&server);
        let cancel = CancellationToken::new();

        let err = client.batch(&cancel, 9, 3).await.err().expect("must fail");
        assert!(matches!(err, CoreError::InvalidRange { start: 9, end: 3 }));

        let items = client.batch(&cancel, 5, 5).await.expect("single id");
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn server_errors_are_transient_and_client_errors_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v0/item/1.json"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v0/item/2.json"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v0/item/3.json"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let cancel = CancellationToken::new();
        assert!(client.item(&cancel, 1).await.err().expect("5xx").is_transient());
        assert!(matches!(
            client.item(&cancel, 2).await.err().expect("4xx"),
            CoreError::FatalUpstream(_)
        ));
        assert!(client.item(&cancel, 3).await.err().expect("429").is_transient());
    }

    #[tokio::test]
    async fn cancellation_aborts_between_batch_calls() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v0/item/1.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"id": 1, "type": "story"})),
            )
            .mount(&server)
            .await;

        let client = test_client(&server);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client.batch(&cancel, 1, 10).await.err().expect("canceled");
        assert!(matches!(err, CoreError::Canceled));
    }
}
