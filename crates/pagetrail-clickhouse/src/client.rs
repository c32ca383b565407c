use std::time::Duration;

use pagetrail_core::{Arg, ClickHouseConfig, QueryContext, Row, Store, StoreError};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::params;

/// `JSONCompact` output: rows as positional arrays.
#[derive(Deserialize)]
struct CompactResponse {
    data: Vec<Row>,
}

/// [`Store`] over the ClickHouse HTTP interface.
///
/// Query text is posted as the request body; arguments travel as typed
/// `param_<name>` query-string entries.
#[derive(Clone)]
pub struct ClickHouseStore {
    client: Client,
    url: reqwest::Url,
    database: String,
    user: String,
    password: String,
    timeout: Duration,
}

impl ClickHouseStore {
    pub fn new(config: &ClickHouseConfig) -> Result<Self, StoreError> {
        let url = reqwest::Url::parse(&config.url)
            .map_err(|e| StoreError::Transport(format!("invalid ClickHouse URL: {e}")))?;
        info!(url = %url, database = %config.database, "ClickHouse store configured");
        Ok(Self {
            client: Client::new(),
            url,
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            timeout: config.query_timeout(),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    fn request_url(
        &self,
        query_id: &str,
        read: bool,
        params: &[(String, String)],
    ) -> reqwest::Url {
        let mut url = self.url.clone();
        {
            let mut qs = url.query_pairs_mut();
            qs.append_pair("database", &self.database);
            qs.append_pair("query_id", query_id);
            if read {
                qs.append_pair("default_format", "JSONCompact");
                qs.append_pair("output_format_json_quote_64bit_integers", "0");
                qs.append_pair("cancel_http_readonly_queries_on_client_close", "1");
            }
            for (name, value) in params {
                qs.append_pair(&format!("param_{name}"), value);
            }
        }
        url
    }

    /// Sends one statement and returns the response body.
    async fn send(
        &self,
        ctx: &QueryContext,
        query: &str,
        args: &[Arg],
        read: bool,
    ) -> Result<String, StoreError> {
        let bound = params::bind(query, args)?;
        let query_id = Uuid::new_v4().to_string();
        let request = self
            .client
            .post(self.request_url(&query_id, read, &bound.params))
            .basic_auth(&self.user, Some(&self.password))
            .body(bound.sql);

        let exchange = async {
            let response = request
                .send()
                .await
                .map_err(|e| StoreError::Transport(e.to_string()))?;
            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| StoreError::Transport(e.to_string()))?;
            if !status.is_success() {
                return Err(StoreError::Server {
                    status: status.as_u16(),
                    body,
                });
            }
            Ok(body)
        };

        let timeout = ctx.timeout().unwrap_or(self.timeout);
        let result = tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => Err(StoreError::Cancelled),
            outcome = tokio::time::timeout(timeout, exchange) => {
                outcome.unwrap_or(Err(StoreError::Timeout(timeout)))
            }
        };

        match &result {
            Ok(body) => debug!(%query_id, bytes = body.len(), "ClickHouse query finished"),
            Err(StoreError::Cancelled) => debug!(%query_id, "ClickHouse query cancelled"),
            Err(err) => warn!(%query_id, error = %err, "ClickHouse query failed"),
        }
        result
    }
}

#[async_trait::async_trait]
impl Store for ClickHouseStore {
    async fn execute(
        &self,
        ctx: &QueryContext,
        query: &str,
        args: &[Arg],
    ) -> Result<(), StoreError> {
        self.send(ctx, query, args, false).await.map(|_| ())
    }

    async fn query(
        &self,
        ctx: &QueryContext,
        query: &str,
        args: &[Arg],
    ) -> Result<Vec<Row>, StoreError> {
        let body = self.send(ctx, query, args, true).await?;
        let response: CompactResponse = serde_json::from_str(&body)?;
        Ok(response.data)
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn store() -> ClickHouseStore {
        let config = ClickHouseConfig::from_vars(|key| {
            (key == "PAGETRAIL_CLICKHOUSE_URL").then(|| "http://127.0.0.1:9/".to_string())
        })
        .expect("config");
        ClickHouseStore::new(&config).expect("store")
    }

    #[test]
    fn read_urls_carry_format_and_parameters() {
        let params = vec![("p1".to_string(), "a b".to_string())];
        let url = store().request_url("abc", true, &params);
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("database".into(), "pagetrail".into())));
        assert!(pairs.contains(&("query_id".into(), "abc".into())));
        assert!(pairs.contains(&("default_format".into(), "JSONCompact".into())));
        assert!(pairs.contains(&("param_p1".into(), "a b".into())));
    }

    #[test]
    fn statements_skip_output_format() {
        let url = store().request_url("abc", false, &[]);
        assert!(!url.query_pairs().any(|(k, _)| k == "default_format"));
    }

    #[test]
    fn invalid_url_is_a_transport_error() {
        let config = ClickHouseConfig::from_vars(|key| {
            (key == "PAGETRAIL_CLICKHOUSE_URL").then(|| "not a url".to_string())
        })
        .expect("config");
        assert!(matches!(
            ClickHouseStore::new(&config),
            Err(StoreError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_context_wins_before_sending() {
        let token = CancellationToken::new();
        token.cancel();
        let ctx = QueryContext::new().with_cancellation(token);
        let err = store()
            .query(&ctx, "SELECT 1", &[])
            .await
            .expect_err("should fail");
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn mismatched_arguments_fail_before_sending() {
        let err = store()
            .query(&QueryContext::new(), "SELECT ?", &[])
            .await
            .expect_err("should fail");
        assert!(matches!(err, StoreError::Bind(_)));
    }
}
