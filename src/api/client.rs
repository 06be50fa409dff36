//! Cached API client.
//!
//! Reads go through the policy table: cacheable actions are coalesced and
//! stored, everything else hits the network directly. Mutations post a form
//! body and purge the cache prefixes they invalidate once the API reports
//! success.

use std::sync::Arc;

use hc_api_types::ApiResponse;
use reqwest::Url;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::actions::{Mutation, Params, PolicyTable, Query};
use super::response::{decode, transport_failure};
use super::transport::{ReqwestTransport, Transport, TransportError};
use crate::cache::{Backend, CacheEngine, RequestCoalescer, StorageError, StorageSet, cache_key};
use crate::config::Settings;

const ACTION_PARAM: &str = "action";
const ADMIN_PREFIX: &str = "getStores_";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct ApiClient {
    endpoint: Option<Url>,
    transport: Arc<dyn Transport>,
    engine: Arc<CacheEngine>,
    coalescer: RequestCoalescer<ApiResponse>,
    policies: PolicyTable,
}

impl ApiClient {
    pub fn new(
        endpoint: Option<Url>,
        transport: Arc<dyn Transport>,
        engine: Arc<CacheEngine>,
        policies: PolicyTable,
    ) -> Self {
        let coalescer = RequestCoalescer::new(Arc::clone(&engine));
        Self {
            endpoint,
            transport,
            engine,
            coalescer,
            policies,
        }
    }

    /// Build a client with a reqwest transport and the configured storages.
    pub fn from_settings(settings: &Settings) -> Result<Self, ClientError> {
        let transport = ReqwestTransport::new(
            settings.api.timeout,
            settings.api.user_agent.as_deref(),
        )?;
        let storages = StorageSet::open(
            settings.storage.directory.as_deref(),
            Some(settings.storage.quota_bytes),
        )?;
        let policies = PolicyTable::with_overrides(&settings.cache.policies);

        info!(
            endpoint = settings.api.endpoint.as_ref().map(Url::as_str),
            backends = ?storages.available(),
            "API client ready"
        );

        Ok(Self::new(
            settings.api.endpoint.clone(),
            Arc::new(transport),
            Arc::new(CacheEngine::new(storages)),
            policies,
        ))
    }

    /// Whether an endpoint is configured. Without one every call yields `None`.
    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn engine(&self) -> &Arc<CacheEngine> {
        &self.engine
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Fetch a read action, serving from cache when its policy allows.
    ///
    /// Only responses whose `success` is literally `true` are cached. Failures
    /// are returned to every coalesced caller and the next call retries.
    pub async fn fetch_resource(&self, query: &Query, params: &Params) -> Option<ApiResponse> {
        let Some(endpoint) = self.endpoint.as_ref() else {
            debug!(action = %query, "API endpoint not configured");
            return None;
        };
        let url = build_url(endpoint, query.name(), params);

        let Some(policy) = self.policies.policy_for(query) else {
            debug!(action = %query, "Uncached read");
            return Some(send_get(self.transport.as_ref(), url).await);
        };

        let key = cache_key(query.name(), params);
        let transport = Arc::clone(&self.transport);
        let fetch = move || async move {
            let response = send_get(transport.as_ref(), url).await;
            if response.is_success() {
                Ok(response.into_value())
            } else {
                Err(response)
            }
        };

        let outcome = self
            .coalescer
            .get_or_fetch(&key, fetch, Some(policy.ttl), policy.backend)
            .await;

        Some(match outcome {
            Ok(value) => ApiResponse::from(value),
            Err(failure) => failure,
        })
    }

    /// Post a mutating action and purge the caches it makes stale.
    pub async fn mutate(&self, mutation: &Mutation, body: &Params) -> Option<ApiResponse> {
        let Some(endpoint) = self.endpoint.as_ref() else {
            debug!(action = %mutation, "API endpoint not configured");
            return None;
        };

        let form = form_pairs(mutation.name(), body);
        let response = match self.transport.post_form(endpoint.clone(), &form).await {
            Ok(raw) => decode(&raw),
            Err(err) => transport_failure(&err),
        };

        if response.is_success() {
            for rule in mutation.invalidations(body) {
                let removed = self.engine.invalidate_prefix(rule.prefix, rule.backend);
                debug!(
                    action = %mutation,
                    prefix = rule.prefix,
                    backend = %rule.backend,
                    removed,
                    "Invalidated cache prefix"
                );
            }
        } else {
            warn!(action = %mutation, "Mutation did not succeed; caches left intact");
        }

        Some(response)
    }

    /// Drop cached admin data so the next read refetches it.
    pub fn clear_admin_caches(&self) -> usize {
        self.engine.invalidate_prefix(ADMIN_PREFIX, Backend::Memory)
    }

    /// Drop every namespaced entry on every backend.
    pub fn clear_all_caches(&self) -> usize {
        Backend::ALL
            .iter()
            .map(|backend| self.engine.clear_all(*backend))
            .sum()
    }
}

async fn send_get(transport: &dyn Transport, url: Url) -> ApiResponse {
    match transport.get(url).await {
        Ok(raw) => decode(&raw),
        Err(err) => transport_failure(&err),
    }
}

/// `endpoint?action=<action>&k=v...`, skipping null and empty values.
pub(crate) fn build_url(endpoint: &Url, action: &str, params: &Params) -> Url {
    let mut url = endpoint.clone();
    {
        let mut query = url.query_pairs_mut();
        query.append_pair(ACTION_PARAM, action);
        for (key, value) in params {
            if key == ACTION_PARAM {
                continue;
            }
            if let Some(text) = param_text(value).filter(|text| !text.is_empty()) {
                query.append_pair(key, &text);
            }
        }
    }
    url
}

/// Form body pairs with `action` first. Null values are omitted.
pub(crate) fn form_pairs(action: &str, body: &Params) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(body.len() + 1);
    pairs.push((ACTION_PARAM.to_string(), action.to_string()));
    for (key, value) in body {
        if key == ACTION_PARAM {
            continue;
        }
        if let Some(text) = param_text(value) {
            pairs.push((key.clone(), text));
        }
    }
    pairs
}

fn param_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use hc_api_types::ErrorCode;
    use serde_json::json;
    use time::macros::datetime;

    use super::*;
    use crate::api::transport::RawResponse;
    use crate::cache::{ManualClock, namespaced};

    /// Replays one canned response and records what was requested.
    struct StubTransport {
        reply: Mutex<Result<RawResponse, String>>,
        gets: AtomicUsize,
        posts: Mutex<Vec<Vec<(String, String)>>>,
    }

    impl StubTransport {
        fn replying(status: u16, body: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(Ok(RawResponse::new(status, body.to_string()))),
                gets: AtomicUsize::new(0),
                posts: Mutex::new(Vec::new()),
            })
        }

        fn offline() -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(Err("connection refused".to_string())),
                gets: AtomicUsize::new(0),
                posts: Mutex::new(Vec::new()),
            })
        }

        fn set_reply(&self, status: u16, body: &str) {
            *self.reply.lock().unwrap() = Ok(RawResponse::new(status, body.to_string()));
        }

        fn reply(&self) -> Result<RawResponse, TransportError> {
            self.reply
                .lock()
                .unwrap()
                .clone()
                .map_err(TransportError::Unavailable)
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn get(&self, _url: Url) -> Result<RawResponse, TransportError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.reply()
        }

        async fn post_form(
            &self,
            _url: Url,
            form: &[(String, String)],
        ) -> Result<RawResponse, TransportError> {
            self.posts.lock().unwrap().push(form.to_vec());
            self.reply()
        }
    }

    fn endpoint() -> Url {
        Url::parse("https://api.example.test/exec").unwrap()
    }

    fn client_with(transport: Arc<StubTransport>) -> ApiClient {
        let engine = Arc::new(CacheEngine::with_clock(
            StorageSet::in_memory(),
            Arc::new(ManualClock::new(datetime!(2026-03-01 09:00 UTC))),
        ));
        ApiClient::new(Some(endpoint()), transport, engine, PolicyTable::builtin())
    }

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => Params::new(),
        }
    }

    #[test]
    fn url_skips_null_and_empty_params() {
        let url = build_url(
            &endpoint(),
            "getProducts",
            &params(json!({"storeId": 7, "q": "", "tag": null, "name": "a b"})),
        );
        assert_eq!(
            url.as_str(),
            "https://api.example.test/exec?action=getProducts&name=a+b&storeId=7"
        );
    }

    #[test]
    fn form_keeps_action_first_and_authoritative() {
        let pairs = form_pairs(
            "openOrder",
            &params(json!({"action": "spoofed", "storeId": "s1", "note": null, "qty": 2})),
        );
        assert_eq!(
            pairs,
            vec![
                ("action".to_string(), "openOrder".to_string()),
                ("qty".to_string(), "2".to_string()),
                ("storeId".to_string(), "s1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn unconfigured_client_returns_none() {
        let transport = StubTransport::replying(200, r#"{"success":true}"#);
        let engine = Arc::new(CacheEngine::new(StorageSet::in_memory()));
        let client = ApiClient::new(None, transport.clone(), engine, PolicyTable::builtin());

        assert!(!client.is_configured());
        assert!(client.fetch_resource(&Query::Stores, &Params::new()).await.is_none());
        assert!(client.mutate(&Mutation::OpenOrder, &Params::new()).await.is_none());
        assert_eq!(transport.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cacheable_read_hits_network_once() {
        let transport = StubTransport::replying(200, r#"{"success":true,"data":[1,2]}"#);
        let client = client_with(transport.clone());
        let query = params(json!({"storeId": "s1"}));

        let first = client.fetch_resource(&Query::Products, &query).await.unwrap();
        let second = client.fetch_resource(&Query::Products, &query).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.data(), Some(&json!([1, 2])));
        assert_eq!(transport.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn uncached_read_always_hits_network() {
        let transport = StubTransport::replying(200, r#"{"success":true}"#);
        let client = client_with(transport.clone());
        let query = Query::from("getCategories");

        client.fetch_resource(&query, &Params::new()).await.unwrap();
        client.fetch_resource(&query, &Params::new()).await.unwrap();

        assert_eq!(transport.gets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unsuccessful_body_is_returned_but_not_cached() {
        let transport =
            StubTransport::replying(200, r#"{"success":false,"error":{"code":"X","message":"no"}}"#);
        let client = client_with(transport.clone());

        let response = client.fetch_resource(&Query::Stores, &Params::new()).await.unwrap();
        assert!(!response.is_success());

        transport.set_reply(200, r#"{"success":true}"#);
        let retry = client.fetch_resource(&Query::Stores, &Params::new()).await.unwrap();
        assert!(retry.is_success());
        assert_eq!(transport.gets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transport_failure_is_network_error() {
        let client = client_with(StubTransport::offline());
        let response = client.fetch_resource(&Query::Stores, &Params::new()).await.unwrap();
        assert!(response.has_error_code(ErrorCode::NetworkError));
    }

    #[tokio::test]
    async fn successful_mutation_purges_its_prefix() {
        let transport = StubTransport::replying(200, r#"{"success":true}"#);
        let client = client_with(transport.clone());

        client.fetch_resource(&Query::CurrentOrders, &Params::new()).await.unwrap();
        let key = cache_key("getCurrentOrders", &Params::new());
        assert!(client.engine().read(&key, Backend::Session).is_some());

        client
            .mutate(&Mutation::OpenOrder, &params(json!({"storeId": "s1"})))
            .await
            .unwrap();

        assert!(client.engine().read(&key, Backend::Session).is_none());
        let posts = transport.posts.lock().unwrap();
        assert_eq!(posts[0][0], ("action".to_string(), "openOrder".to_string()));
    }

    #[tokio::test]
    async fn failed_mutation_leaves_cache_alone() {
        let transport = StubTransport::replying(200, r#"{"success":true}"#);
        let client = client_with(transport.clone());
        client.fetch_resource(&Query::Stores, &Params::new()).await.unwrap();

        transport.set_reply(500, "");
        let response = client
            .mutate(&Mutation::ToggleActive, &params(json!({"type": "store"})))
            .await
            .unwrap();

        assert!(response.has_error_code(ErrorCode::HttpError));
        let key = cache_key("getStores", &Params::new());
        assert!(client.engine().read(&key, Backend::Memory).is_some());
    }

    #[tokio::test]
    async fn clear_admin_caches_only_touches_stores() {
        let client = client_with(StubTransport::replying(200, r#"{"success":true}"#));
        client.fetch_resource(&Query::Stores, &Params::new()).await.unwrap();
        client.fetch_resource(&Query::Products, &Params::new()).await.unwrap();

        assert_eq!(client.clear_admin_caches(), 1);
        let products = cache_key("getProducts", &Params::new());
        assert!(client.engine().read(&products, Backend::Global).is_some());

        assert_eq!(client.clear_all_caches(), 1);
        assert!(client.engine().read(&products, Backend::Global).is_none());
    }

    #[tokio::test]
    async fn entries_expire_with_their_policy_ttl() {
        let clock = Arc::new(ManualClock::new(datetime!(2026-03-01 09:00 UTC)));
        let engine = Arc::new(CacheEngine::with_clock(StorageSet::in_memory(), clock.clone()));
        let transport = StubTransport::replying(200, r#"{"success":true}"#);
        let client = ApiClient::new(
            Some(endpoint()),
            transport.clone(),
            engine,
            PolicyTable::builtin(),
        );

        client.fetch_resource(&Query::OrderSessions, &Params::new()).await.unwrap();
        clock.advance(Duration::from_secs(5 * 60 + 1));
        client.fetch_resource(&Query::OrderSessions, &Params::new()).await.unwrap();

        assert_eq!(transport.gets.load(Ordering::SeqCst), 2);
        let stored = client
            .engine()
            .storages()
            .get(Backend::Session)
            .and_then(|storage| storage.get(&namespaced(&cache_key("getOrderSessions", &Params::new()))));
        assert!(stored.is_some());
    }
}
