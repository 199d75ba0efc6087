//! Fetch interception: cache first, then network, then the offline shell.

use std::sync::Arc;

use tracing::{debug, trace, warn};
use vacation_common::with_timeout;

use crate::error::ServiceWorkerError;
use crate::request::{FetchRequest, FetchResponse, RequestKey};
use crate::worker::{ServiceWorker, WorkerState};

impl ServiceWorker {
    /// Answer a request from a controlled page.
    ///
    /// 1. A cached GET is returned without touching the network.
    /// 2. On a miss the network answers; a 2xx GET is stored in this
    ///    generation before the live response is returned.
    /// 3. If the network fails, navigations get the cached shell page and
    ///    everything else gets the failure.
    pub async fn handle_fetch(
        &self,
        request: FetchRequest,
    ) -> Result<FetchResponse, ServiceWorkerError> {
        self.expect_state(WorkerState::Active).await?;
        let client = request.client_id.map(|id| id.to_string());

        if request.is_cacheable() {
            let key = request.key();
            match self.store.match_request(self.cache_name(), &key).await {
                Ok(Some(entry)) => {
                    trace!(%key, client = ?client, "Served from cache");
                    return Ok(FetchResponse::from_cache(&entry));
                }
                Ok(None) => {}
                Err(err) => warn!(%key, error = %err, "Cache lookup failed, treating as miss"),
            }
        }

        match self.fetch_and_cache(request.clone()).await {
            Ok(response) => Ok(response),
            Err(err) => {
                warn!(url = %request.url, client = ?client, error = %err, "Fetch failed");
                self.offline_fallback(&request, err).await
            }
        }
    }

    /// Network step. Runs on its own task so a request the page abandons
    /// still completes and fills the cache.
    async fn fetch_and_cache(
        &self,
        request: FetchRequest,
    ) -> Result<FetchResponse, ServiceWorkerError> {
        let network = Arc::clone(&self.network);
        let store = Arc::clone(&self.store);
        let state = Arc::clone(&self.state);
        let cache_name = self.cache_name().to_string();
        let timeout = self.config().fetch_timeout();

        let task = tokio::spawn(async move {
            let response = with_timeout(timeout, || network.fetch(&request))
                .await
                .map_err(|e| ServiceWorkerError::NetworkUnavailable(e.to_string()))??;

            if request.is_cacheable() && response.is_ok() {
                // A replaced generation must not be recreated after activation removed it.
                if *state.read().await == WorkerState::Redundant {
                    debug!(url = %request.url, "Worker redundant, response not stored");
                } else {
                    let key = request.key();
                    match store.put(&cache_name, key.clone(), response.to_entry(&key)).await {
                        Ok(()) => trace!(%key, cache = %cache_name, "Stored network response"),
                        Err(err) => warn!(%key, error = %err, "Could not store network response"),
                    }
                }
            }

            Ok::<_, ServiceWorkerError>(response)
        });

        task.await
            .map_err(|e| ServiceWorkerError::NetworkUnavailable(format!("fetch task failed: {e}")))?
    }

    async fn offline_fallback(
        &self,
        request: &FetchRequest,
        err: ServiceWorkerError,
    ) -> Result<FetchResponse, ServiceWorkerError> {
        if !request.is_navigation() {
            return Err(err);
        }

        let shell = RequestKey::get(&self.config().shell_url()?);
        match self.store.match_request(self.cache_name(), &shell).await {
            Ok(Some(entry)) => {
                debug!(url = %request.url, shell = %shell.url, "Returning offline shell page");
                Ok(FetchResponse::from_cache(&entry))
            }
            Ok(None) => {
                warn!(shell = %shell.url, "Shell page not cached");
                Err(err)
            }
            Err(cache_err) => {
                warn!(error = %cache_err, "Shell page lookup failed");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, MemoryCacheStore};
    use crate::config::WorkerConfig;
    use crate::messaging::Clients;
    use crate::test_support::{init_test_logging, StaticNetwork};
    use http::Method;
    use std::time::Duration;
    use url::Url;

    const SCOPE: &str = "https://example.com/";

    fn url(path: &str) -> Url {
        Url::parse(SCOPE).unwrap().join(path).unwrap()
    }

    async fn active_worker(
        store: Arc<MemoryCacheStore>,
        network: Arc<StaticNetwork>,
        config: WorkerConfig,
    ) -> ServiceWorker {
        init_test_logging();
        let w = ServiceWorker::new(config, store, network, Arc::new(Clients::new())).unwrap();
        w.install().await.unwrap();
        w.activate().await.unwrap();
        w
    }

    fn config() -> WorkerConfig {
        WorkerConfig::default()
            .with_scope(Url::parse(SCOPE).unwrap())
            .with_manifest(["index.html"])
    }

    fn site() -> Arc<StaticNetwork> {
        Arc::new(
            StaticNetwork::new()
                .with("https://example.com/index.html", 200, "<html>shell</html>")
                .with("https://example.com/c.js", 200, "ok"),
        )
    }

    #[tokio::test]
    async fn test_fetch_before_active_is_invalid() {
        let w = ServiceWorker::new(
            config(),
            Arc::new(MemoryCacheStore::new()),
            site(),
            Arc::new(Clients::new()),
        )
        .unwrap();

        assert!(matches!(
            w.handle_fetch(FetchRequest::get(url("c.js"))).await,
            Err(ServiceWorkerError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_network() {
        let network = site();
        let w = active_worker(Arc::new(MemoryCacheStore::new()), network.clone(), config()).await;
        let calls = network.calls();

        let response = w.handle_fetch(FetchRequest::get(url("index.html"))).await.unwrap();
        assert!(response.from_cache);
        assert_eq!(response.text(), "<html>shell</html>");
        assert_eq!(network.calls(), calls);
    }

    #[tokio::test]
    async fn test_miss_is_stored_then_hit() {
        let store = Arc::new(MemoryCacheStore::new());
        let network = site();
        let w = active_worker(store.clone(), network.clone(), config()).await;

        let first = w.handle_fetch(FetchRequest::get(url("c.js"))).await.unwrap();
        assert_eq!(first.text(), "ok");
        assert!(!first.from_cache);
        assert!(store
            .match_request("vacation-tracker-v1", &RequestKey::get(&url("c.js")))
            .await
            .unwrap()
            .is_some());

        let calls = network.calls();
        let second = w.handle_fetch(FetchRequest::get(url("c.js"))).await.unwrap();
        assert_eq!(second.text(), "ok");
        assert!(second.from_cache);
        assert_eq!(network.calls(), calls);
    }

    #[tokio::test]
    async fn test_error_status_is_returned_not_stored() {
        let store = Arc::new(MemoryCacheStore::new());
        let network = Arc::new(
            StaticNetwork::new()
                .with("https://example.com/index.html", 200, "shell")
                .with("https://example.com/gone.png", 404, ""),
        );
        let w = active_worker(store.clone(), network, config()).await;

        let response = w.handle_fetch(FetchRequest::get(url("gone.png"))).await.unwrap();
        assert_eq!(response.status, 404);
        assert!(store
            .match_request("vacation-tracker-v1", &RequestKey::get(&url("gone.png")))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_non_get_bypasses_cache() {
        let store = Arc::new(MemoryCacheStore::new());
        let network = site();
        let w = active_worker(store.clone(), network.clone(), config()).await;
        let calls = network.calls();

        let request = FetchRequest::new(Method::POST, url("index.html")).with_body("{}");
        let response = w.handle_fetch(request.clone()).await.unwrap();

        assert!(!response.from_cache);
        assert_eq!(network.calls(), calls + 1);
        assert!(store
            .match_request("vacation-tracker-v1", &request.key())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_offline_navigation_gets_shell() {
        let network = site();
        let w = active_worker(Arc::new(MemoryCacheStore::new()), network.clone(), config()).await;
        network.set_online(false);

        let response = w
            .handle_fetch(FetchRequest::navigate(url("trips/2024")))
            .await
            .unwrap();
        assert!(response.from_cache);
        assert_eq!(response.text(), "<html>shell</html>");
    }

    #[tokio::test]
    async fn test_offline_subresource_fails() {
        let network = site();
        let w = active_worker(Arc::new(MemoryCacheStore::new()), network.clone(), config()).await;
        network.set_online(false);

        assert!(matches!(
            w.handle_fetch(FetchRequest::get(url("c.js"))).await,
            Err(ServiceWorkerError::NetworkUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_navigation_without_shell_fails() {
        let store = Arc::new(MemoryCacheStore::new());
        let network = site();
        let w = active_worker(store.clone(), network.clone(), config()).await;
        store.delete("vacation-tracker-v1").await.unwrap();
        network.set_online(false);

        assert!(matches!(
            w.handle_fetch(FetchRequest::navigate(url("index.html"))).await,
            Err(ServiceWorkerError::NetworkUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_network_failure() {
        let network = Arc::new(
            StaticNetwork::new()
                .with("https://example.com/index.html", 200, "shell")
                .with("https://example.com/slow.js", 200, "late"),
        );
        let w = active_worker(
            Arc::new(MemoryCacheStore::new()),
            network.clone(),
            config().with_fetch_timeout(Duration::from_secs(1)),
        )
        .await;
        network.set_delay(Duration::from_secs(5));

        assert!(matches!(
            w.handle_fetch(FetchRequest::get(url("slow.js"))).await,
            Err(ServiceWorkerError::NetworkUnavailable(_))
        ));
        assert_eq!(
            w.handle_fetch(FetchRequest::navigate(url("slow.js")))
                .await
                .unwrap()
                .text(),
            "shell"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_fetch_still_fills_cache() {
        let store = Arc::new(MemoryCacheStore::new());
        let network = site();
        let w = active_worker(store.clone(), network.clone(), config()).await;
        network.set_delay(Duration::from_secs(2));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            w.handle_fetch(FetchRequest::get(url("c.js"))),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(store
            .match_request("vacation-tracker-v1", &RequestKey::get(&url("c.js")))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_racing_misses_both_fetch_and_store_once() {
        let store = Arc::new(MemoryCacheStore::new());
        let network = site();
        let w = active_worker(store.clone(), network.clone(), config()).await;
        network.set_delay(Duration::from_secs(1));
        let calls = network.calls();

        let (a, b) = tokio::join!(
            w.handle_fetch(FetchRequest::get(url("c.js"))),
            w.handle_fetch(FetchRequest::get(url("c.js"))),
        );

        assert_eq!(a.unwrap().text(), "ok");
        assert_eq!(b.unwrap().text(), "ok");
        assert_eq!(network.calls(), calls + 2);

        let keys = store.entries("vacation-tracker-v1").await.unwrap();
        let c_js = RequestKey::get(&url("c.js"));
        assert_eq!(keys.iter().filter(|k| **k == c_js).count(), 1);
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn test_tagged_request_is_served() {
        let network = site();
        let clients = Arc::new(Clients::new());
        let w = ServiceWorker::new(
            config(),
            Arc::new(MemoryCacheStore::new()),
            network,
            Arc::clone(&clients),
        )
        .unwrap();
        w.install().await.unwrap();
        w.activate().await.unwrap();
        let page = clients.connect(url("index.html"), Some(w.controller())).await;

        let request = FetchRequest::get(url("c.js")).with_client(page.id);
        assert_eq!(request.client_id, Some(page.id));
        assert_eq!(w.handle_fetch(request).await.unwrap().text(), "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_worker_does_not_store() {
        let store = Arc::new(MemoryCacheStore::new());
        let network = site();
        let w = active_worker(store.clone(), network.clone(), config()).await;
        network.set_delay(Duration::from_secs(2));

        let (response, ()) = tokio::join!(w.handle_fetch(FetchRequest::get(url("c.js"))), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            w.mark_redundant().await;
        });

        assert_eq!(response.unwrap().text(), "ok");
        assert!(store
            .match_request("vacation-tracker-v1", &RequestKey::get(&url("c.js")))
            .await
            .unwrap()
            .is_none());
    }
}
