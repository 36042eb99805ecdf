//! Per-request dispatch: select, count, forward.

use super::backend::Backend;
use super::balancer::LoadBalancer;
use super::config::HashKey;
use super::error::{ForwardError, LoadBalancerError, LoadBalancerResult};
use http::header::HOST;
use http::{Request, Response, StatusCode};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tracing::warn;

/// Boxed future returned by [`Forwarder::forward`].
pub type ForwardFuture<'a, B> =
    Pin<Box<dyn Future<Output = Result<Response<B>, ForwardError>> + Send + 'a>>;

/// Relays a request to a backend and returns its response.
///
/// Implementations own connection pooling and wire-level concerns; the
/// dispatcher only decides where a request goes.
pub trait Forwarder<B>: Send + Sync {
    /// Forward `request` to `backend`.
    fn forward<'a>(&'a self, backend: &'a Backend, request: Request<B>) -> ForwardFuture<'a, B>;
}

/// Routes requests through a [`LoadBalancer`] to a [`Forwarder`].
#[derive(Debug)]
pub struct Dispatcher<F> {
    balancer: Arc<LoadBalancer>,
    forwarder: F,
    hash_key: HashKey,
}

impl<F> Dispatcher<F> {
    /// Create a new dispatcher.
    #[must_use]
    pub fn new(balancer: Arc<LoadBalancer>, forwarder: F, hash_key: HashKey) -> Self {
        Self {
            balancer,
            forwarder,
            hash_key,
        }
    }

    /// Extract the selection key for a request.
    ///
    /// Falls back to the requested host when the configured attribute is
    /// missing.
    #[must_use]
    pub fn selection_key<B>(&self, request: &Request<B>, client: Option<SocketAddr>) -> String {
        let preferred = match &self.hash_key {
            HashKey::Host => None,
            HashKey::ClientIp => client.map(|addr| addr.ip().to_string()),
            HashKey::Header(name) => request
                .headers()
                .get(name.as_str())
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
        };

        preferred.unwrap_or_else(|| requested_host(request))
    }

    /// Dispatch a request, reporting why it could not be served.
    ///
    /// The backend's in-flight count covers the whole forward and is
    /// released on every exit path, including cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`LoadBalancerError::NoHealthyBackends`] when nothing is
    /// eligible and [`LoadBalancerError::ForwardFailed`] when the forwarder
    /// fails.
    pub async fn try_dispatch<B>(
        &self,
        request: Request<B>,
        client: Option<SocketAddr>,
    ) -> LoadBalancerResult<Response<B>>
    where
        F: Forwarder<B>,
    {
        let key = self.selection_key(&request, client);
        let backend = self
            .balancer
            .select_backend(&key)
            .ok_or(LoadBalancerError::NoHealthyBackends)?;

        let result = {
            let _in_flight = backend.begin_request();
            self.forwarder.forward(&backend, request).await
        };

        result.map_err(|e| {
            backend.stats().record_failure();
            warn!(backend = %backend.url(), error = %e, "Forwarding failed");
            LoadBalancerError::from(e)
        })
    }

    /// Dispatch a request, answering `503 Service Unavailable` when no
    /// backend is eligible or forwarding fails.
    ///
    /// The 503 body carries no backend details.
    pub async fn dispatch<B>(&self, request: Request<B>, client: Option<SocketAddr>) -> Response<B>
    where
        F: Forwarder<B>,
        B: From<&'static str>,
    {
        match self.try_dispatch(request, client).await {
            Ok(response) => response,
            Err(_) => service_unavailable(),
        }
    }
}

/// Build a bare `503 Service Unavailable` response.
#[must_use]
pub fn service_unavailable<B: From<&'static str>>() -> Response<B> {
    let mut response = Response::new(B::from("Service Unavailable"));
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    response
}

fn requested_host<B>(request: &Request<B>) -> String {
    request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthCheckConfig;
    use crate::health::{Probe, ProbeFuture};
    use crate::strategy::Policy;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug)]
    struct AlwaysUp;

    impl Probe for AlwaysUp {
        fn check<'a>(&'a self, _address: &'a str, _timeout: Duration) -> ProbeFuture<'a, Result<(), String>> {
            Box::pin(async { Ok(()) })
        }
    }

    /// Answers with the backend address and request path.
    #[derive(Debug, Default)]
    struct EchoForwarder {
        fail: bool,
        hang: bool,
        observed_in_flight: Mutex<Vec<i64>>,
    }

    impl Forwarder<String> for EchoForwarder {
        fn forward<'a>(&'a self, backend: &'a Backend, request: Request<String>) -> ForwardFuture<'a, String> {
            Box::pin(async move {
                let in_flight = backend.in_flight();
                self.observed_in_flight.lock().unwrap().push(in_flight);

                if self.hang {
                    std::future::pending::<()>().await;
                }
                tokio::task::yield_now().await;

                if self.fail {
                    return Err(ForwardError::Connect {
                        backend: backend.address().to_string(),
                        reason: "refused".to_string(),
                    });
                }
                Ok(Response::new(format!("{} {}", backend.address(), request.uri().path())))
            })
        }
    }

    async fn balancer(method: Policy, urls: &[&str]) -> Arc<LoadBalancer> {
        let lb = LoadBalancer::with_probe(method, Arc::new(AlwaysUp), HealthCheckConfig::default());
        for url in urls {
            lb.add_backend(url, 1).await.unwrap();
        }
        Arc::new(lb)
    }

    fn request(host: &str, path: &str) -> Request<String> {
        Request::builder()
            .uri(path)
            .header(HOST, host)
            .body(String::new())
            .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_forwards_and_releases() {
        let lb = balancer(Policy::RoundRobin, &["http://10.0.0.1:80", "http://10.0.0.2:80"]).await;
        let dispatcher = Dispatcher::new(Arc::clone(&lb), EchoForwarder::default(), HashKey::Host);

        let response = dispatcher.dispatch(request("example.com", "/a"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), "10.0.0.2:80 /a");

        assert_eq!(*dispatcher.forwarder.observed_in_flight.lock().unwrap(), vec![1]);
        for backend in lb.backends().iter() {
            assert_eq!(backend.in_flight(), 0);
        }
    }

    #[tokio::test]
    async fn test_dispatch_without_backends_is_unavailable() {
        let lb = balancer(Policy::RoundRobin, &[]).await;
        let dispatcher = Dispatcher::new(lb, EchoForwarder::default(), HashKey::Host);

        let result = dispatcher.try_dispatch(request("example.com", "/"), None).await;
        assert!(matches!(result, Err(LoadBalancerError::NoHealthyBackends)));

        let response = dispatcher.dispatch(request("example.com", "/"), None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.body(), "Service Unavailable");
    }

    #[tokio::test]
    async fn test_dispatch_all_dead_is_unavailable() {
        for policy in Policy::ALL {
            let lb = balancer(policy, &["http://10.0.0.1:80", "http://10.0.0.2:80"]).await;
            for backend in lb.backends().iter() {
                backend.set_alive(false);
            }
            let dispatcher = Dispatcher::new(lb, EchoForwarder::default(), HashKey::Host);

            let response = dispatcher.dispatch(request("example.com", "/"), None).await;
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE, "{policy}");
            assert!(dispatcher.forwarder.observed_in_flight.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_forward_failure_is_unavailable_and_released() {
        let lb = balancer(Policy::RoundRobin, &["http://10.0.0.1:80"]).await;
        let forwarder = EchoForwarder {
            fail: true,
            ..EchoForwarder::default()
        };
        let dispatcher = Dispatcher::new(Arc::clone(&lb), forwarder, HashKey::Host);

        let result = dispatcher.try_dispatch(request("example.com", "/"), None).await;
        assert!(matches!(result, Err(LoadBalancerError::ForwardFailed(_))));

        let response = dispatcher.dispatch(request("example.com", "/"), None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(!response.body().contains("10.0.0.1"));

        let backend = &lb.backends()[0];
        assert_eq!(backend.in_flight(), 0);
        assert_eq!(backend.stats().failed_request_count(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_dispatch_releases_in_flight() {
        let lb = balancer(Policy::RoundRobin, &["http://10.0.0.1:80"]).await;
        let forwarder = EchoForwarder {
            hang: true,
            ..EchoForwarder::default()
        };
        let dispatcher = Dispatcher::new(Arc::clone(&lb), forwarder, HashKey::Host);

        let result = tokio::time::timeout(
            Duration::from_millis(50),
            dispatcher.dispatch(request("example.com", "/"), None),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(lb.backends()[0].in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dispatch_counts_balance() {
        let lb = balancer(Policy::LeastConnections, &["http://10.0.0.1:80"]).await;
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&lb),
            EchoForwarder::default(),
            HashKey::Host,
        ));

        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    dispatcher
                        .dispatch(request("example.com", &format!("/{i}")), None)
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().status(), StatusCode::OK);
        }

        let backend = &lb.backends()[0];
        assert_eq!(backend.in_flight(), 0);
        assert_eq!(backend.stats().total_request_count(), 64);
        assert!(dispatcher
            .forwarder
            .observed_in_flight
            .lock()
            .unwrap()
            .iter()
            .all(|&n| n >= 1));
    }

    #[tokio::test]
    async fn test_least_connections_spreads_concurrent_requests() {
        let lb = balancer(Policy::LeastConnections, &["http://10.0.0.1:80", "http://10.0.0.2:80"]).await;
        let backends = lb.backends();
        let _busy = backends[0].begin_request();

        let dispatcher = Dispatcher::new(Arc::clone(&lb), EchoForwarder::default(), HashKey::Host);
        let response = dispatcher.dispatch(request("example.com", "/"), None).await;
        assert_eq!(response.body(), "10.0.0.2:80 /");
    }

    #[tokio::test]
    async fn test_ip_hash_is_sticky_per_key() {
        let lb = balancer(
            Policy::IpHash,
            &["http://10.0.0.1:80", "http://10.0.0.2:80", "http://10.0.0.3:80"],
        )
        .await;
        let dispatcher = Dispatcher::new(lb, EchoForwarder::default(), HashKey::ClientIp);
        let client: SocketAddr = "192.168.1.100:50000".parse().unwrap();

        let first = dispatcher.dispatch(request("example.com", "/"), Some(client)).await;
        for port in [50001, 50002, 50003] {
            let client = SocketAddr::new(client.ip(), port);
            let again = dispatcher.dispatch(request("example.com", "/"), Some(client)).await;
            assert_eq!(again.body(), first.body());
        }
    }

    #[tokio::test]
    async fn test_selection_key() {
        let lb = balancer(Policy::IpHash, &[]).await;
        let client: SocketAddr = "192.168.1.100:12345".parse().unwrap();
        let req = Request::builder()
            .uri("/path")
            .header(HOST, "example.com:8080")
            .header("x-session", "abc")
            .body(String::new())
            .unwrap();

        let by_host = Dispatcher::new(Arc::clone(&lb), EchoForwarder::default(), HashKey::Host);
        assert_eq!(by_host.selection_key(&req, Some(client)), "example.com:8080");

        let by_ip = Dispatcher::new(Arc::clone(&lb), EchoForwarder::default(), HashKey::ClientIp);
        assert_eq!(by_ip.selection_key(&req, Some(client)), "192.168.1.100");
        assert_eq!(by_ip.selection_key(&req, None), "example.com:8080");

        let by_header = Dispatcher::new(
            Arc::clone(&lb),
            EchoForwarder::default(),
            HashKey::Header("X-Session".to_string()),
        );
        assert_eq!(by_header.selection_key(&req, None), "abc");

        let absolute = Request::builder()
            .uri("http://origin.test/x")
            .body(String::new())
            .unwrap();
        assert_eq!(by_host.selection_key(&absolute, None), "origin.test");
    }
}
