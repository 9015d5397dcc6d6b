//! `/metrics` endpoint

use anyhow::{Context, Result};
use common::MetricsRegistry;
use common::metrics::CONTENT_TYPE;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode, header};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// Answer one scrape request
pub fn respond(registry: &MetricsRegistry, req: &Request<Body>) -> Response<Body> {
    let status = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            return Response::builder()
                .header(header::CONTENT_TYPE, CONTENT_TYPE)
                .body(Body::from(registry.render()))
                .unwrap_or_else(|_| Response::new(Body::empty()));
        }
        (_, "/metrics") => StatusCode::METHOD_NOT_ALLOWED,
        _ => StatusCode::NOT_FOUND,
    };

    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

/// Serve metrics on `addr` until `shutdown` resolves
pub async fn serve<F>(addr: SocketAddr, registry: Arc<MetricsRegistry>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move {
                    debug!("{} {}", req.method(), req.uri().path());
                    Ok::<_, Infallible>(respond(&registry, &req))
                }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("Failed to bind metrics endpoint to {}", addr))?
        .serve(make_svc);
    info!("Serving metrics on http://{}/metrics", server.local_addr());

    server
        .with_graceful_shutdown(shutdown)
        .await
        .context("Metrics endpoint failed")?;

    info!("Metrics endpoint stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Counter, TelemetrySink};

    fn request(method: Method, path: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_metrics_body() {
        let registry = MetricsRegistry::new();
        registry.register_device("S1", "iphone");
        registry.add(Counter::UsbSendBytes, "S1", 72);
        registry.set_device_count(1);

        let response = respond(&registry, &request(Method::GET, "/metrics"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );

        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("device_count 1"));
        assert!(text.contains("usb_send_bytes{serial=\"S1\"} 72"));
    }

    #[tokio::test]
    async fn test_unknown_path_and_method() {
        let registry = MetricsRegistry::new();

        let response = respond(&registry, &request(Method::GET, "/"));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = respond(&registry, &request(Method::POST, "/metrics"));
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let registry = Arc::new(MetricsRegistry::new());
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

        serve(addr, registry, async {}).await.unwrap();
    }
}
