//! Correlation-ID middleware.
//!
//! Every request is tagged with a trace id resolved from, in priority
//! order, `X-Correlation-ID`, `X-Request-ID`, `X-Trace-ID`, or a freshly
//! generated UUID. The resolved id is stored in the request extensions for
//! handlers and echoed back as `X-Correlation-ID`.

use std::future::{ready, Future, Ready};
use std::pin::Pin;

use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::{Error, HttpMessage, HttpRequest};
use uuid::Uuid;

const CORRELATION_HEADER: &str = "x-correlation-id";
const FALLBACK_HEADERS: [&str; 2] = ["x-request-id", "x-trace-id"];

/// The resolved trace id, available from request extensions.
#[derive(Debug, Clone)]
pub struct TraceId(pub String);

/// Reads the request's trace id; falls back to a fresh UUID if the
/// middleware did not run (tests).
pub fn trace_id(req: &HttpRequest) -> String {
    req.extensions()
        .get::<TraceId>()
        .map(|t| t.0.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn resolve_trace_id(req: &ServiceRequest) -> String {
    std::iter::once(CORRELATION_HEADER)
        .chain(FALLBACK_HEADERS)
        .find_map(|name| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

#[derive(Debug, Clone, Default)]
pub struct Correlation;

impl<S, B> Transform<S, ServiceRequest> for Correlation
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = CorrelationMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(CorrelationMiddleware { service }))
    }
}

pub struct CorrelationMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for CorrelationMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let trace_id = resolve_trace_id(&req);
        req.extensions_mut().insert(TraceId(trace_id.clone()));

        let fut = self.service.call(req);
        Box::pin(async move {
            let mut res = fut.await?;
            if let Ok(value) = HeaderValue::from_str(&trace_id) {
                res.headers_mut()
                    .insert(HeaderName::from_static(CORRELATION_HEADER), value);
            }
            Ok(res)
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, web, App, HttpResponse};

    async fn echo(req: HttpRequest) -> HttpResponse {
        HttpResponse::Ok().body(trace_id(&req))
    }

    #[actix_web::test]
    async fn correlation_header_wins_and_is_echoed() {
        let app = test::init_service(
            App::new()
                .wrap(Correlation)
                .route("/", web::get().to(echo)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/")
            .insert_header(("X-Correlation-ID", "corr-1"))
            .insert_header(("X-Request-ID", "req-1"))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(
            res.headers().get("x-correlation-id").unwrap().to_str().unwrap(),
            "corr-1"
        );
        let body = test::read_body(res).await;
        assert_eq!(body, "corr-1");
    }

    #[actix_web::test]
    async fn fallback_headers_resolve_in_priority_order() {
        let app = test::init_service(
            App::new()
                .wrap(Correlation)
                .route("/", web::get().to(echo)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/")
            .insert_header(("X-Trace-ID", "trace-1"))
            .insert_header(("X-Request-ID", "req-1"))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(
            res.headers().get("x-correlation-id").unwrap().to_str().unwrap(),
            "req-1"
        );
    }

    #[actix_web::test]
    async fn missing_headers_generate_a_uuid() {
        let app = test::init_service(
            App::new()
                .wrap(Correlation)
                .route("/", web::get().to(echo)),
        )
        .await;

        let res = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        let echoed = res
            .headers()
            .get("x-correlation-id")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(Uuid::parse_str(&echoed).is_ok());
    }
}
