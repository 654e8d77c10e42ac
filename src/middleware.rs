pub mod idempotency;
pub mod rate_limit;

use crate::pipeline::stages::{REQUEST_ID_HEADER, propagate_request_id};
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::Header;
use rocket::request::Request;
use rocket::{Data, Response};
use tracing::{info, warn};

/// Correlation id for one request: the caller's `X-Request-Id` when it is
/// usable, otherwise a fresh UUID.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl RequestId {
    /// The id for `req`, assigned on first use and stable afterwards.
    pub fn peek(req: &Request<'_>) -> String {
        req.local_cache(|| RequestId(propagate_request_id(req.headers().get_one(REQUEST_ID_HEADER))))
            .0
            .clone()
    }
}

/// Fairing that assigns the request id and logs request/response information
pub struct RequestLogger;

#[rocket::async_trait]
impl Fairing for RequestLogger {
    fn info(&self) -> Info {
        Info {
            name: "Request Logger",
            kind: Kind::Request | Kind::Response,
        }
    }

    async fn on_request(&self, request: &mut Request<'_>, _: &mut Data<'_>) {
        let request_id = RequestId::peek(request);

        info!(
            request_id = %request_id,
            method = %request.method(),
            uri = %request.uri(),
            "incoming request"
        );
    }

    async fn on_response<'r>(&self, request: &'r Request<'_>, response: &mut Response<'r>) {
        let request_id = RequestId::peek(request);
        let status = response.status();
        let user_id = request
            .local_cache(|| None::<crate::auth::AuthSnapshot>)
            .as_ref()
            .map(|u| u.user_id.to_string())
            .unwrap_or_else(|| "anonymous".to_string());

        response.set_header(Header::new("X-Request-Id", request_id.clone()));

        response.set_header(Header::new("X-Content-Type-Options", "nosniff"));
        response.set_header(Header::new("X-Frame-Options", "DENY"));
        response.set_header(Header::new("Cache-Control", "no-store"));

        if status.class().is_server_error() || status.class().is_client_error() {
            warn!(
                request_id = %request_id,
                user_id = %user_id,
                method = %request.method(),
                uri = %request.uri(),
                status = %status.code,
                "request completed with error"
            );
        } else {
            info!(
                request_id = %request_id,
                user_id = %user_id,
                method = %request.method(),
                uri = %request.uri(),
                status = %status.code,
                "request completed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocket::local::asynchronous::Client;
    use rocket::{get, routes};
    use uuid::Uuid;

    #[get("/echo")]
    fn echo() -> &'static str {
        "ok"
    }

    async fn client() -> Client {
        let rocket = rocket::build().attach(RequestLogger).mount("/", routes![echo]);
        Client::tracked(rocket).await.expect("valid rocket instance")
    }

    #[rocket::async_test]
    async fn response_carries_generated_request_id() {
        let client = client().await;
        let response = client.get("/echo").dispatch().await;

        let id = response.headers().get_one("X-Request-Id").expect("request id header");
        assert!(Uuid::parse_str(id).is_ok());
        assert_eq!(response.headers().get_one("X-Frame-Options"), Some("DENY"));
    }

    #[rocket::async_test]
    async fn inbound_request_id_is_propagated() {
        let client = client().await;
        let response = client.get("/echo").header(Header::new("X-Request-Id", "trace-abc-123")).dispatch().await;

        assert_eq!(response.headers().get_one("X-Request-Id"), Some("trace-abc-123"));
    }
}
