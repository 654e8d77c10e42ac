use crate::auth::idempotency_claim;
use crate::service::AppServices;
use rocket::fairing::{Fairing, Info, Kind};
use rocket::{Request, Response};
use std::io::Cursor;
use tracing::{debug, error};

/// Finishes the idempotency reservation made during admission: 2xx responses
/// are stored for replay, anything else frees the key for a retry.
pub struct IdempotencyRecorder;

#[rocket::async_trait]
impl Fairing for IdempotencyRecorder {
    fn info(&self) -> Info {
        Info {
            name: "Idempotency Recorder",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, request: &'r Request<'_>, response: &mut Response<'r>) {
        let Some(claim) = idempotency_claim(request) else {
            return;
        };
        let Some(services) = request.rocket().state::<AppServices>() else {
            return;
        };

        let status = response.status();
        let result = if status.class().is_success() {
            match response.body_mut().to_string().await {
                Ok(body) => {
                    response.set_sized_body(body.len(), Cursor::new(body.clone()));
                    services
                        .idempotency
                        .complete_idempotent(&claim.tenant_id, &claim.key, status.code, &body, services.clock.now())
                        .await
                }
                Err(err) => {
                    error!(key = %claim.key, error = %err, "could not read response body for idempotency record");
                    services.idempotency.release_idempotent(&claim.tenant_id, &claim.key).await
                }
            }
        } else {
            services.idempotency.release_idempotent(&claim.tenant_id, &claim.key).await
        };

        match result {
            Ok(()) => debug!(key = %claim.key, status = status.code, "idempotency key settled"),
            Err(err) => error!(key = %claim.key, error = ?err, "failed to settle idempotency key"),
        }
    }
}
