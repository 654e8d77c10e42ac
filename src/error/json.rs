use crate::error::app_error::AppError;
use rocket::data::{ByteUnit, Data, ToByteUnit};
use rocket::request::Request;
use serde_json::Value;
use tracing::warn;

const DEFAULT_JSON_LIMIT_MIB: u64 = 1;

/// Reads and parses a JSON request body, logging structured information about
/// failures (size, line/column, category and a body preview).
///
/// An empty body yields `Ok(None)` so bodiless mutations still pass through the
/// pipeline.
pub async fn read_json_body(req: &Request<'_>, data: Data<'_>) -> Result<Option<Value>, AppError> {
    let limit: ByteUnit = req.limits().get("json").unwrap_or_else(|| DEFAULT_JSON_LIMIT_MIB.mebibytes());

    let bytes = match data.open(limit).into_bytes().await {
        Ok(bytes) if bytes.is_complete() => bytes.into_inner(),
        Ok(_) => {
            warn!(
                method = %req.method(),
                uri = %req.uri(),
                "JSON payload exceeded size limit"
            );
            return Err(AppError::BadRequest("Payload too large".to_string()));
        }
        Err(e) => {
            warn!(
                method = %req.method(),
                uri = %req.uri(),
                error = %e,
                "Failed to read request body"
            );
            return Err(AppError::BadRequest("Unable to read request body".to_string()));
        }
    };

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            let body_preview = String::from_utf8_lossy(&bytes);
            let body_preview: String = body_preview.chars().take(500).collect();

            warn!(
                method = %req.method(),
                uri = %req.uri(),
                error_message = %e,
                error_line = e.line(),
                error_column = e.column(),
                error_category = ?e.classify(),
                request_body = %body_preview,
                "Failed to parse JSON request body"
            );

            Err(AppError::BadRequest(format!("Malformed JSON body: {}", e)))
        }
    }
}

/// Deserializes an already-parsed body into the handler's payload type.
pub fn decode_payload<T: serde::de::DeserializeOwned>(body: Option<Value>) -> Result<T, AppError> {
    let value = body.unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| {
        warn!(error_message = %e, "Request body did not match the expected shape");
        AppError::BadRequest(format!("Invalid request body: {}", e))
    })
}
