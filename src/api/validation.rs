use actix_web::HttpResponse;
use serde::Serialize;

/// Error body shared by every endpoint: `{"errors": [...]}`
#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    pub errors: Vec<String>,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
        }
    }
}

fn bad_request(errors: Vec<String>) -> actix_web::Error {
    actix_web::error::InternalError::from_response(
        "",
        HttpResponse::BadRequest().json(ErrorResponse { errors }),
    )
    .into()
}

/// Creates a configured JsonConfig with standardized error handling for the entire project
pub fn json_config() -> actix_web_validator::JsonConfig {
    actix_web_validator::JsonConfig::default().error_handler(|err, _req| match err {
        actix_web_validator::Error::Validate(validation_errors) => {
            let mut errors: Vec<String> = validation_errors
                .field_errors()
                .into_iter()
                .flat_map(|(field, errors)| {
                    errors.iter().map(move |e| {
                        e.message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| format!("Parameter '{}' is invalid", field))
                    })
                })
                .collect();
            errors.sort();
            errors.dedup();
            bad_request(errors)
        }
        actix_web_validator::Error::Deserialize(de_err) => {
            let message = if de_err.to_string().contains("EOF while parsing") {
                "Request body is empty. Expected JSON payload"
            } else {
                "Invalid JSON format"
            };
            bad_request(vec![message.to_string()])
        }
        _ => bad_request(vec!["Invalid request".to_string()]),
    })
}
