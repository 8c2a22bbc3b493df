use actix_web::{
    http::header::{ContentType, LOCATION},
    post,
    web::{scope, Data, ServiceConfig},
    HttpResponse,
};
use actix_web_validator::Json;

use super::models::BackupRequest;
use super::service::{BackupService, ServiceError};
use crate::backup::BackupError;

/// Queue a backup.
///
/// 201 with `Location` set to the status URL and the status document as body.
#[post("")]
async fn create_backup(
    service: Data<BackupService>,
    request: Json<BackupRequest>,
) -> Result<HttpResponse, ServiceError> {
    let document = service.request_backup(&request).await?;
    let body = document.render().map_err(BackupError::from)?;

    let mut response = HttpResponse::Created();
    if let Some(url) = &document.status_url {
        response.insert_header((LOCATION, url.as_str()));
    }
    Ok(response.content_type(ContentType::json()).body(body))
}

pub fn backup_config(config: &mut ServiceConfig) {
    config.service(scope("/backups").service(create_backup));
}
