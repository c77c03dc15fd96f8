use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};

use crate::db::{AppState, queries};
use crate::downloads::{AccessError, Rejection};
use crate::email::escape_html;
use crate::error::msg;
use crate::storage::StoredFile;
use crate::util::extract_request_info;

pub fn router(requests_per_minute: u32) -> Router<AppState> {
    let router = Router::new()
        .route("/download/{token}", get(download_photo))
        .route("/download/batch/{token}", get(download_batch));
    match crate::rate_limit::layer(requests_per_minute) {
        Some(limiter) => router.layer(limiter),
        None => router,
    }
}

/// Serve one purchased photo.
///
/// The attempt is only consumed once the file is known to exist, so a storage
/// problem does not eat into the buyer's allowance.
pub async fn download_photo(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Response {
    match serve_photo(&state, &token, &headers).await {
        Ok(response) => response,
        Err(e) => unavailable(e),
    }
}

async fn serve_photo(
    state: &AppState,
    token: &str,
    headers: &HeaderMap,
) -> Result<Response, AccessError> {
    let download = state.links.resolve(token)?;

    let item = {
        let conn = state.db.get()?;
        queries::get_order_item(&conn, download.order_id, download.photo_id)?
    };
    let Some(item) = item else {
        tracing::error!(
            download_id = download.id,
            order_id = download.order_id,
            photo_id = download.photo_id,
            "Download grant has no matching order item"
        );
        return Err(Rejection::Invalid.into());
    };

    let Some(file) = state.photos.read_photo(item.photo_id, &item.filename).await? else {
        tracing::error!(
            download_id = download.id,
            photo_id = item.photo_id,
            "Photo file not found in storage"
        );
        return Err(Rejection::Invalid.into());
    };

    let (ip, user_agent) = extract_request_info(headers);
    if state
        .links
        .record_attempt(download.id, ip.as_deref(), user_agent.as_deref())?
        .is_none()
    {
        return Err(Rejection::Exhausted.into());
    }

    Ok(attachment(file))
}

/// Serve the order's archive, or ask for it to be built and show a holding page.
pub async fn download_batch(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Response {
    match serve_batch(&state, &token).await {
        Ok(response) => response,
        Err(e) => unavailable(e),
    }
}

async fn serve_batch(state: &AppState, token: &str) -> Result<Response, AccessError> {
    let order = state.links.resolve_batch(token)?;

    if let Some(archive) = state.photos.read_archive(order.id).await? {
        return Ok(attachment(StoredFile {
            filename: format!("order_{}_photos.zip", order.order_number),
            ..archive
        }));
    }

    let photo_ids: Vec<i64> = {
        let conn = state.db.get()?;
        queries::list_order_items(&conn, order.id)?
            .into_iter()
            .map(|item| item.photo_id)
            .collect()
    };
    state.photos.request_archive(&order, &photo_ids).await?;

    Ok((
        StatusCode::ACCEPTED,
        Html(page("Preparing your download", msg::ARCHIVE_PREPARING)),
    )
        .into_response())
}

fn attachment(file: StoredFile) -> Response {
    let disposition = format!(
        "attachment; filename=\"{}\"",
        file.filename.replace(['"', '\\', '\r', '\n'], "_")
    );
    let mut response = file.bytes.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(file.content_type));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private, no-store"));
    response
}

fn unavailable(error: AccessError) -> Response {
    let (status, message) = match &error {
        AccessError::Rejected(rejection @ Rejection::Invalid) => {
            (StatusCode::NOT_FOUND, rejection.user_message())
        }
        AccessError::Rejected(rejection) => (StatusCode::GONE, rejection.user_message()),
        AccessError::Internal(e) => {
            tracing::error!(error = %e, "Download failed");
            (StatusCode::INTERNAL_SERVER_ERROR, msg::GENERIC_FAILURE)
        }
    };
    (status, Html(page("Download unavailable", message))).into_response()
}

fn page(title: &str, message: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>{title}</title></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 600px; margin: 40px auto; padding: 20px;">
<h2 style="color: #333;">{title}</h2>
<p style="color: #555;">{message}</p>
</body>
</html>"#,
        title = escape_html(title),
        message = escape_html(message),
    )
}
