use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use parlor_types::error::Error;

use crate::auth::{AppState, authenticate};
use crate::error::ApiError;

/// Extract and validate JWT from Authorization header, then attach the
/// resolved [`AuthUser`](crate::auth::AuthUser) to the request.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(Error::Unauthenticated)?;

    let user = authenticate(&state, token).await?;

    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}
