use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use axum_extra::extract::{cookie::Cookie, CookieJar};
use dto::MessageResponse;

use crate::{
    auth::{session_token, SESSION_COOKIE},
    state::AppState,
};

pub(super) fn routes() -> Router<AppState> {
    Router::new().route("/auth/logout", post(logout))
}

/// Clears the session cookie and revokes the token until it expires. Works
/// for expired or missing sessions too.
async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> (StatusCode, CookieJar, Json<MessageResponse>) {
    let mut removal = Cookie::build((SESSION_COOKIE, "")).path("/").build();
    removal.make_removal();
    let jar = jar.add(removal);

    let claims = session_token(&headers)
        .and_then(|token| state.verifier().verify(&token).ok().map(|claims| (token, claims)));
    if let Some((token, claims)) = claims {
        if let Err(error) = state.revocations().revoke(&token, claims.exp).await {
            tracing::error!(%error, user_id = claims.id, "failed to revoke session");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                jar,
                Json(MessageResponse {
                    message: "Error al cerrar sesión".into(),
                }),
            );
        }
        tracing::info!(user_id = claims.id, "session closed");
    }

    (
        StatusCode::OK,
        jar,
        Json(MessageResponse {
            message: "Sesión cerrada correctamente".into(),
        }),
    )
}
