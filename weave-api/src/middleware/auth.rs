use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use weave_core::identity::{Actor, Role};

use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: Uuid,
    pub role: Role,
    pub exp: usize,
}

/// Signs a token for `actor`; used by the login service and the tests.
pub fn issue_token(actor: &Actor, secret: &str, ttl_seconds: u64) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: actor.user_id,
        role: actor.role,
        exp: (chrono::Utc::now().timestamp() as u64 + ttl_seconds) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
}

fn authenticate(state: &AppState, req: &Request) -> Result<Actor, StatusCode> {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.auth.secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| StatusCode::UNAUTHORIZED)?;

    Ok(Actor::new(token_data.claims.sub, token_data.claims.role))
}

/// Any signed-in user; the engine decides what their role may do.
pub async fn auth_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let actor = authenticate(&state, &req)?;
    req.extensions_mut().insert(actor);
    Ok(next.run(req).await)
}

pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let actor = authenticate(&state, &req)?;
    if !actor.is_staff() {
        return Err(StatusCode::FORBIDDEN);
    }
    req.extensions_mut().insert(actor);
    Ok(next.run(req).await)
}
