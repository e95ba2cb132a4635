use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{HeaderMap, request::Parts},
};

use crate::{
    error::AppError,
    models::{Actor, Role},
};

/// Set by the upstream session service; trusted as-is.
pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

pub fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, AppError> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or("");
    if user_id.is_empty() {
        return Err(AppError::unauthenticated("no acting user"));
    }
    let role = headers
        .get(USER_ROLE_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<Role>().ok())
        .ok_or_else(|| AppError::unauthenticated("missing or unknown role"))?;
    Ok(Actor::new(user_id, role))
}

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        actor_from_headers(&parts.headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use axum::http::HeaderValue;

    fn headers(user: Option<&str>, role: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(user) = user {
            headers.insert(USER_ID_HEADER, HeaderValue::from_str(user).unwrap());
        }
        if let Some(role) = role {
            headers.insert(USER_ROLE_HEADER, HeaderValue::from_str(role).unwrap());
        }
        headers
    }

    #[test]
    fn resolves_user_and_role() {
        let actor = actor_from_headers(&headers(Some("u-1"), Some("Provider"))).unwrap();
        assert_eq!(actor, Actor::new("u-1", Role::Owner));
    }

    #[test]
    fn missing_identity_is_unauthenticated() {
        for (user, role) in [(None, Some("client")), (Some("  "), Some("client")), (Some("u-1"), None), (Some("u-1"), Some("root"))] {
            let err = actor_from_headers(&headers(user, role)).unwrap_err();
            assert_eq!(err.kind, ErrorKind::Unauthenticated);
        }
    }
}
