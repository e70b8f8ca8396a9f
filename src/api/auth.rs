use axum::{extract::Request, http::HeaderMap, middleware::Next, response::Response};
use subtle::ConstantTimeEq;

use super::error::ApiError;

/// Extract a Bearer token from the Authorization header.
pub(crate) fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth_str = headers.get("authorization")?.to_str().ok()?;
    auth_str.strip_prefix("Bearer ").map(str::to_string)
}

/// Auth middleware: the request must carry `Authorization: Bearer <expected_token>`.
pub async fn require_auth(
    expected_token: String,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    match extract_bearer(req.headers()) {
        Some(token) if token.as_bytes().ct_eq(expected_token.as_bytes()).into() => {
            Ok(next.run(req).await)
        }
        Some(_) => Err(ApiError::AuthInvalid),
        None => Err(ApiError::AuthRequired),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    async fn ok_handler() -> &'static str {
        "ok"
    }

    fn test_app(token: &str) -> Router {
        let token = token.to_string();
        Router::new()
            .route("/test", get(ok_handler))
            .layer(axum::middleware::from_fn(move |req, next| {
                let t = token.clone();
                async move { require_auth(t, req, next).await }
            }))
    }

    async fn status_with(header: Option<&str>) -> StatusCode {
        let mut req = Request::builder().uri("/test");
        if let Some(value) = header {
            req = req.header("authorization", value);
        }
        test_app("secret")
            .oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[test]
    fn extract_bearer_with_header() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer my-secret-token".parse().unwrap());
        assert_eq!(extract_bearer(&headers), Some("my-secret-token".to_string()));
    }

    #[test]
    fn extract_bearer_ignores_other_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic abc".parse().unwrap());
        assert_eq!(extract_bearer(&headers), None);
        assert_eq!(extract_bearer(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn valid_token_passes() {
        assert_eq!(status_with(Some("Bearer secret")).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_token_is_401() {
        assert_eq!(status_with(None).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_token_is_403() {
        assert_eq!(status_with(Some("Bearer nope")).await, StatusCode::FORBIDDEN);
    }
}
