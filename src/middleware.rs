use actix_web::cookie::Cookie;
use actix_web::{dev, Error, FromRequest, HttpRequest};
use futures::future::{ready, Ready};

use crate::util::generate_random_string;

pub const SESSION_COOKIE: &str = "sessionid";
const SESSION_ID_LEN: usize = 32;

/// Identity of the browser session, taken from the session cookie.
///
/// A request without the cookie gets a freshly minted id; handlers that
/// store state for it must send [`SessionId::cookie`] back.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    id: String,
    fresh: bool,
}

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        SessionId {
            id: id.into(),
            fresh: false,
        }
    }

    pub fn generate() -> Self {
        SessionId {
            id: generate_random_string(SESSION_ID_LEN),
            fresh: true,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn cookie(&self) -> Cookie<'static> {
        Cookie::build(SESSION_COOKIE, self.id.clone())
            .path("/")
            .http_only(true)
            .finish()
    }
}

impl FromRequest for SessionId {
    type Error = Error;
    type Future = Ready<Result<SessionId, Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut dev::Payload) -> Self::Future {
        let session = match req.cookie(SESSION_COOKIE) {
            Some(cookie) if !cookie.value().is_empty() => SessionId::new(cookie.value()),
            _ => SessionId::generate(),
        };

        ready(Ok(session))
    }
}

/// Whether the request was issued by the page's own scripts.
pub fn is_ajax(req: &HttpRequest) -> bool {
    req.headers()
        .get("X-Requested-With")
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| value == "XMLHttpRequest")
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[tokio::test]
    async fn test_session_from_cookie() {
        let req = TestRequest::default()
            .cookie(Cookie::new(SESSION_COOKIE, "abc123"))
            .to_http_request();

        let session = SessionId::extract(&req).await.unwrap();

        assert_eq!(session.as_str(), "abc123");
        assert!(!session.is_fresh());
    }

    #[tokio::test]
    async fn test_session_minted_without_cookie() {
        let req = TestRequest::default().to_http_request();

        let first = SessionId::extract(&req).await.unwrap();
        let second = SessionId::extract(&req).await.unwrap();

        assert!(first.is_fresh());
        assert_eq!(first.as_str().len(), SESSION_ID_LEN);
        assert_ne!(first.as_str(), second.as_str());
        assert_eq!(first.cookie().name(), SESSION_COOKIE);
    }

    #[test]
    fn test_is_ajax() {
        let xhr = TestRequest::default()
            .insert_header(("X-Requested-With", "XMLHttpRequest"))
            .to_http_request();
        let plain = TestRequest::default().to_http_request();

        assert!(is_ajax(&xhr));
        assert!(!is_ajax(&plain));
    }
}
