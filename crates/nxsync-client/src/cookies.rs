use cookie_store::{Cookie, CookieStore};
use reqwest::header::HeaderValue;
use reqwest_cookie_store::CookieStoreMutex;
use std::convert::Infallible;
use std::fmt;
use std::sync::{MutexGuard, PoisonError};

/// Cookie store shared by every request of a transfer session.
///
/// Servers pin upload batches to the session; an unknown batch means the
/// pinned session is gone and [`clear_session_cookies`](Self::clear_session_cookies)
/// lets the next batch start on a fresh one.
pub struct SessionJar {
    store: CookieStoreMutex,
}

impl Default for SessionJar {
    fn default() -> Self {
        Self {
            store: CookieStoreMutex::new(CookieStore::default()),
        }
    }
}

impl fmt::Debug for SessionJar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionJar")
            .field("cookies", &self.len())
            .finish()
    }
}

impl SessionJar {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CookieStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self, header: &str, url: &url::Url) {
        match self.lock().parse(header, url) {
            Ok(action) => tracing::trace!(%url, ?action, "set-cookie"),
            Err(error) => tracing::debug!(%url, %error, "ignoring rejected set-cookie header"),
        }
    }

    /// `name=value` pairs to send to `url`.
    pub fn cookies_for(&self, url: &url::Url) -> Vec<(String, String)> {
        self.lock()
            .get_request_values(url)
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    /// Drops every cookie without an expiry, along with anything already
    /// expired, and returns how many went.
    pub fn clear_session_cookies(&self) -> usize {
        let mut store = self.lock();
        let before = store.iter_any().count();
        let kept: Vec<Cookie<'static>> = store
            .iter_unexpired()
            .filter(|cookie| cookie.is_persistent())
            .cloned()
            .collect();
        let removed = before - kept.len();
        *store = CookieStore::from_cookies(kept.into_iter().map(Ok::<_, Infallible>), false)
            .unwrap_or_default();
        removed
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().iter_unexpired().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl reqwest::cookie::CookieStore for SessionJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &url::Url) {
        reqwest::cookie::CookieStore::set_cookies(&self.store, cookie_headers, url);
    }

    fn cookies(&self, url: &url::Url) -> Option<HeaderValue> {
        reqwest::cookie::CookieStore::cookies(&self.store, url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::cookie::CookieStore as _;

    fn url(raw: &str) -> url::Url {
        url::Url::parse(raw).unwrap()
    }

    #[test]
    fn session_cookies_are_cleared_and_persistent_ones_kept() {
        let jar = SessionJar::new();
        let server = url("http://localhost:8080/nuxeo/site/automation/");
        jar.store("JSESSIONID=abc; Path=/nuxeo; HttpOnly", &server);
        jar.store("remember=1; Path=/; Max-Age=3600", &server);
        jar.store("device=d1; Path=/; Expires=Thu, 01 Jan 2099 00:00:00 GMT", &server);
        assert_eq!(jar.cookies_for(&server).len(), 3);
        assert_eq!(jar.clear_session_cookies(), 1);
        let mut left = jar.cookies_for(&server);
        left.sort();
        assert_eq!(
            left,
            vec![
                ("device".to_string(), "d1".to_string()),
                ("remember".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn past_expires_deletes_the_cookie() {
        let jar = SessionJar::new();
        let server = url("http://localhost:8080/nuxeo/");
        jar.store("a=1; Path=/", &server);
        assert_eq!(jar.len(), 1);
        jar.store("a=deleted; Path=/; Expires=Thu, 01 Jan 1970 00:00:00 GMT", &server);
        assert!(jar.cookies_for(&server).is_empty());
        assert!(jar.is_empty());
        assert!(jar.cookies(&server).is_none());
        assert_eq!(jar.clear_session_cookies(), 0);
        assert!(jar.is_empty());
    }

    #[test]
    fn cookies_follow_path_and_host() {
        let jar = SessionJar::new();
        jar.store(
            "JSESSIONID=abc; Path=/nuxeo",
            &url("http://localhost:8080/nuxeo/api/v1/upload"),
        );
        assert!(jar
            .cookies_for(&url("http://localhost:8080/nuxeo/site/automation/"))
            .iter()
            .any(|(k, _)| k == "JSESSIONID"));
        assert!(jar.cookies_for(&url("http://localhost:8080/other")).is_empty());
        assert!(jar.cookies_for(&url("http://localhost:8080/nuxeox")).is_empty());
        assert!(jar.cookies_for(&url("http://elsewhere/nuxeo/")).is_empty());
    }

    #[test]
    fn replaced_and_expired_cookies() {
        let jar = SessionJar::new();
        let server = url("https://cloud.example.com/nuxeo/");
        jar.store("a=1; Path=/", &server);
        jar.store("a=2; Path=/", &server);
        assert_eq!(jar.len(), 1);
        assert_eq!(jar.cookies_for(&server)[0].1, "2");
        jar.store("a=gone; Path=/; Max-Age=0", &server);
        assert!(jar.is_empty());
    }

    #[test]
    fn header_value_carries_matching_pairs() {
        let jar = SessionJar::new();
        let server = url("https://cloud.example.com/nuxeo/");
        jar.store("a=1; Path=/", &server);
        jar.store("b=2; Path=/; Domain=example.com", &server);
        let header = jar.cookies(&url("https://cloud.example.com/")).unwrap();
        let mut pairs: Vec<&str> = header.to_str().unwrap().split("; ").collect();
        pairs.sort_unstable();
        assert_eq!(pairs, vec!["a=1", "b=2"]);
        let sub = jar.cookies(&url("https://api.example.com/")).unwrap();
        assert_eq!(sub.to_str().unwrap(), "b=2");
    }

    #[test]
    fn set_cookie_headers_are_stored() {
        let jar = SessionJar::new();
        let server = url("http://127.0.0.1:8080/nuxeo/site/automation/");
        let headers = [HeaderValue::from_static("JSESSIONID=s1; Path=/nuxeo; HttpOnly")];
        jar.set_cookies(&mut headers.iter(), &server);
        assert_eq!(jar.len(), 1);
        jar.clear();
        assert!(jar.is_empty());
    }
}
