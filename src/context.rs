use cookie::Cookie;
use http::HeaderMap;
use http::header::COOKIE;
use tracing::{debug, warn};

pub const TOKEN_COOKIE: &str = "token";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request state handed to every subgraph call of one client operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub token: Option<String>,
    pub trace_id: String,
}

impl RequestContext {
    pub fn new(token: Option<String>, trace_id: impl Into<String>) -> Self {
        RequestContext {
            token,
            trace_id: trace_id.into(),
        }
    }

    pub fn anonymous() -> Self {
        RequestContext::new(None, generate_trace_id())
    }

    pub fn from_headers(headers: &HeaderMap) -> Self {
        let trace_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(generate_trace_id);

        let token = extract_token(headers);
        if token.is_none() {
            debug!(trace_id = %trace_id, "no token cookie on request");
        }

        RequestContext { token, trace_id }
    }
}

pub fn generate_trace_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Looks up the `token` cookie. A missing or empty cookie is not an error.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let raw_cookies = match header.to_str() {
            Ok(cookies) => cookies,
            Err(e) => {
                warn!("failed to convert cookie header to string, ignoring it. error: {}", e);
                continue;
            }
        };

        for item in raw_cookies.split(';') {
            if item.trim().is_empty() {
                continue;
            }

            match Cookie::parse_encoded(item.trim()) {
                Ok(cookie) => {
                    let (name, value) = cookie.name_value_trimmed();
                    if name == TOKEN_COOKIE && !value.is_empty() {
                        return Some(value.to_string());
                    }
                }
                Err(e) => {
                    warn!("failed to parse cookie pair, ignoring it. error: {}", e);
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(cookies: &[&str]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for cookie in cookies {
            map.append(COOKIE, HeaderValue::from_str(cookie).unwrap());
        }
        map
    }

    #[test]
    fn token_cookie_found() {
        assert_eq!(extract_token(&headers(&["token=abc123"])), Some("abc123".to_string()));
    }

    #[test]
    fn token_among_other_cookies() {
        assert_eq!(
            extract_token(&headers(&["theme=dark; token=abc123; lang=en"])),
            Some("abc123".to_string())
        );
    }

    #[test]
    fn token_in_second_cookie_header() {
        assert_eq!(
            extract_token(&headers(&["theme=dark", "token=xyz"])),
            Some("xyz".to_string())
        );
    }

    #[test]
    fn percent_encoded_token_is_decoded() {
        assert_eq!(
            extract_token(&headers(&["token=a%20b"])),
            Some("a b".to_string())
        );
    }

    #[test]
    fn missing_or_empty_token_is_none() {
        assert_eq!(extract_token(&HeaderMap::new()), None);
        assert_eq!(extract_token(&headers(&["session=1"])), None);
        assert_eq!(extract_token(&headers(&["token="])), None);
        assert_eq!(extract_token(&headers(&[";;;;"])), None);
        assert_eq!(extract_token(&headers(&["mytoken=abc"])), None);
    }

    #[test]
    fn context_uses_request_id_header() {
        let mut map = headers(&["token=abc123"]);
        map.insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-1"));

        let ctx = RequestContext::from_headers(&map);
        assert_eq!(ctx, RequestContext::new(Some("abc123".to_string()), "req-1"));
    }

    #[test]
    fn context_generates_trace_id() {
        let ctx = RequestContext::from_headers(&HeaderMap::new());
        assert_eq!(ctx.token, None);
        assert_eq!(ctx.trace_id.len(), 32);
    }
}
