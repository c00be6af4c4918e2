//! Deriving the admission key from a request.

use axum::extract::ConnectInfo;
use axum::http::request::Parts;
use std::net::SocketAddr;
use std::sync::Arc;

/// Maps request parts to a limiter key.
pub type KeyFn = Arc<dyn Fn(&Parts) -> String + Send + Sync>;

/// Key used when no caller address is known.
pub const UNKNOWN_KEY: &str = "unknown";

/// Caller IP from `ConnectInfo<SocketAddr>`, or [`UNKNOWN_KEY`].
///
/// The server must be started with `into_make_service_with_connect_info::<SocketAddr>()`
/// for the address to be present.
pub fn remote_addr_key(parts: &Parts) -> String {
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_KEY.to_string())
}

/// Key from a request header (e.g. an API key), falling back to the caller address.
///
/// Only use client-supplied headers when a trusted proxy sets or validates them.
pub fn header_key(name: &'static str) -> KeyFn {
    Arc::new(move |parts: &Parts| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| remote_addr_key(parts))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(req: Request<()>) -> Parts {
        req.into_parts().0
    }

    #[test]
    fn remote_addr_uses_connect_info() {
        let mut req = Request::new(());
        req.extensions_mut().insert(ConnectInfo(SocketAddr::from(([10, 1, 2, 3], 4567))));
        assert_eq!(remote_addr_key(&parts(req)), "10.1.2.3");
    }

    #[test]
    fn remote_addr_falls_back_to_unknown() {
        assert_eq!(remote_addr_key(&parts(Request::new(()))), UNKNOWN_KEY);
    }

    #[test]
    fn header_key_prefers_header() {
        let key = header_key("x-api-key");
        let req = Request::builder().header("x-api-key", " tenant-7 ").body(()).unwrap();
        assert_eq!(key(&parts(req)), "tenant-7");

        let empty = Request::builder().header("x-api-key", "").body(()).unwrap();
        assert_eq!(key(&parts(empty)), UNKNOWN_KEY);
    }
}
