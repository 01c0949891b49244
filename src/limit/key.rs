//! Client identity resolution for the HTTP middleware.
//!
//! A request is attributed to the first non-empty identity in this order:
//! an `Authorization` credential, an `X-API-Key` header (both rendered as
//! `api_key:...`), the first entry of `X-Forwarded-For`, `X-Real-IP`, and
//! finally the peer address with the port stripped (all rendered as
//! `ip:...`). Server glue that knows the socket address should stash a
//! [`PeerAddr`] in the request extensions before the middleware runs.

use std::net::SocketAddr;

use http::Request;

/// Remote peer address, inserted into request extensions by the server
/// accept loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// Resolve the identity a request's budget is charged against.
///
/// Never empty: a request with no credential, no proxy headers, and no
/// [`PeerAddr`] extension falls back to `ip:unknown` (and therefore shares
/// one budget, which is the safe direction for unattributable traffic).
pub fn client_key<B>(req: &Request<B>) -> String {
    if let Some(credential) = header_value(req, "authorization") {
        return format!("api_key:{}", credential);
    }
    if let Some(api_key) = header_value(req, "x-api-key") {
        return format!("api_key:{}", api_key);
    }
    if let Some(forwarded) = header_value(req, "x-forwarded-for") {
        // Only the first hop names the client; later entries are proxies.
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return format!("ip:{}", first);
            }
        }
    }
    if let Some(real_ip) = header_value(req, "x-real-ip") {
        return format!("ip:{}", real_ip);
    }
    match req.extensions().get::<PeerAddr>() {
        Some(peer) => format!("ip:{}", peer.0.ip()),
        None => "ip:unknown".to_string(),
    }
}

fn header_value<'a, B>(req: &'a Request<B>, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> http::request::Builder {
        Request::builder().uri("/widgets")
    }

    #[test]
    fn authorization_wins_over_everything() {
        let req = request()
            .header("authorization", "Bearer abc123")
            .header("x-api-key", "key-9")
            .header("x-forwarded-for", "203.0.113.7")
            .body(())
            .unwrap();
        assert_eq!(client_key(&req), "api_key:Bearer abc123");
    }

    #[test]
    fn api_key_header_is_second() {
        let req = request().header("x-api-key", "key-9").body(()).unwrap();
        assert_eq!(client_key(&req), "api_key:key-9");
    }

    #[test]
    fn forwarded_for_takes_the_first_hop() {
        let req = request()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1, 10.0.0.2")
            .body(())
            .unwrap();
        assert_eq!(client_key(&req), "ip:203.0.113.7");
    }

    #[test]
    fn real_ip_is_fourth() {
        let req = request().header("x-real-ip", "198.51.100.4").body(()).unwrap();
        assert_eq!(client_key(&req), "ip:198.51.100.4");
    }

    #[test]
    fn peer_addr_extension_strips_the_port() {
        let mut req = request().body(()).unwrap();
        req.extensions_mut().insert(PeerAddr("198.51.100.4:61234".parse().unwrap()));
        assert_eq!(client_key(&req), "ip:198.51.100.4");
    }

    #[test]
    fn empty_headers_are_skipped() {
        let mut req = request()
            .header("authorization", "")
            .header("x-forwarded-for", "  ")
            .body(())
            .unwrap();
        req.extensions_mut().insert(PeerAddr("192.0.2.1:80".parse().unwrap()));
        assert_eq!(client_key(&req), "ip:192.0.2.1");
    }

    #[test]
    fn unattributable_requests_share_one_key() {
        let req = request().body(()).unwrap();
        assert_eq!(client_key(&req), "ip:unknown");
    }
}
