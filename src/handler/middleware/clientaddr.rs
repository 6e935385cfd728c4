use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{request::Parts, HeaderMap, StatusCode},
};
use std::{
    fmt::{self, Formatter},
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

const FORWARDED_HEADERS: [&str; 4] = [
    "x-client-ip",
    "x-forwarded-for",
    "x-real-ip",
    "cf-connecting-ip",
];

/// Peer address of a request, preferring proxy-supplied headers.
pub struct ClientAddr {
    pub addr: SocketAddr,
}

impl ClientAddr {
    pub fn new(addr: SocketAddr) -> Self {
        ClientAddr { addr }
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn from_http_parts(headers: &HeaderMap, connect_info: Option<SocketAddr>) -> Self {
        let mut addr = connect_info
            .unwrap_or_else(|| SocketAddr::from((IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)));
        for header in FORWARDED_HEADERS {
            let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) else {
                continue;
            };
            // X-Forwarded-For may carry a chain; the first hop is the client
            let first = value.split(',').next().unwrap_or(value).trim();
            if let Ok(ip) = first.parse::<IpAddr>() {
                addr.set_ip(ip);
                break;
            }
        }
        ClientAddr { addr }
    }
}

impl<S> FromRequestParts<S> for ClientAddr
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let connect_info = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Self::from_http_parts(&parts.headers, connect_info))
    }
}

impl fmt::Display for ClientAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_forwarded_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        let peer: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let addr = ClientAddr::from_http_parts(&headers, Some(peer));
        assert_eq!(addr.ip().to_string(), "203.0.113.7");
        assert_eq!(addr.addr.port(), 4000);
    }

    #[test]
    fn test_garbage_header_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("not-an-ip"));
        let peer: SocketAddr = "192.0.2.1:5000".parse().unwrap();
        let addr = ClientAddr::from_http_parts(&headers, Some(peer));
        assert_eq!(addr.addr, peer);
    }
}
