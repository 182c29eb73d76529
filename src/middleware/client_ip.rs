//! Client address resolution
//!
//! The resolved address is attached to the request as a [`ClientIp`] extension.
//! Forwarding headers win over the socket peer so requests behind a proxy are
//! attributed to the real client. Any client can send those headers, so the
//! peer is kept alongside and shown whenever the two differ.

use axum::{
    extract::{ConnectInfo, Request},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Address of the client that sent the request, if it could be resolved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientIp {
    /// Forwarded address, or the peer when nothing was forwarded
    pub ip: Option<IpAddr>,
    /// Socket peer that actually connected
    pub peer: Option<IpAddr>,
}

impl fmt::Display for ClientIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.ip, self.peer) {
            (Some(ip), Some(peer)) if ip != peer => write!(f, "{} via {}", ip, peer),
            (Some(ip), _) => write!(f, "{}", ip),
            (None, Some(peer)) => write!(f, "{}", peer),
            (None, None) => write!(f, "unknown"),
        }
    }
}

fn header_ip(headers: &HeaderMap, name: &str) -> Option<IpAddr> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
}

/// `X-Forwarded-For` (first hop), then `X-Real-IP`, then the socket peer
fn resolve_client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> ClientIp {
    let peer = peer.map(|addr| addr.ip());
    let ip = header_ip(headers, X_FORWARDED_FOR)
        .or_else(|| header_ip(headers, X_REAL_IP))
        .or(peer);
    ClientIp { ip, peer }
}

pub async fn resolve_client(mut request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_ip = resolve_client_ip(request.headers(), peer);
    request.extensions_mut().insert(client_ip);
    next.run(request).await
}
