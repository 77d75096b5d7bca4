use std::{convert::Infallible, net::SocketAddr};

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{header::USER_AGENT, request::Parts, HeaderMap},
};
use sha2::{Digest, Sha256};

const DEVICE_ID_HEADER: &str = "x-device-id";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
const REAL_IP_HEADER: &str = "x-real-ip";
const UNKNOWN_IP: &str = "unknown";

/// Client-supplied signals observed on a request, used to bind a refresh-token
/// family to the device and network it was issued to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientContext {
    pub user_agent: String,
    pub device_id: Option<String>,
    pub ip: String,
}

impl ClientContext {
    pub fn new(user_agent: impl Into<String>, device_id: Option<String>, ip: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            device_id,
            ip: ip.into(),
        }
    }

    pub fn from_headers(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        let user_agent = header_str(headers, USER_AGENT.as_str()).unwrap_or_default();
        let device_id = header_str(headers, DEVICE_ID_HEADER)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let ip = header_str(headers, FORWARDED_FOR_HEADER)
            .and_then(|value| value.split(',').next().map(|hop| hop.trim().to_string()))
            .filter(|value| !value.is_empty())
            .or_else(|| {
                header_str(headers, REAL_IP_HEADER)
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
            })
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| UNKNOWN_IP.to_string());

        Self {
            user_agent,
            device_id,
            ip,
        }
    }

    /// Stable digest of the device signals; raw user agents are never stored.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.user_agent.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.device_id.as_deref().unwrap_or("").as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl<S> FromRequestParts<S> for ClientContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Self::from_headers(&parts.headers, peer))
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}
