//! HTTP surface: native and OpenAI-compatible data planes, the worker
//! control plane, and the health probe.

pub mod health;
pub mod native;
pub mod openai;
pub mod workers;

use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::{header, HeaderMap};

use fleet_common::{ProtocolFlavor, SubmissionMeta};

/// Collect submission metadata from the connection and headers.
pub(crate) fn submission_meta(
    protocol: ProtocolFlavor,
    addr: Option<&ConnectInfo<SocketAddr>>,
    headers: &HeaderMap,
) -> SubmissionMeta {
    let mut meta = SubmissionMeta::new(protocol);
    meta.client_ip = addr.map(|a| a.0.ip().to_string());
    meta.user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    meta
}
