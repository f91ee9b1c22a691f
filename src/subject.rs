//! Subject and timeout resolution for an endpoint.

use crate::descriptor::{EndpointDescriptor, ServiceDescriptor, to_snake_case};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// An exposed endpoint and the subject it listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub name: String,
    pub subject: String,
}

/// Name and subject of every non-skipped endpoint, in declaration order.
pub fn endpoint_infos(service: &ServiceDescriptor, prefix: Option<&str>) -> Vec<EndpointInfo> {
    service
        .active_endpoints()
        .map(|ep| EndpointInfo {
            name: ep.name.clone(),
            subject: resolve(service, ep, prefix, None).subject,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub subject: String,
    pub timeout: Option<Duration>,
}

/// `{prefix}.{snake_case(method)}`
#[inline]
pub fn subject_for(prefix: &str, method: &str) -> String {
    format!("{}.{}", prefix, to_snake_case(method))
}

/// First present value wins: runtime override, endpoint, service. A zero duration counts as
/// absent. None means unbounded.
#[inline]
pub fn effective_timeout(
    runtime: Option<Duration>, endpoint: Option<Duration>, service: Option<Duration>,
) -> Option<Duration> {
    let set = |d: Option<Duration>| d.filter(|d| !d.is_zero());
    set(runtime).or(set(endpoint)).or(set(service))
}

pub fn resolve(
    service: &ServiceDescriptor, endpoint: &EndpointDescriptor, prefix: Option<&str>,
    timeout: Option<Duration>,
) -> Resolved {
    let prefix = match prefix {
        Some(p) if !p.is_empty() => p,
        _ => service.subject_prefix.as_str(),
    };
    Resolved {
        subject: subject_for(prefix, &endpoint.name),
        timeout: effective_timeout(timeout, endpoint.timeout, service.timeout),
    }
}
