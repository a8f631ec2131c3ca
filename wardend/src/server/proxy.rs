//! Outbound fetch helpers: registry search and the SSRF-guarded HTTP proxy.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use base64::Engine;
use tracing::info;

use crate::error::{AgentError, AgentResult};
use wardend_protocol::{
    DockerImage, DockerSearchRequest, DockerSearchResponse, ProxyRequest, ProxyResponse,
};

/// Cap on proxied response bodies.
const MAX_PROXY_RESPONSE: usize = 10 * 1024 * 1024;

/// Reject loopback, private, link-local, unspecified, and the cloud
/// metadata address.
fn check_blocked_ip(ip: IpAddr) -> AgentResult<()> {
    let blocked = match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4 == std::net::Ipv4Addr::new(169, 254, 169, 254)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    };
    if blocked {
        return Err(AgentError::PermissionDenied(format!(
            "proxying to internal address {} is not allowed",
            ip
        )));
    }
    Ok(())
}

/// Validate the URL scheme and resolve the host, rejecting any address in
/// the blocked set.
async fn check_blocked_url(raw_url: &str) -> AgentResult<url::Url> {
    let parsed = url::Url::parse(raw_url)
        .map_err(|e| AgentError::InvalidArgument(format!("invalid url: {}", e)))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(AgentError::InvalidArgument(format!(
                "scheme '{}' is not allowed",
                other
            )))
        }
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| AgentError::InvalidArgument("url has no host".into()))?;

    if let Ok(ip) = host.parse::<IpAddr>() {
        check_blocked_ip(ip)?;
        return Ok(parsed);
    }

    // Resolve the name and re-check every address it maps to.
    let port = parsed.port_or_known_default().unwrap_or(443);
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AgentError::InvalidArgument(format!("cannot resolve {}: {}", host, e)))?;
    let mut any = false;
    for addr in addrs {
        any = true;
        check_blocked_ip(addr.ip())?;
    }
    if !any {
        return Err(AgentError::InvalidArgument(format!(
            "{} resolves to no addresses",
            host
        )));
    }
    Ok(parsed)
}

/// SSRF-guarded fetch on behalf of a client. Redirects are disabled so a
/// 30x cannot route the request back inside.
pub async fn proxy_http_request(req: &ProxyRequest) -> AgentResult<ProxyResponse> {
    if req.url.is_empty() {
        return Err(AgentError::InvalidArgument("url must not be empty".into()));
    }
    let parsed = check_blocked_url(&req.url).await?;

    let method: reqwest::Method = {
        let name = if req.method.is_empty() { "GET" } else { &req.method };
        name.parse()
            .map_err(|_| AgentError::InvalidArgument(format!("invalid method: {}", name)))?
    };
    let timeout = if req.timeout_secs == 0 {
        Duration::from_secs(30)
    } else {
        Duration::from_secs(req.timeout_secs.min(300))
    };

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| AgentError::Internal(format!("building http client: {}", e)))?;

    info!(url = %parsed, method = %method, "proxying http request");

    let mut builder = client.request(method, parsed);
    for (name, value) in &req.headers {
        builder = builder.header(name, value);
    }
    if !req.body.is_empty() {
        let body = base64::engine::general_purpose::STANDARD
            .decode(&req.body)
            .map_err(|e| AgentError::InvalidArgument(format!("invalid base64 body: {}", e)))?;
        builder = builder.body(body);
    }

    let response = builder
        .send()
        .await
        .map_err(|e| AgentError::Internal(format!("proxy request failed: {}", e)))?;

    let status = response.status();
    let mut headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(text) = value.to_str() {
            headers.insert(name.to_string(), text.to_string());
        }
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| AgentError::Internal(format!("reading proxy response: {}", e)))?;
    let truncated = &body[..body.len().min(MAX_PROXY_RESPONSE)];

    Ok(ProxyResponse {
        status_code: status.as_u16(),
        status_text: status
            .canonical_reason()
            .unwrap_or("")
            .to_string(),
        headers,
        body: base64::engine::general_purpose::STANDARD.encode(truncated),
    })
}

/// Forward a search to the public container registry.
pub async fn search_docker_hub(req: &DockerSearchRequest) -> AgentResult<DockerSearchResponse> {
    if req.query.is_empty() {
        return Err(AgentError::InvalidArgument("query must not be empty".into()));
    }
    let page = req.page.max(1);
    let page_size = match req.page_size {
        0 => 25,
        n => n.min(100),
    };

    #[derive(serde::Deserialize)]
    struct HubResults {
        count: u64,
        #[serde(default)]
        results: Vec<HubImage>,
    }
    #[derive(serde::Deserialize)]
    struct HubImage {
        repo_name: String,
        #[serde(default)]
        short_description: String,
        #[serde(default)]
        star_count: i64,
        #[serde(default)]
        pull_count: i64,
        #[serde(default)]
        is_official: bool,
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| AgentError::Internal(format!("building http client: {}", e)))?;

    let response = client
        .get("https://hub.docker.com/v2/search/repositories/")
        .query(&[
            ("query", req.query.as_str()),
            ("page", &page.to_string()),
            ("page_size", &page_size.to_string()),
        ])
        .send()
        .await
        .map_err(|e| AgentError::Internal(format!("registry search failed: {}", e)))?;
    if !response.status().is_success() {
        return Err(AgentError::Internal(format!(
            "registry returned {}",
            response.status()
        )));
    }
    let results: HubResults = response
        .json()
        .await
        .map_err(|e| AgentError::Internal(format!("decoding registry response: {}", e)))?;

    Ok(DockerSearchResponse {
        total_count: results.count,
        images: results
            .results
            .into_iter()
            .map(|r| DockerImage {
                name: r.repo_name,
                description: r.short_description,
                star_count: r.star_count,
                pull_count: r.pull_count,
                is_official: r.is_official,
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_and_private_targets_are_blocked() {
        for target in [
            "http://127.0.0.1/admin",
            "http://localhost:8080/",
            "http://10.0.0.5/",
            "http://192.168.1.1/router",
            "http://169.254.169.254/latest/meta-data/",
            "http://[::1]/",
            "http://0.0.0.0/",
        ] {
            let err = check_blocked_url(target).await;
            assert!(err.is_err(), "{} must be blocked", target);
        }
    }

    #[tokio::test]
    async fn public_ip_literal_is_allowed() {
        let ok = check_blocked_url("https://203.0.113.10/path").await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn non_http_schemes_are_rejected() {
        assert!(check_blocked_url("ftp://example.com/file").await.is_err());
        assert!(check_blocked_url("file:///etc/passwd").await.is_err());
        assert!(check_blocked_url("gopher://example.com/").await.is_err());
    }

    #[tokio::test]
    async fn garbage_urls_are_invalid() {
        assert!(check_blocked_url("not a url").await.is_err());
        let err = proxy_http_request(&ProxyRequest {
            url: String::new(),
            method: String::new(),
            headers: HashMap::new(),
            body: String::new(),
            timeout_secs: 0,
        })
        .await;
        assert!(err.is_err());
    }

    #[test]
    fn blocked_ip_matrix() {
        assert!(check_blocked_ip("127.0.0.1".parse().unwrap()).is_err());
        assert!(check_blocked_ip("10.1.2.3".parse().unwrap()).is_err());
        assert!(check_blocked_ip("172.16.0.1".parse().unwrap()).is_err());
        assert!(check_blocked_ip("169.254.169.254".parse().unwrap()).is_err());
        assert!(check_blocked_ip("0.0.0.0".parse().unwrap()).is_err());
        assert!(check_blocked_ip("::1".parse().unwrap()).is_err());
        assert!(check_blocked_ip("fe80::1".parse().unwrap()).is_err());
        assert!(check_blocked_ip("fd12::1".parse().unwrap()).is_err());
        assert!(check_blocked_ip("8.8.8.8".parse().unwrap()).is_ok());
        assert!(check_blocked_ip("2001:db8::1".parse().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn empty_docker_query_is_rejected() {
        let err = search_docker_hub(&DockerSearchRequest {
            query: String::new(),
            page: 0,
            page_size: 0,
        })
        .await;
        assert!(err.is_err());
    }
}
