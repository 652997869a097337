//! `http.get`: bounded GET requests with pinned DNS.
//!
//! The Policy Engine resolved and vetted the target host's addresses
//! before this tool runs; the client here is pinned to those exact
//! addresses and never re-resolves, so a DNS answer that changes between
//! evaluation and connect cannot reroute the request. TLS still sees the
//! original hostname (the pin only overrides address lookup), and the
//! `Host` header comes from the URL as usual.
//!
//! Redirects are disabled at the client and followed manually: a hop to a
//! different host is re-evaluated against the policy (with fresh pinning)
//! and an https→http downgrade is refused outright. Same-host hops keep
//! the existing pin.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::blocking::Client;
use reqwest::redirect::Policy as RedirectPolicy;
use serde_json::{json, Map, Value};
use tracing::debug;
use url::Url;

use capsule_policy::{evaluate_http, SystemResolver};

use crate::{optional_string_map, require_string, Tool, ToolContext, ToolOutput};

const MAX_REDIRECTS: usize = 5;
const USER_AGENT: &str = concat!("capsule/", env!("CARGO_PKG_VERSION"));

/// Fetch a URL with GET.
pub struct HttpGetTool;

impl Tool for HttpGetTool {
    fn name(&self) -> &'static str {
        "http.get"
    }

    fn description(&self) -> &'static str {
        "Make an HTTP GET request to fetch data from a URL"
    }

    fn schema(&self) -> Value {
        json!({
            "url": { "type": "string", "required": true },
            "headers": { "type": "object", "required": false },
        })
    }

    fn execute(&self, args: &Map<String, Value>, ctx: &ToolContext) -> ToolOutput {
        let url_str = match require_string(args, "url") {
            Ok(s) => s,
            Err(e) => return ToolOutput::fail(format!("invalid arguments: {}", e)),
        };
        let headers = match optional_string_map(args, "headers") {
            Ok(h) => h,
            Err(e) => return ToolOutput::fail(format!("invalid arguments: {}", e)),
        };

        let mut url = match Url::parse(url_str) {
            Ok(u) => u,
            Err(e) => return ToolOutput::fail(format!("invalid URL '{}': {}", url_str, e)),
        };
        if url.scheme() != "http" && url.scheme() != "https" {
            return ToolOutput::fail(format!("unsupported URL scheme: {}", url.scheme()));
        }

        let http_policy = ctx.policy.tools.http_get.clone().unwrap_or_default();
        let timeout = Duration::from_secs(u64::from(http_policy.timeout_seconds));
        let max_bytes = http_policy.max_response_bytes;
        let mut pinned = ctx.pinned_addrs.clone();

        for _hop in 0..=MAX_REDIRECTS {
            let client = match build_client(&url, &pinned, timeout) {
                Ok(c) => c,
                Err(e) => return ToolOutput::fail(e),
            };

            let mut request = client.get(url.clone());
            for (name, value) in &headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let response = match request.send() {
                Ok(r) => r,
                Err(e) if e.is_timeout() => {
                    return ToolOutput::fail(format!(
                        "request timed out after {} seconds",
                        http_policy.timeout_seconds
                    ));
                }
                Err(e) => return ToolOutput::fail(format!("request failed: {}", e)),
            };

            let status = response.status();
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());
                let Some(location) = location else {
                    return ToolOutput::fail(format!(
                        "redirect ({}) without a Location header",
                        status.as_u16()
                    ));
                };
                let next = match next_redirect(&url, &location) {
                    Ok(n) => n,
                    Err(e) => return ToolOutput::fail(e),
                };

                // A host change leaves the area policy vetted; re-evaluate
                // and re-pin before following. Same-host hops keep the pin.
                if next.host_str() != url.host_str() {
                    let decision = evaluate_http(&http_policy, &next, &SystemResolver);
                    if !decision.allowed {
                        return ToolOutput::fail(format!(
                            "redirect to {} denied by policy: {}",
                            next, decision.reason
                        ));
                    }
                    pinned = decision.pinned_addrs;
                }
                debug!(from = %url, to = %next, "following redirect");
                url = next;
                continue;
            }

            return finish_response(response, &url, max_bytes);
        }

        ToolOutput::fail(format!("too many redirects (limit {})", MAX_REDIRECTS))
    }
}

/// Compute and vet a redirect target.
fn next_redirect(current: &Url, location: &str) -> Result<Url, String> {
    let next = current
        .join(location)
        .map_err(|e| format!("invalid redirect target '{}': {}", location, e))?;
    if next.scheme() != "http" && next.scheme() != "https" {
        return Err(format!("redirect to unsupported scheme: {}", next.scheme()));
    }
    if current.scheme() == "https" && next.scheme() == "http" {
        return Err(format!("redirect downgrades https to http: {}", next));
    }
    Ok(next)
}

fn build_client(url: &Url, pinned: &[IpAddr], timeout: Duration) -> Result<Client, String> {
    let mut builder = Client::builder()
        .timeout(timeout)
        .redirect(RedirectPolicy::none())
        .user_agent(USER_AGENT);

    if !pinned.is_empty() {
        if let Some(host) = url.host_str() {
            // Literal-IP URLs need no pin; for domains, override lookup
            // with the addresses policy resolved.
            if host.parse::<IpAddr>().is_err() {
                let port = url.port_or_known_default().unwrap_or(443);
                let addrs: Vec<SocketAddr> =
                    pinned.iter().map(|ip| SocketAddr::new(*ip, port)).collect();
                builder = builder.resolve_to_addrs(host, &addrs);
            }
        }
    }

    builder.build().map_err(|e| format!("failed to build HTTP client: {}", e))
}

fn finish_response(
    mut response: reqwest::blocking::Response,
    url: &Url,
    max_bytes: u64,
) -> ToolOutput {
    let status = response.status().as_u16();

    // Trust Content-Length enough to refuse early; the streaming read
    // below is the actual enforcement.
    if let Some(length) = response.content_length() {
        if max_bytes > 0 && length > max_bytes {
            return ToolOutput::fail(format!(
                "response too large: {} bytes (max: {})",
                length, max_bytes
            ));
        }
    }

    let mut header_map = Map::new();
    for (name, value) in response.headers() {
        header_map.insert(
            name.as_str().to_string(),
            Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        );
    }

    let mut body = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match response.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                body.extend_from_slice(&chunk[..n]);
                if max_bytes > 0 && body.len() as u64 > max_bytes {
                    return ToolOutput::fail(format!(
                        "response exceeded size limit: {} bytes read (max: {})",
                        body.len(),
                        max_bytes
                    ));
                }
            }
            Err(e) => return ToolOutput::fail(format!("error reading response body: {}", e)),
        }
    }

    let bytes_read = body.len();
    debug!(url = %url, status, bytes_read, "http.get finished");

    let body_text = match String::from_utf8(body) {
        Ok(text) => text,
        Err(e) => STANDARD.encode(e.as_bytes()),
    };

    ToolOutput::ok(json!({
        "status": status,
        "headers": Value::Object(header_map),
        "body": body_text,
        "bytes_read": bytes_read,
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
