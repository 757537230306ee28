//! Data-plane request handler
//!
//! One axum fallback route receives every inbound request, demultiplexes it
//! to a proxy by host (and path key), runs target selection, and answers with
//! a `301` (cross-host) or `307` (same-host rewrite). Nothing on this path
//! touches storage; the only shared state is the supervisor's live map and
//! the in-memory counters.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode, Version},
    response::{IntoResponse, Response},
    Router,
};
use cookie::{time::Duration as CookieDuration, Cookie, SameSite};
use url::Url;

use super::expr::RequestEnv;
use super::redirect::{append_redirect_params, RedirectInfo, RUID_COOKIE};
use super::select::select_target;
use super::Proxy;
use crate::supervisor::Supervisor;

/// Marks a request that was already rewritten once
const INTERNAL_REDIRECT_HEADER: &str = "x-internal-redirect";

/// Hop counter propagated by cooperating relays; caps redirect chains
const REDIRECT_HOPS_HEADER: &str = "x-redirect-hops";

const MAX_REDIRECT_HOPS: u32 = 5;

const STICKY_COOKIE_MAX_AGE_DAYS: i64 = 30;
const RUID_COOKIE_MAX_AGE_DAYS: i64 = 365;

/// Build the ingress router
pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new().fallback(handle).with_state(supervisor)
}

async fn handle(State(supervisor): State<Arc<Supervisor>>, req: Request) -> Response {
    let start = Instant::now();

    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let request_host = host_of(&req).to_string();
    let path = req.uri().path().to_string();

    let Some(proxy) = supervisor.resolve(&request_host, &path) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let raw_query = req.uri().query().unwrap_or("").to_string();
    let env = build_env(&req, &request_host, remote);
    let info = RedirectInfo::new(&proxy.id, &raw_query, &env);

    let target = match select_target(&proxy, &env, false) {
        Ok(target) => target.clone(),
        Err(e) => {
            tracing::warn!(proxy_id = %proxy.id, "target selection failed: {}", e);
            proxy.stats().record_error(None, &info.ruid);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    // A request we already rewrote once stops here
    if header_str(req.headers(), INTERNAL_REDIRECT_HEADER) == Some("true") {
        return StatusCode::OK.into_response();
    }

    let hops = header_str(req.headers(), REDIRECT_HOPS_HEADER)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);
    if hops >= MAX_REDIRECT_HOPS {
        tracing::warn!(proxy_id = %proxy.id, hops, "redirect hop limit reached");
        proxy.stats().record_error(None, &info.ruid);
        return StatusCode::LOOP_DETECTED.into_response();
    }

    let mut response_headers = HeaderMap::new();
    write_cookies(&mut response_headers, &proxy, &target.id, &info);

    let user_id = header_str(req.headers(), "x-user-id")
        .filter(|v| !v.is_empty())
        .unwrap_or(&info.ruid)
        .to_string();
    proxy.stats().record_request(&target.id, &user_id);

    let mut parsed = match parse_target_url(&target.url) {
        Ok(url) => url,
        Err(e) => {
            tracing::error!(proxy_id = %proxy.id, target_id = %target.id, "invalid target URL: {}", e);
            proxy.stats().record_error(Some(&target.id), &user_id);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    append_redirect_params(&mut parsed, &info, proxy.forward_query, proxy.forward_cookies);

    if let Ok(value) = HeaderValue::try_from((hops + 1).to_string()) {
        response_headers.insert(REDIRECT_HOPS_HEADER, value);
    }

    let response = if host_with_port(&parsed) != request_host {
        redirect(StatusCode::MOVED_PERMANENTLY, parsed.as_str(), response_headers)
    } else {
        // Same host: rewrite path and query in place
        let location = match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        };
        response_headers.insert(INTERNAL_REDIRECT_HEADER, HeaderValue::from_static("true"));
        redirect(StatusCode::TEMPORARY_REDIRECT, &location, response_headers)
    };

    proxy.stats().observe_latency(&target.id, start.elapsed());
    response
}

fn redirect(status: StatusCode, location: &str, mut headers: HeaderMap) -> Response {
    match HeaderValue::try_from(location) {
        Ok(value) => {
            headers.insert(header::LOCATION, value);
            (status, headers).into_response()
        }
        Err(e) => {
            tracing::error!("unencodable redirect location: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn write_cookies(headers: &mut HeaderMap, proxy: &Proxy, target_id: &str, info: &RedirectInfo) {
    if proxy.save_cookies {
        let sticky = Cookie::build((proxy.cookie_name().to_string(), target_id.to_string()))
            .path("/")
            .same_site(SameSite::Lax)
            .max_age(CookieDuration::days(STICKY_COOKIE_MAX_AGE_DAYS))
            .build();
        append_set_cookie(headers, &sticky);
    }

    if info.ruid_minted {
        let ruid = Cookie::build((RUID_COOKIE, info.ruid.clone()))
            .path("/")
            .same_site(SameSite::Lax)
            .max_age(CookieDuration::days(RUID_COOKIE_MAX_AGE_DAYS))
            .build();
        append_set_cookie(headers, &ruid);
    }
}

fn append_set_cookie(headers: &mut HeaderMap, cookie: &Cookie<'_>) {
    if let Ok(value) = HeaderValue::try_from(cookie.to_string()) {
        headers.append(header::SET_COOKIE, value);
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn host_of(req: &Request) -> &str {
    if let Some(host) = header_str(req.headers(), "host").filter(|h| !h.is_empty()) {
        return host;
    }
    req.uri().authority().map(|a| a.as_str()).unwrap_or("")
}

/// Assemble the expression/selection environment from the request
fn build_env(req: &Request, host: &str, remote: Option<SocketAddr>) -> RequestEnv {
    let headers = req.headers();

    let mut header_map: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            header_map
                .entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }

    let raw_query = req.uri().query().unwrap_or("");
    let mut query: HashMap<String, String> = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(raw_query.as_bytes()) {
        query
            .entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }

    let mut cookies: HashMap<String, String> = HashMap::new();
    for value in headers.get_all(header::COOKIE) {
        let Ok(value) = value.to_str() else { continue };
        for cookie in Cookie::split_parse(value.to_string()).flatten() {
            cookies.insert(cookie.name().to_string(), cookie.value().to_string());
        }
    }

    let path = req.uri().path().to_string();
    let url = match req.uri().query() {
        Some(query) => format!("{path}?{query}"),
        None => path.clone(),
    };

    let referer = header_map.get("referer").cloned().unwrap_or_default();
    let ip = client_ip(headers, remote);

    RequestEnv {
        headers: header_map,
        query,
        cookies,
        method: req.method().as_str().to_string(),
        path,
        host: host.to_string(),
        ip,
        referer,
        protocol: protocol_name(req.version()).to_string(),
        url,
    }
}

fn protocol_name(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

/// Client IP: first `X-Forwarded-For` entry, then `X-Real-IP`, then the
/// peer address with the port stripped
pub fn client_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = header_str(headers, "x-real-ip") {
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    remote.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

/// Parse a target URL, defaulting the scheme to https
fn parse_target_url(raw: &str) -> Result<Url, url::ParseError> {
    if raw.contains("://") {
        Url::parse(raw)
    } else {
        Url::parse(&format!("https://{raw}"))
    }
}

fn host_with_port(url: &Url) -> String {
    let host = url.host_str().unwrap_or("");
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_precedence() {
        let remote: SocketAddr = "198.51.100.9:41000".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("192.0.2.5"));
        assert_eq!(client_ip(&headers, Some(remote)), "203.0.113.7");

        headers.remove("x-forwarded-for");
        assert_eq!(client_ip(&headers, Some(remote)), "192.0.2.5");

        headers.remove("x-real-ip");
        assert_eq!(client_ip(&headers, Some(remote)), "198.51.100.9");

        assert_eq!(client_ip(&HeaderMap::new(), None), "");
    }

    #[test]
    fn target_urls_default_to_https() {
        let url = parse_target_url("dest.example.com/landing").unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.host_str(), Some("dest.example.com"));

        let kept = parse_target_url("http://dest.example.com/").unwrap();
        assert_eq!(kept.scheme(), "http");
    }

    #[test]
    fn host_with_port_skips_default_ports() {
        let https = parse_target_url("https://dest.example.com:443/x").unwrap();
        assert_eq!(host_with_port(&https), "dest.example.com");

        let custom = parse_target_url("https://dest.example.com:8443/x").unwrap();
        assert_eq!(host_with_port(&custom), "dest.example.com:8443");
    }
}
