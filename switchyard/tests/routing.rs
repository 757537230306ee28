//! End-to-end data-plane scenarios driven through the ingress router

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, Request, StatusCode},
    Router,
};
use tower::ServiceExt;

use switchyard::{
    error::{Error, Result},
    models::{ConditionType, RouteCondition},
    proxy::{handler, ListenUrl, ProxyConfig, Target},
    pubsub::ChangeNotifier,
    supervisor::{ConfigSource, Supervisor},
};

struct EmptySource;

#[async_trait]
impl ConfigSource for EmptySource {
    async fn proxy_config(&self, proxy_id: &str) -> Result<ProxyConfig> {
        Err(Error::NotFound(format!("proxy {proxy_id}")))
    }

    async fn proxy_configs(&self) -> Result<Vec<ProxyConfig>> {
        Ok(Vec::new())
    }
}

struct NullNotifier;

#[async_trait]
impl ChangeNotifier for NullNotifier {
    async fn publish_settings_change(&self, _proxy_id: &str) -> Result<()> {
        Ok(())
    }
}

fn gateway(configs: Vec<ProxyConfig>) -> (Arc<Supervisor>, Router) {
    let supervisor = Arc::new(Supervisor::new(Arc::new(EmptySource), Arc::new(NullNotifier)));
    for config in configs {
        supervisor.create_proxy(config).expect("valid test config");
    }
    let router = handler::router(supervisor.clone());
    (supervisor, router)
}

fn target(id: &str, url: &str, weight: f64, active: bool) -> Target {
    Target {
        id: id.to_string(),
        url: url.to_string(),
        weight,
        is_active: active,
    }
}

fn base_config(id: &str, targets: Vec<Target>) -> ProxyConfig {
    ProxyConfig {
        id: id.to_string(),
        name: format!("test {id}"),
        mode: switchyard::models::ProxyMode::Redirect,
        listen_urls: vec![ListenUrl {
            id: format!("{id}-lu"),
            listen_url: "ab.example.com".to_string(),
            path_key: None,
        }],
        targets,
        condition: None,
        tags: Vec::new(),
        save_cookies: false,
        forward_query: false,
        forward_cookies: false,
    }
}

struct TestRequest {
    path: String,
    headers: Vec<(String, String)>,
    client: SocketAddr,
}

impl TestRequest {
    fn new() -> Self {
        Self {
            path: "/".to_string(),
            headers: Vec::new(),
            client: "203.0.113.7:40000".parse().unwrap(),
        }
    }

    fn path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn client_ip(mut self, ip: &str) -> Self {
        self.client = format!("{ip}:40000").parse().unwrap();
        self
    }

    fn build(self, host: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .uri(format!("http://{host}{}", self.path))
            .header(header::HOST, host);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let mut request = builder.body(Body::empty()).unwrap();
        request.extensions_mut().insert(ConnectInfo(self.client));
        request
    }
}

async fn send(router: &Router, request: Request<Body>) -> axum::response::Response {
    router.clone().oneshot(request).await.unwrap()
}

fn location(response: &axum::response::Response) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn set_cookies(response: &axum::response::Response) -> Vec<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn unknown_host_is_404() {
    let (_, router) = gateway(vec![base_config(
        "p1",
        vec![target("a", "https://a.example.com/", 1.0, true)],
    )]);

    let response = send(&router, TestRequest::new().build("stranger.example.com")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn weighted_split_is_balanced_across_clients() {
    let (_, router) = gateway(vec![base_config(
        "p1",
        vec![
            target("a", "https://a.example.com/", 0.5, true),
            target("b", "https://b.example.com/", 0.5, true),
        ],
    )]);

    const N: u32 = 10_000;
    let mut a = 0u32;
    let mut b = 0u32;
    for i in 0..N {
        let request = TestRequest::new()
            .header("x-forwarded-for", &format!("10.{}.{}.{}", i >> 16, (i >> 8) & 255, i & 255))
            .build("ab.example.com");
        let response = send(&router, request).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);

        let location = location(&response);
        if location.starts_with("https://a.example.com/") {
            a += 1;
        } else if location.starts_with("https://b.example.com/") {
            b += 1;
        } else {
            panic!("unexpected location {location}");
        }
    }

    let skew = (a as f64 - b as f64).abs() / N as f64;
    assert!(skew < 0.03, "split skew {skew} ({a}/{b})");
}

#[tokio::test]
async fn header_condition_matches_and_falls_back_to_default() {
    let mut config = base_config(
        "p1",
        vec![
            target("t1", "https://a.example.com/", 0.5, true),
            target("t2", "https://b.example.com/", 0.5, true),
        ],
    );
    config.condition = Some(RouteCondition {
        condition_type: ConditionType::Header,
        param_name: "X-Variant".to_string(),
        values: BTreeMap::from([
            ("t1".to_string(), "a".to_string()),
            ("t2".to_string(), "b".to_string()),
        ]),
        default: "t1".to_string(),
        expr: None,
    });
    let (_, router) = gateway(vec![config]);

    let matched = send(
        &router,
        TestRequest::new().header("x-variant", "b").build("ab.example.com"),
    )
    .await;
    assert!(location(&matched).starts_with("https://b.example.com/"));

    let unmatched = send(
        &router,
        TestRequest::new().header("x-variant", "c").build("ab.example.com"),
    )
    .await;
    assert!(location(&unmatched).starts_with("https://a.example.com/"));

    let absent = send(&router, TestRequest::new().build("ab.example.com")).await;
    assert!(location(&absent).starts_with("https://a.example.com/"));
}

#[tokio::test]
async fn stickiness_pins_returning_clients() {
    let mut config = base_config(
        "p1",
        vec![
            target("a", "https://a.example.com/", 0.5, true),
            target("b", "https://b.example.com/", 0.5, true),
        ],
    );
    config.save_cookies = true;
    let (_, router) = gateway(vec![config]);

    let first = send(&router, TestRequest::new().build("ab.example.com")).await;
    let cookies = set_cookies(&first);
    let sticky = cookies
        .iter()
        .find(|c| c.starts_with("proxy_p1="))
        .expect("sticky cookie written");
    let pinned_target = sticky
        .trim_start_matches("proxy_p1=")
        .split(';')
        .next()
        .unwrap()
        .to_string();
    let pinned_host = format!("https://{pinned_target}.example.com/");

    for _ in 0..50 {
        let request = TestRequest::new()
            .header("cookie", &format!("proxy_p1={pinned_target}"))
            .build("ab.example.com");
        let response = send(&router, request).await;
        assert!(
            location(&response).starts_with(&pinned_host),
            "sticky client must stay on {pinned_target}"
        );
    }
}

#[tokio::test]
async fn expression_steering_is_identical_across_replicas() {
    let mut config = base_config(
        "p1",
        vec![
            target("ta", "https://a.example.com/", 0.5, true),
            target("tb", "https://b.example.com/", 0.5, true),
        ],
    );
    config.condition = Some(RouteCondition {
        condition_type: ConditionType::Expr,
        param_name: String::new(),
        values: BTreeMap::from([
            ("ta".to_string(), "randomCookie('bucket', 1, 100) <= 70".to_string()),
            ("tb".to_string(), "randomCookie('bucket', 1, 100) > 70".to_string()),
        ]),
        default: "ta".to_string(),
        expr: None,
    });

    let (_, replica_one) = gateway(vec![config.clone()]);
    let (_, replica_two) = gateway(vec![config]);

    let mut seen = HashSet::new();
    for router in [&replica_one, &replica_two] {
        for _ in 0..100 {
            let request = TestRequest::new()
                .header("cookie", "bucket=u123")
                .build("ab.example.com");
            let response = send(router, request).await;
            seen.insert(location(&response).split('?').next().unwrap().to_string());
        }
    }

    assert_eq!(seen.len(), 1, "bucket u123 must always land on one target: {seen:?}");
}

#[tokio::test]
async fn user_agent_platform_condition_routes_mobile() {
    let mut config = base_config(
        "p1",
        vec![
            target("m", "https://m.example.com/", 0.5, true),
            target("d", "https://d.example.com/", 0.5, true),
        ],
    );
    config.condition = Some(RouteCondition {
        condition_type: ConditionType::UserAgent,
        param_name: "platform".to_string(),
        values: BTreeMap::from([
            ("m".to_string(), "mobile".to_string()),
            ("d".to_string(), "desktop".to_string()),
        ]),
        default: "d".to_string(),
        expr: None,
    });
    let (_, router) = gateway(vec![config]);

    let mobile = send(
        &router,
        TestRequest::new()
            .header("user-agent", "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X)")
            .build("ab.example.com"),
    )
    .await;
    assert!(location(&mobile).starts_with("https://m.example.com/"));

    let desktop = send(
        &router,
        TestRequest::new()
            .header("user-agent", "Mozilla/5.0 (Windows NT 10.0; Win64; x64)")
            .build("ab.example.com"),
    )
    .await;
    assert!(location(&desktop).starts_with("https://d.example.com/"));
}

#[tokio::test]
async fn live_reconfiguration_never_drops_or_mixes() {
    let (supervisor, router) = gateway(vec![base_config(
        "p1",
        vec![
            target("old-a", "https://old-a.example.com/", 0.5, true),
            target("old-b", "https://old-b.example.com/", 0.5, true),
        ],
    )]);

    let pre_image = ["https://old-a.example.com/", "https://old-b.example.com/"];
    let post_image = ["https://new-a.example.com/", "https://new-b.example.com/"];

    const N: usize = 400;
    for i in 0..N {
        if i == N / 2 {
            let mut next = base_config(
                "p1",
                vec![
                    target("new-a", "https://new-a.example.com/", 0.5, true),
                    target("new-b", "https://new-b.example.com/", 0.5, true),
                ],
            );
            next.save_cookies = false;
            supervisor.update_proxy(next).await.unwrap();
        }

        let response = send(&router, TestRequest::new().build("ab.example.com")).await;
        assert_eq!(
            response.status(),
            StatusCode::MOVED_PERMANENTLY,
            "request {i} failed during the swap window"
        );

        let location = location(&response);
        let base = location.split('?').next().unwrap();
        let in_pre = pre_image.contains(&base);
        let in_post = post_image.contains(&base);
        assert!(
            in_pre || in_post,
            "request {i} routed outside both images: {location}"
        );
        if i > N / 2 {
            assert!(in_post, "request {i} saw the pre-image after the swap");
        }
    }
}

#[tokio::test]
async fn same_host_target_rewrites_with_307() {
    let (_, router) = gateway(vec![base_config(
        "p1",
        vec![target("t1", "http://ab.example.com/variant-b?x=1", 1.0, true)],
    )]);

    let response = send(&router, TestRequest::new().path("/landing").build("ab.example.com")).await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response
            .headers()
            .get("x-internal-redirect")
            .and_then(|v| v.to_str().ok()),
        Some("true")
    );

    let location = location(&response);
    assert!(location.starts_with("/variant-b?"), "got {location}");
    assert!(location.contains("x=1"));
    assert!(location.contains("rid=rid_p1"));
}

#[tokio::test]
async fn already_rewritten_requests_stop_silently() {
    let (_, router) = gateway(vec![base_config(
        "p1",
        vec![target("t1", "http://ab.example.com/variant-b", 1.0, true)],
    )]);

    let response = send(
        &router,
        TestRequest::new()
            .header("x-internal-redirect", "true")
            .build("ab.example.com"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(location(&response).is_empty());
}

#[tokio::test]
async fn hop_limit_caps_redirect_chains() {
    let (_, router) = gateway(vec![base_config(
        "p1",
        vec![target("t1", "https://a.example.com/", 1.0, true)],
    )]);

    let under = send(
        &router,
        TestRequest::new().header("x-redirect-hops", "4").build("ab.example.com"),
    )
    .await;
    assert_eq!(under.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(
        under.headers().get("x-redirect-hops").and_then(|v| v.to_str().ok()),
        Some("5")
    );

    let over = send(
        &router,
        TestRequest::new().header("x-redirect-hops", "5").build("ab.example.com"),
    )
    .await;
    assert_eq!(over.status(), StatusCode::LOOP_DETECTED);
}

#[tokio::test]
async fn redirect_carries_identifiers_and_mints_ruid() {
    let (_, router) = gateway(vec![base_config(
        "p1",
        vec![target("t1", "https://a.example.com/", 1.0, true)],
    )]);

    let response = send(&router, TestRequest::new().path("/go?x=1").build("ab.example.com")).await;
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);

    let location = location(&response);
    assert!(location.contains("rid=rid_p1"));
    assert!(location.contains("rrid="));
    assert!(location.contains("ruid="));
    // forward_query is off: the original query stays behind
    assert!(!location.contains("x=1"));

    let cookies = set_cookies(&response);
    assert!(
        cookies.iter().any(|c| c.starts_with("ruid=")),
        "freshly minted ruid must be written back: {cookies:?}"
    );
}

#[tokio::test]
async fn forwarded_query_and_cookies_ride_the_location() {
    let mut config = base_config(
        "p1",
        vec![target("t1", "https://a.example.com/", 1.0, true)],
    );
    config.forward_query = true;
    config.forward_cookies = true;
    let (_, router) = gateway(vec![config]);

    let response = send(
        &router,
        TestRequest::new()
            .path("/go?x=1&x=2")
            .header("cookie", "session=abc")
            .build("ab.example.com"),
    )
    .await;

    let location = location(&response);
    assert!(location.contains("x=1"));
    assert!(location.contains("x=2"));
    assert!(location.contains("cookie_session=abc"));
}

#[tokio::test]
async fn path_key_restricts_path_mode_proxies() {
    let mut config = base_config(
        "p1",
        vec![target("t1", "https://a.example.com/", 1.0, true)],
    );
    config.mode = switchyard::models::ProxyMode::Path;
    config.listen_urls = vec![ListenUrl {
        id: "lu1".to_string(),
        listen_url: "ab.example.com".to_string(),
        path_key: Some("k7f2".to_string()),
    }];
    let (_, router) = gateway(vec![config]);

    let admitted = send(&router, TestRequest::new().path("/k7f2/go").build("ab.example.com")).await;
    assert_eq!(admitted.status(), StatusCode::MOVED_PERMANENTLY);

    let rejected = send(&router, TestRequest::new().path("/other").build("ab.example.com")).await;
    assert_eq!(rejected.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn selection_failure_is_a_500_not_a_panic() {
    let mut config = base_config(
        "p1",
        vec![target("t1", "https://a.example.com/", 1.0, false)],
    );
    config.condition = None;
    let (_, router) = gateway(vec![config]);

    let response = send(&router, TestRequest::new().build("ab.example.com")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
