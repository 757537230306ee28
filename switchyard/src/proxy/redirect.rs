//! Per-request redirect identity and outbound parameter shaping
//!
//! Every routed request carries three identifiers: `rid` is stable per proxy,
//! `ruid` is stable per user (minted once, then carried in the `ruid` cookie),
//! `rrid` is fresh per click. They ride on the outbound Location so the
//! destination can attribute the visit.

use url::Url;
use uuid::Uuid;

use super::expr::RequestEnv;

/// Name of the stable-user-ID cookie
pub const RUID_COOKIE: &str = "ruid";

/// Identity and captured request state for one redirect
#[derive(Debug, Clone)]
pub struct RedirectInfo {
    /// `rid_<proxy id>`, stable for every user of the proxy
    pub rid: String,
    /// Fresh UUID per request
    pub rrid: String,
    /// Stable user ID, from the `ruid` cookie or freshly minted
    pub ruid: String,
    /// True when `ruid` was minted for this request and the cookie still
    /// needs to be written back
    pub ruid_minted: bool,
    /// All original query pairs, duplicates preserved
    pub query: Vec<(String, String)>,
    /// Original request cookies
    pub cookies: Vec<(String, String)>,
}

impl RedirectInfo {
    /// Build the redirect info for one request.
    ///
    /// `raw_query` is the undecoded query string; the environment's
    /// first-value-wins map is not enough here because query forwarding
    /// replays every pair.
    pub fn new(proxy_id: &str, raw_query: &str, env: &RequestEnv) -> Self {
        let (ruid, ruid_minted) = match env.cookies.get(RUID_COOKIE) {
            Some(value) if !value.is_empty() => (value.clone(), false),
            _ => (Uuid::new_v4().to_string(), true),
        };

        let query: Vec<(String, String)> = url::form_urlencoded::parse(raw_query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut cookies: Vec<(String, String)> = env
            .cookies
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        cookies.sort();

        Self {
            rid: format!("rid_{proxy_id}"),
            rrid: Uuid::new_v4().to_string(),
            ruid,
            ruid_minted,
            query,
            cookies,
        }
    }
}

/// Append the redirect identifiers (and optionally the forwarded query and
/// cookies) to an outbound URL.
///
/// `rid`, `rrid` and `ruid` use replace semantics so re-applying the helper
/// with the same info never stacks identifier pairs. Forwarded query params
/// append, duplicates included.
pub fn append_redirect_params(
    url: &mut Url,
    info: &RedirectInfo,
    forward_query: bool,
    forward_cookies: bool,
) {
    let existing: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "rid" && k != "rrid" && k != "ruid")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        pairs.extend_pairs(existing);
        pairs.append_pair("rid", &info.rid);
        pairs.append_pair("rrid", &info.rrid);
        pairs.append_pair("ruid", &info.ruid);

        if forward_query {
            pairs.extend_pairs(info.query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        if forward_cookies {
            for (name, value) in &info.cookies {
                pairs.append_pair(&format!("cookie_{name}"), value);
            }
        }
    }
}
