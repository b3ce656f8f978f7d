//! URL canonicalization: the stable comparison key used for every URL
//! comparison, deduplication check, and uniqueness constraint.

use url::Url;

/// Query parameters that only carry attribution/tracking data.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "dclid", "msclkid", "mc_cid", "mc_eid", "igshid", "_ga", "_gl", "_hsenc",
    "_hsmi", "ref_src", "ref_url", "yclid", "spm", "cmpid",
];

/// Tracking parameter prefixes (`utm_source`, `utm_medium`, ...).
const TRACKING_PREFIXES: &[&str] = &["utm_", "pk_", "hsa_"];

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    TRACKING_PARAMS.contains(&key.as_str()) || TRACKING_PREFIXES.iter().any(|p| key.starts_with(p))
}

/// Normalize `raw` to its canonical key, or `None` if it is not an http(s) URL.
///
/// The key uses the `https` scheme, a lowercase host without default port or
/// credentials, no fragment, no tracking parameters (remaining parameters are
/// sorted), and no trailing slash except for the root path.
///
/// `canonicalize(&canonicalize(u)?) == canonicalize(u)` for every input.
pub fn canonicalize(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut url = Url::parse(trimmed).ok()?;
    match url.scheme() {
        "http" | "https" => {}
        _ => return None,
    }
    url.host_str()?;

    if url.scheme() == "http" {
        url.set_scheme("https").ok()?;
    }
    if matches!(url.port(), Some(80) | Some(443)) {
        url.set_port(None).ok()?;
    }
    url.set_username("").ok()?;
    url.set_password(None).ok()?;
    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        let stripped = path.trim_end_matches('/');
        url.set_path(if stripped.is_empty() { "/" } else { stripped });
    }

    Some(url.to_string())
}

/// Hostname of `raw` without a leading `www.`, lowercased, or `None` when
/// the input does not parse.
pub fn domain_of(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    Some(host.trim_end_matches('.').to_string())
}

/// Whether `host` equals `domain` or is one of its subdomains.
pub fn host_matches(host: &str, domain: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let domain = domain.trim_start_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        return false;
    }
    host == domain || host.ends_with(&format!(".{domain}"))
}
