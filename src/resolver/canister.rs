//! Hostname-only canister detection: raw domains, the static table and
//! canister ids embedded in subdomain labels.

use ic_principal::Principal;
use regex::RegexSet;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Record name prefix for DNS TXT canister bindings.
pub const CANISTER_DNS_PREFIX: &str = "_canister-id";

/// Raw endpoints skip response verification and are never proxied.
static RAW_DOMAINS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"\.raw\.ic[0-9]+\.app",
        r"\.raw\.ic[0-9]+\.dev",
        r"\.raw\.icp[0-9]+\.io",
        r"\.raw\.[\w-]+\.testnet\.[\w-]+\.network",
    ])
    .expect("raw domain patterns are valid")
});

/// Well-known domains served from fixed canisters.
pub const STATIC_DOMAINS: &[(&str, &str)] = &[
    ("oc.app", "6hsbt-vqaaa-aaaaf-aaafq-cai"),
    ("identity.ic0.app", "rdmx6-jaaaa-aaaaa-aaadq-cai"),
    ("nns.ic0.app", "qoctq-giaaa-aaaaa-aaaea-cai"),
    ("nns.icp", "qoctq-giaaa-aaaaa-aaaea-cai"),
];

/// True for `*.raw.ic<N>.app`, `*.raw.ic<N>.dev`, `*.raw.icp<N>.io` and raw testnet hosts.
pub fn is_raw_domain(hostname: &str) -> bool {
    RAW_DOMAINS.is_match(hostname)
}

/// The built-in static table as text, for configuration defaults.
pub fn default_static_domains() -> HashMap<String, String> {
    STATIC_DOMAINS
        .iter()
        .map(|(host, canister)| (host.to_string(), canister.to_string()))
        .collect()
}

/// First label, scanning from the right, that parses as a canister id.
pub fn canister_from_hostname(hostname: &str) -> Option<Principal> {
    hostname
        .split('.')
        .rev()
        .find_map(|label| Principal::from_text(label).ok())
}
