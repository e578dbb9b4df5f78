//! Internet Computer domain resolution.
//!
//! Maps a hostname to the canister that serves it, or to nothing for
//! ordinary web hosts. Sits on the hot path of every new proxied connection,
//! so answers are cached and bursts for the same hostname are coalesced.

pub mod canister;
pub mod dns;
pub mod domain;
pub mod error;

pub use canister::{
    CANISTER_DNS_PREFIX, canister_from_hostname, default_static_domains, is_raw_domain,
};
pub use dns::{SystemTxtResolver, TxtResolver};
pub use domain::{DomainResolver, ResolverOptions};
pub use error::{ResolverError, ResolverResult};
