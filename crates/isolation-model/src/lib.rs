//! Site-isolation process-allocation model.
//!
//! Given a navigation target (its URL, already-parsed cross-origin-isolation
//! requirements, and opener relationships), this crate decides which
//! *isolation group* and *script-sharing identity* the new document belongs
//! to. Documents that must never synchronously script each other are
//! guaranteed to be assignable to different processes, while documents in a
//! permitted communication relationship (limited cross-window messaging under
//! a restricted opener policy) keep a path to reach each other.
//!
//! Structure, leaf to root:
//!
//! - [`IsolationClassification`]: comparable value describing whether a
//!   browsing context is non-isolated, cross-origin isolated to a top-level
//!   origin, or isolated at application strength.
//! - [`IsolationGroup`]: the unit of script sharing; at most one
//!   script-sharing identity per site, plus an optional shared default
//!   identity for sites that need no dedicated one.
//! - [`CommunicationGroup`]: the unit of restricted cross-group
//!   communication; at most one member isolation group per communication
//!   policy.
//!
//! The script-sharing identity itself, the site-key computation, and the
//! identity-to-process registry are external collaborators, reached through
//! the seams in [`identity`]. All construction parameters flow through an
//! explicit [`ModelContext`]; there is no global state.
//!
//! Everything here is synchronous, in-memory bookkeeping on a single
//! sequence. The group types are reference-counted through `Rc` and are
//! `!Send`/`!Sync`, so cross-thread use is rejected at compile time.
//! Invariant violations (duplicate members, negative usage counts, fenced
//! groups asked for cross-group siblings) abort via `panic!` instead of
//! returning recoverable errors: they indicate the security invariant may
//! already be broken, and continuing could grant script access across
//! origins.

#![forbid(unsafe_code)]

pub mod communication_group;
pub mod identity;
pub mod isolation_classification;
pub mod isolation_group;
pub mod model_context;
pub mod url_info;

pub use communication_group::{CommunicationGroup, CommunicationPolicy};
pub use identity::{IdentityFactory, ScriptIdentity, SiteKeyResolver};
pub use isolation_classification::IsolationClassification;
pub use isolation_group::IsolationGroup;
pub use model_context::{
    CommunicationGroupToken, IdentityToken, IsolationGroupToken, ModelContext, ModelPolicy,
};
pub use url_info::{Origin, OriginParseError, SiteKey, StoragePartitionKey, UrlInfo};
