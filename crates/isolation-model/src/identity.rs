//! Seams to the external collaborators: site-key computation and the
//! script-sharing identity itself.
//!
//! The model never implements a script-sharing identity; it stores weak
//! handles to identities created by the embedder's [`IdentityFactory`] and
//! hands strong handles back to navigation callers. The identity-to-process
//! registry stays entirely on the embedder's side of this seam.

use std::rc::Rc;

use crate::isolation_group::IsolationGroup;
use crate::model_context::IdentityToken;
use crate::url_info::{SiteKey, UrlInfo};

/// Computes the canonical per-site comparison key for a navigation target.
///
/// Must be pure and deterministic: the same target always yields the same
/// key. The key is always the concrete per-site classification; whether a
/// site ends up in the shared default identity is decided by the group, not
/// encoded in the key.
pub trait SiteKeyResolver {
    fn compute_site_key(&self, target: &UrlInfo) -> SiteKey;
}

/// A script-sharing identity handle, as seen by the model.
///
/// Identities are reference-counted independently of the groups that track
/// them: an identity holds a strong reference to its owning
/// [`IsolationGroup`] for its whole lifetime, while the group holds only a
/// weak handle back.
pub trait ScriptIdentity {
    fn token(&self) -> IdentityToken;

    /// Whether this is the shared default identity (hosting any site that
    /// needs no dedicated identity) rather than a per-site one.
    fn is_default_identity(&self) -> bool;

    /// The site bound to this identity; `None` for the default identity.
    fn site_key(&self) -> Option<SiteKey>;
}

/// Constructs script-sharing identities on behalf of an isolation group.
///
/// `site == None` requests the shared default identity.
///
/// Contract: the created identity must call
/// [`IsolationGroup::register_identity`] on `group` during construction,
/// must call [`IsolationGroup::unregister_identity`] when dropped, and must
/// keep a strong `Rc<IsolationGroup>` for its whole lifetime so the group
/// outlives every identity registered with it.
pub trait IdentityFactory {
    fn create_identity(
        &self,
        group: &Rc<IsolationGroup>,
        site: Option<SiteKey>,
    ) -> Rc<dyn ScriptIdentity>;
}
