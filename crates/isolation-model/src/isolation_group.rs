//! Isolation groups: the unit of script sharing.
//!
//! An isolation group owns the registry mapping each site to its one
//! script-sharing identity, plus an optional shared default identity for
//! sites that need no dedicated one. Documents placed in the same identity
//! may synchronously script each other; the group's registry is what makes
//! "at most one identity per site per group" hold.
//!
//! Ownership is deliberately one-directional: identities hold strong
//! references to their group and the group holds weak handles back, so an
//! identity's death unregisters it without the group ever keeping an
//! identity alive. The group in turn holds the only strong references to its
//! [`CommunicationGroup`], which tracks members weakly.
//!
//! A group's isolation classification, guest/fenced flags, and communication
//! origin are immutable; the storage partition is frozen on the first
//! identity created in the group and never changes afterwards.

use std::cell::{Cell, OnceCell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::communication_group::CommunicationGroup;
use crate::identity::ScriptIdentity;
use crate::isolation_classification::IsolationClassification;
use crate::model_context::{IdentityToken, IsolationGroupToken, ModelContext};
use crate::url_info::{Origin, SiteKey, StoragePartitionKey, UrlInfo};

// ---------------------------------------------------------------------------
// IdentityEntry — weak registry slot
// ---------------------------------------------------------------------------

/// One registry slot. The token is kept beside the weak handle so the slot
/// stays matchable while its identity is mid-teardown (the weak handle no
/// longer upgrades at that point).
struct IdentityEntry {
    token: IdentityToken,
    identity: Weak<dyn ScriptIdentity>,
}

// ---------------------------------------------------------------------------
// IsolationGroup
// ---------------------------------------------------------------------------

/// The unit within which documents may share a script-sharing identity.
///
/// Construct via [`IsolationGroup::new`]; share via `Rc`. The type is
/// `!Send`/`!Sync`: all use stays on the one sequence that owns the process
/// model.
pub struct IsolationGroup {
    context: Rc<ModelContext>,
    token: IsolationGroupToken,
    classification: IsolationClassification,
    is_guest: bool,
    is_fenced: bool,
    is_fixed_storage_partition: bool,
    common_communication_origin: Option<Origin>,
    communication_group: Rc<CommunicationGroup>,
    /// Set once, by the first identity created in this group, then frozen.
    storage_partition: OnceCell<StoragePartitionKey>,
    site_to_identity: RefCell<BTreeMap<SiteKey, IdentityEntry>>,
    default_identity: RefCell<Option<IdentityEntry>>,
    /// Sites routed to the shared default identity, for diagnostics. Never
    /// overlaps `site_to_identity`.
    default_site_keys: RefCell<BTreeSet<SiteKey>>,
    active_usage_count: Cell<u64>,
}

impl IsolationGroup {
    /// Create a group and register it with `communication_group`, creating a
    /// fresh communication group when none is supplied.
    ///
    /// Aborts if `is_guest` without `is_fixed_storage_partition`, or if the
    /// supplied communication group's guest/fenced/fixed flags disagree.
    pub fn new(
        context: Rc<ModelContext>,
        classification: IsolationClassification,
        is_guest: bool,
        is_fenced: bool,
        is_fixed_storage_partition: bool,
        communication_group: Option<Rc<CommunicationGroup>>,
        common_communication_origin: Option<Origin>,
    ) -> Rc<Self> {
        assert!(
            !is_guest || is_fixed_storage_partition,
            "guest isolation groups require a fixed storage partition"
        );
        let communication_group = communication_group.unwrap_or_else(|| {
            CommunicationGroup::new(
                Rc::clone(&context),
                is_guest,
                is_fenced,
                is_fixed_storage_partition,
            )
        });
        let token = context.mint_isolation_group_token();
        let group = Rc::new(Self {
            context,
            token,
            classification,
            is_guest,
            is_fenced,
            is_fixed_storage_partition,
            common_communication_origin,
            communication_group,
            storage_partition: OnceCell::new(),
            site_to_identity: RefCell::new(BTreeMap::new()),
            default_identity: RefCell::new(None),
            default_site_keys: RefCell::new(BTreeSet::new()),
            active_usage_count: Cell::new(0),
        });
        group.communication_group.register_member(&group);
        debug!(
            group = %group.token,
            classification = %group.classification,
            guest = group.is_guest,
            fenced = group.is_fenced,
            "isolation group created"
        );
        group
    }

    // -----------------------------------------------------------------------
    // Identity placement
    // -----------------------------------------------------------------------

    /// Whether a live identity is registered for `site`.
    pub fn has_identity(&self, site: &SiteKey) -> bool {
        self.lookup_identity(site).is_some()
    }

    /// Find or create the script-sharing identity for `target` in this
    /// group.
    ///
    /// Resolution order: an existing per-site identity wins; otherwise the
    /// shared default identity is adopted when `allow_shared_default` holds
    /// and both the policy and the site permit it; otherwise a fresh
    /// per-site identity is created and registered. The first identity
    /// created in a fresh group freezes the group's storage partition.
    ///
    /// Two concurrent navigations through different paths can each decide
    /// "no identity exists yet" and each create one; both end up registered
    /// and the later registration wins the map slot. Known, accepted rare
    /// race; callers must not rely on the loser staying reachable.
    pub fn find_or_create_identity_for_url(
        self: &Rc<Self>,
        target: &UrlInfo,
        allow_shared_default: bool,
    ) -> Rc<dyn ScriptIdentity> {
        let site_key = self.compute_site_key_for_url(target);

        if let Some(existing) = self.lookup_identity(&site_key) {
            return existing;
        }

        if allow_shared_default && self.site_may_share_default_identity(&site_key) {
            return self.adopt_default_identity(site_key);
        }

        self.freeze_storage_partition(&site_key);
        let identity = self
            .context
            .identity_factory()
            .create_identity(self, Some(site_key.clone()));
        debug_assert!(
            self.has_identity(&site_key),
            "identity factory must register the identity it creates"
        );
        identity
    }

    /// Find or create an identity for `target` in the communication-group
    /// sibling matching the target's communication policy.
    ///
    /// Aborts on a fenced group: fenced content has no opener relationship
    /// and must never reach the cross-group channel.
    pub fn find_or_create_identity_for_communication_group(
        self: &Rc<Self>,
        target: &UrlInfo,
        allow_shared_default: bool,
    ) -> Rc<dyn ScriptIdentity> {
        assert!(
            !self.is_fenced,
            "fenced isolation group {} asked for a communication-group sibling",
            self.token
        );
        self.communication_group
            .find_or_create_sibling_identity_for_url(target, allow_shared_default)
    }

    /// Compute the site key `target` would resolve to in this group, without
    /// creating or registering anything.
    ///
    /// The result is always the concrete per-site key; there is no
    /// shared-default sentinel. Aborts if the target carries a
    /// classification incompatible with this group's.
    pub fn compute_site_key_for_url(&self, target: &UrlInfo) -> SiteKey {
        assert!(
            IsolationClassification::are_compatible(
                target.isolation.as_ref(),
                Some(&self.classification)
            ),
            "target classification {:?} is incompatible with isolation group {} ({})",
            target.isolation,
            self.token,
            self.classification
        );
        let mut resolved = target.clone();
        // An absent classification resolves to the group's: deriving a key
        // from this group commits the target to the group's isolation.
        resolved.isolation = Some(self.classification.clone());
        if self.is_fixed_storage_partition {
            if let Some(partition) = self.storage_partition.get() {
                resolved.storage_partition = Some(partition.clone());
            }
        }
        self.context.site_key_resolver().compute_site_key(&resolved)
    }

    // -----------------------------------------------------------------------
    // Identity registration — called from the identity's own lifecycle
    // -----------------------------------------------------------------------

    /// Register `identity` with this group. Called by the identity during
    /// its construction.
    ///
    /// A default identity takes the default slot and never enters the site
    /// map. For per-site identities, a later registration by a *different*
    /// identity silently wins an occupied slot (the accepted creation race);
    /// re-registering the same identity aborts.
    pub fn register_identity(&self, identity: &Rc<dyn ScriptIdentity>) {
        let token = identity.token();
        if identity.is_default_identity() {
            let mut slot = self.default_identity.borrow_mut();
            if let Some(existing) = slot.as_ref() {
                assert!(
                    existing.token != token,
                    "identity {token} registered twice as the default identity of group {}",
                    self.token
                );
            }
            *slot = Some(IdentityEntry {
                token,
                identity: Rc::downgrade(identity),
            });
            debug!(group = %self.token, identity = %token, "default identity registered");
            return;
        }

        let Some(site) = identity.site_key() else {
            panic!("non-default identity {token} has no site key");
        };
        let mut map = self.site_to_identity.borrow_mut();
        if let Some(existing) = map.get(&site) {
            assert!(
                existing.token != token,
                "identity {token} registered twice for site {site} in group {}",
                self.token
            );
            if existing.identity.strong_count() > 0 {
                debug!(
                    group = %self.token,
                    site = %site,
                    loser = %existing.token,
                    winner = %token,
                    "concurrent identity creation for one site; later registration wins"
                );
            }
        }
        map.insert(
            site.clone(),
            IdentityEntry {
                token,
                identity: Rc::downgrade(identity),
            },
        );
        debug!(group = %self.token, identity = %token, site = %site, "identity registered");
    }

    /// Remove the registration owned by `token`, if it still is the owner.
    /// Idempotent; called by the identity when dropped, including during
    /// group-teardown reentrancy.
    pub fn unregister_identity(&self, token: IdentityToken, site: Option<&SiteKey>) {
        match site {
            Some(site) => {
                let mut map = self.site_to_identity.borrow_mut();
                if map.get(site).is_some_and(|entry| entry.token == token) {
                    map.remove(site);
                    debug!(group = %self.token, identity = %token, site = %site, "identity unregistered");
                }
            }
            None => {
                let mut slot = self.default_identity.borrow_mut();
                if slot.as_ref().is_some_and(|entry| entry.token == token) {
                    *slot = None;
                    self.default_site_keys.borrow_mut().clear();
                    debug!(group = %self.token, identity = %token, "default identity unregistered");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Usage accounting
    // -----------------------------------------------------------------------

    pub fn increment_usage(&self) {
        self.active_usage_count.set(self.active_usage_count.get() + 1);
        self.communication_group.increment_total_usage();
    }

    /// Aborts on underflow.
    pub fn decrement_usage(&self) {
        let count = self.active_usage_count.get();
        assert!(
            count > 0,
            "usage count underflow on isolation group {}",
            self.token
        );
        self.active_usage_count.set(count - 1);
        self.communication_group.decrement_total_usage();
    }

    pub fn active_usage_count(&self) -> u64 {
        self.active_usage_count.get()
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn token(&self) -> IsolationGroupToken {
        self.token
    }

    pub fn classification(&self) -> &IsolationClassification {
        &self.classification
    }

    pub fn is_guest(&self) -> bool {
        self.is_guest
    }

    pub fn is_fenced(&self) -> bool {
        self.is_fenced
    }

    pub fn is_fixed_storage_partition(&self) -> bool {
        self.is_fixed_storage_partition
    }

    pub fn common_communication_origin(&self) -> Option<&Origin> {
        self.common_communication_origin.as_ref()
    }

    /// The frozen storage partition; `None` until the first identity is
    /// created.
    pub fn storage_partition(&self) -> Option<&StoragePartitionKey> {
        self.storage_partition.get()
    }

    pub fn has_default_identity(&self) -> bool {
        self.default_identity
            .borrow()
            .as_ref()
            .is_some_and(|entry| entry.identity.strong_count() > 0)
    }

    /// Whether `site` was routed to the shared default identity.
    pub fn is_site_in_default_identity(&self, site: &SiteKey) -> bool {
        self.default_site_keys.borrow().contains(site)
    }

    /// Live per-site registrations. The default identity is never counted.
    pub fn registered_site_count(&self) -> usize {
        self.site_to_identity
            .borrow()
            .values()
            .filter(|entry| entry.identity.strong_count() > 0)
            .count()
    }

    pub fn communication_group(&self) -> &Rc<CommunicationGroup> {
        &self.communication_group
    }

    pub fn context(&self) -> &Rc<ModelContext> {
        &self.context
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn lookup_identity(&self, site: &SiteKey) -> Option<Rc<dyn ScriptIdentity>> {
        self.site_to_identity
            .borrow()
            .get(site)
            .and_then(|entry| entry.identity.upgrade())
    }

    fn site_may_share_default_identity(&self, site_key: &SiteKey) -> bool {
        self.context.policy().shared_default_identity_enabled
            && !self.classification.is_isolated()
            && !self.is_guest
            && !site_key.requires_dedicated_identity
    }

    fn adopt_default_identity(self: &Rc<Self>, site_key: SiteKey) -> Rc<dyn ScriptIdentity> {
        let existing = self
            .default_identity
            .borrow()
            .as_ref()
            .and_then(|entry| entry.identity.upgrade());
        if let Some(identity) = existing {
            self.default_site_keys.borrow_mut().insert(site_key);
            return identity;
        }

        self.freeze_storage_partition(&site_key);
        let identity = self.context.identity_factory().create_identity(self, None);
        assert!(
            identity.is_default_identity(),
            "identity factory returned a per-site identity for a default-identity request"
        );
        debug!(group = %self.token, identity = %identity.token(), site = %site_key, "site adopted the shared default identity");
        self.default_site_keys.borrow_mut().insert(site_key);
        identity
    }

    fn freeze_storage_partition(&self, site_key: &SiteKey) {
        self.storage_partition
            .get_or_init(|| site_key.storage_partition.clone());
    }
}

impl Drop for IsolationGroup {
    fn drop(&mut self) {
        debug!(group = %self.token, "isolation group destroyed");
        self.communication_group.unregister_member(self.token);
    }
}

impl fmt::Debug for IsolationGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationGroup")
            .field("token", &self.token)
            .field("classification", &self.classification)
            .field("is_guest", &self.is_guest)
            .field("is_fenced", &self.is_fenced)
            .field("is_fixed_storage_partition", &self.is_fixed_storage_partition)
            .field("common_communication_origin", &self.common_communication_origin)
            .field("communication_group", &self.communication_group.token())
            .field("storage_partition", &self.storage_partition.get())
            .field("registered_sites", &self.site_to_identity.borrow().len())
            .field("active_usage_count", &self.active_usage_count.get())
            .finish()
    }
}
