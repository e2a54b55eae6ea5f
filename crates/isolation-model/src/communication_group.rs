//! Communication groups: the unit of restricted cross-group communication.
//!
//! Documents in different isolation groups normally have no way to reach
//! each other. When a page opts into a restricted opener policy, its window
//! keeps a limited channel (messaging, closed-state observation) to windows
//! in sibling isolation groups of the same communication group.
//!
//! Each member is keyed by its **communication policy** — the pair of shared
//! restricted-opener origin and isolation classification. The group enforces
//! at registration time that no two members carry the same policy, so a
//! policy lookup has exactly zero or one answer. Violations abort: a second
//! member with an existing policy means the security invariant upstream is
//! already broken.
//!
//! Members hold the only strong references to the group; the group tracks
//! members weakly and dies with its last member.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::identity::ScriptIdentity;
use crate::isolation_classification::IsolationClassification;
use crate::isolation_group::IsolationGroup;
use crate::model_context::{CommunicationGroupToken, IsolationGroupToken, ModelContext};
use crate::url_info::{Origin, UrlInfo};

// ---------------------------------------------------------------------------
// CommunicationPolicy — the pair that identifies a member
// ---------------------------------------------------------------------------

/// The (shared communication origin, isolation classification) pair that
/// uniquely identifies a member within its communication group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommunicationPolicy {
    pub communication_origin: Option<Origin>,
    pub classification: IsolationClassification,
}

impl CommunicationPolicy {
    pub fn new(
        communication_origin: Option<Origin>,
        classification: IsolationClassification,
    ) -> Self {
        Self {
            communication_origin,
            classification,
        }
    }

    /// The policy a navigation target requests. A target whose
    /// classification is not yet known matches the non-isolated member.
    pub fn for_target(target: &UrlInfo) -> Self {
        Self {
            communication_origin: target.communication_origin.clone(),
            classification: target
                .isolation
                .clone()
                .unwrap_or_else(IsolationClassification::non_isolated),
        }
    }
}

impl fmt::Display for CommunicationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.communication_origin {
            Some(origin) => write!(f, "({origin}, {})", self.classification),
            None => write!(f, "(no origin, {})", self.classification),
        }
    }
}

// ---------------------------------------------------------------------------
// CommunicationGroup
// ---------------------------------------------------------------------------

struct MemberEntry {
    token: IsolationGroupToken,
    policy: CommunicationPolicy,
    group: Weak<IsolationGroup>,
}

/// A set of isolation groups whose members may exchange a restricted set of
/// cross-window operations despite not sharing an isolation group.
pub struct CommunicationGroup {
    context: Rc<ModelContext>,
    token: CommunicationGroupToken,
    is_guest: bool,
    is_fenced: bool,
    is_fixed_storage_partition: bool,
    members: RefCell<Vec<MemberEntry>>,
    total_usage_count: Cell<u64>,
}

impl CommunicationGroup {
    /// Aborts if `is_guest` without `is_fixed_storage_partition`.
    pub fn new(
        context: Rc<ModelContext>,
        is_guest: bool,
        is_fenced: bool,
        is_fixed_storage_partition: bool,
    ) -> Rc<Self> {
        assert!(
            !is_guest || is_fixed_storage_partition,
            "guest communication groups require a fixed storage partition"
        );
        let token = context.mint_communication_group_token();
        debug!(group = %token, guest = is_guest, fenced = is_fenced, "communication group created");
        Rc::new(Self {
            context,
            token,
            is_guest,
            is_fenced,
            is_fixed_storage_partition,
            members: RefCell::new(Vec::new()),
            total_usage_count: Cell::new(0),
        })
    }

    // -----------------------------------------------------------------------
    // Member lookup and creation
    // -----------------------------------------------------------------------

    /// The member carrying `policy`, if any. By the registration invariant
    /// there is at most one.
    pub fn find_matching_member(&self, policy: &CommunicationPolicy) -> Option<Rc<IsolationGroup>> {
        self.members
            .borrow()
            .iter()
            .find(|member| member.policy == *policy)
            .and_then(|member| member.group.upgrade())
    }

    /// Find the member carrying `policy`, or construct one inheriting this
    /// group's guest/fenced/fixed-storage-partition flags.
    pub fn find_or_create_member_for_policy(
        self: &Rc<Self>,
        policy: &CommunicationPolicy,
    ) -> Rc<IsolationGroup> {
        if let Some(existing) = self.find_matching_member(policy) {
            return existing;
        }
        IsolationGroup::new(
            Rc::clone(&self.context),
            policy.classification.clone(),
            self.is_guest,
            self.is_fenced,
            self.is_fixed_storage_partition,
            Some(Rc::clone(self)),
            policy.communication_origin.clone(),
        )
    }

    /// Find or create an identity for `target` in the sibling member
    /// matching the target's communication policy.
    ///
    /// Aborts on a fenced group: fenced content cannot use the cross-group
    /// channel.
    pub fn find_or_create_sibling_identity_for_url(
        self: &Rc<Self>,
        target: &UrlInfo,
        allow_shared_default: bool,
    ) -> Rc<dyn ScriptIdentity> {
        assert!(
            !self.is_fenced,
            "fenced communication group {} asked for a sibling identity",
            self.token
        );
        let policy = CommunicationPolicy::for_target(target);
        let member = self.find_or_create_member_for_policy(&policy);
        member.find_or_create_identity_for_url(target, allow_shared_default)
    }

    // -----------------------------------------------------------------------
    // Member registration — called from the member's own lifecycle
    // -----------------------------------------------------------------------

    /// Register `group` as a member. Called from the member's constructor.
    ///
    /// Aborts if `group` is already a member, if a member with the same
    /// communication policy exists, or if the guest/fenced/fixed flags
    /// disagree with this group's.
    pub fn register_member(&self, group: &Rc<IsolationGroup>) {
        assert!(
            group.is_fixed_storage_partition() == self.is_fixed_storage_partition,
            "isolation group {} and communication group {} disagree on fixed storage partition",
            group.token(),
            self.token
        );
        assert!(
            group.is_guest() == self.is_guest,
            "isolation group {} and communication group {} disagree on guest status",
            group.token(),
            self.token
        );
        assert!(
            group.is_fenced() == self.is_fenced,
            "isolation group {} and communication group {} disagree on fenced status",
            group.token(),
            self.token
        );

        let policy = CommunicationPolicy::new(
            group.common_communication_origin().cloned(),
            group.classification().clone(),
        );
        let mut members = self.members.borrow_mut();
        assert!(
            members.iter().all(|member| member.token != group.token()),
            "isolation group {} is already a member of communication group {}",
            group.token(),
            self.token
        );
        assert!(
            members.iter().all(|member| member.policy != policy),
            "communication group {} already has a member with policy {policy}",
            self.token
        );
        members.push(MemberEntry {
            token: group.token(),
            policy: policy.clone(),
            group: Rc::downgrade(group),
        });
        debug!(group = %self.token, member = %group.token(), policy = %policy, "member registered");
    }

    /// Remove the member identified by `token`. Called from the member's
    /// destructor; aborts if the member is not present.
    pub fn unregister_member(&self, token: IsolationGroupToken) {
        let mut members = self.members.borrow_mut();
        let before = members.len();
        members.retain(|member| member.token != token);
        assert!(
            members.len() < before,
            "isolation group {token} is not a member of communication group {}",
            self.token
        );
        debug!(group = %self.token, member = %token, "member unregistered");
    }

    // -----------------------------------------------------------------------
    // Usage accounting
    // -----------------------------------------------------------------------

    pub fn increment_total_usage(&self) {
        self.total_usage_count.set(self.total_usage_count.get() + 1);
    }

    /// Aborts on underflow.
    pub fn decrement_total_usage(&self) {
        let count = self.total_usage_count.get();
        assert!(
            count > 0,
            "total usage count underflow on communication group {}",
            self.token
        );
        self.total_usage_count.set(count - 1);
    }

    pub fn total_usage_count(&self) -> u64 {
        self.total_usage_count.get()
    }

    /// Sum of the live members' own usage counts, for diagnostics. Equals
    /// `total_usage_count` unless a member is mid-teardown.
    pub fn aggregate_member_usage(&self) -> u64 {
        self.members
            .borrow()
            .iter()
            .filter_map(|member| member.group.upgrade())
            .map(|group| group.active_usage_count())
            .sum()
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn token(&self) -> CommunicationGroupToken {
        self.token
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

    pub fn member_count(&self) -> usize {
        self.members.borrow().len()
    }

    pub fn member_tokens(&self) -> Vec<IsolationGroupToken> {
        self.members.borrow().iter().map(|member| member.token).collect()
    }
}

impl fmt::Debug for CommunicationGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommunicationGroup")
            .field("token", &self.token)
            .field("is_guest", &self.is_guest)
            .field("is_fenced", &self.is_fenced)
            .field("is_fixed_storage_partition", &self.is_fixed_storage_partition)
            .field("members", &self.member_tokens())
            .field("total_usage_count", &self.total_usage_count.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::identity::{IdentityFactory, ScriptIdentity, SiteKeyResolver};
    use crate::model_context::{IdentityToken, ModelPolicy};
    use crate::url_info::SiteKey;

    struct TestIdentity {
        token: IdentityToken,
        site: Option<SiteKey>,
        group: Rc<IsolationGroup>,
    }

    impl ScriptIdentity for TestIdentity {
        fn token(&self) -> IdentityToken {
            self.token
        }

        fn is_default_identity(&self) -> bool {
            self.site.is_none()
        }

        fn site_key(&self) -> Option<SiteKey> {
            self.site.clone()
        }
    }

    impl Drop for TestIdentity {
        fn drop(&mut self) {
            self.group.unregister_identity(self.token, self.site.as_ref());
        }
    }

    struct TestFactory;

    impl IdentityFactory for TestFactory {
        fn create_identity(
            &self,
            group: &Rc<IsolationGroup>,
            site: Option<SiteKey>,
        ) -> Rc<dyn ScriptIdentity> {
            let identity: Rc<dyn ScriptIdentity> = Rc::new(TestIdentity {
                token: group.context().mint_identity_token(),
                site,
                group: Rc::clone(group),
            });
            group.register_identity(&identity);
            identity
        }
    }

    struct TestResolver;

    impl SiteKeyResolver for TestResolver {
        fn compute_site_key(&self, target: &UrlInfo) -> SiteKey {
            let origin = Origin::parse(&target.url).expect("test URLs are well-formed");
            SiteKey::new(format!("{}://{}", origin.scheme(), origin.host()))
        }
    }

    fn test_context() -> Rc<ModelContext> {
        ModelContext::new(
            ModelPolicy::default(),
            Rc::new(TestResolver),
            Rc::new(TestFactory),
        )
    }

    fn origin(s: &str) -> Origin {
        Origin::parse(s).unwrap()
    }

    fn non_isolated_policy(communication_origin: Option<Origin>) -> CommunicationPolicy {
        CommunicationPolicy::new(communication_origin, IsolationClassification::non_isolated())
    }

    // -----------------------------------------------------------------------
    // Member lookup and creation
    // -----------------------------------------------------------------------

    #[test]
    fn members_are_keyed_by_policy() {
        let context = test_context();
        let group = CommunicationGroup::new(context, false, false, false);

        let g1 = group.find_or_create_member_for_policy(&non_isolated_policy(None));
        let g2 = group
            .find_or_create_member_for_policy(&non_isolated_policy(Some(origin("https://x.example"))));
        assert_ne!(g1.token(), g2.token());
        assert_eq!(group.member_count(), 2);

        let again = group.find_or_create_member_for_policy(&non_isolated_policy(None));
        assert_eq!(again.token(), g1.token());
        assert_eq!(group.member_count(), 2);
    }

    #[test]
    fn distinct_classifications_get_distinct_members() {
        let context = test_context();
        let group = CommunicationGroup::new(context, false, false, false);
        let shared = origin("https://x.example");

        let g1 = group.find_or_create_member_for_policy(&CommunicationPolicy::new(
            Some(shared.clone()),
            IsolationClassification::non_isolated(),
        ));
        let g2 = group.find_or_create_member_for_policy(&CommunicationPolicy::new(
            Some(shared.clone()),
            IsolationClassification::isolated(shared),
        ));
        assert_ne!(g1.token(), g2.token());
        assert_eq!(group.member_count(), 2);
    }

    #[test]
    fn created_members_inherit_group_flags_and_policy() {
        let context = test_context();
        let group = CommunicationGroup::new(context, false, false, true);
        let policy = non_isolated_policy(Some(origin("https://x.example")));

        let member = group.find_or_create_member_for_policy(&policy);
        assert!(member.is_fixed_storage_partition());
        assert!(!member.is_guest());
        assert!(!member.is_fenced());
        assert_eq!(
            member.common_communication_origin(),
            Some(&origin("https://x.example"))
        );
        assert_eq!(member.communication_group().token(), group.token());
    }

    #[test]
    fn find_matching_member_on_empty_group() {
        let context = test_context();
        let group = CommunicationGroup::new(context, false, false, false);
        assert!(group.find_matching_member(&non_isolated_policy(None)).is_none());
    }

    // -----------------------------------------------------------------------
    // Lifecycle — members keep the group alive, not vice versa
    // -----------------------------------------------------------------------

    #[test]
    fn member_drop_unregisters() {
        let context = test_context();
        let group = CommunicationGroup::new(context, false, false, false);

        let member = group.find_or_create_member_for_policy(&non_isolated_policy(None));
        assert_eq!(group.member_count(), 1);

        drop(member);
        assert_eq!(group.member_count(), 0);
    }

    #[test]
    fn group_dies_with_its_last_member() {
        let context = test_context();
        let member = IsolationGroup::new(
            context,
            IsolationClassification::non_isolated(),
            false,
            false,
            false,
            None,
            None,
        );
        let weak_group = Rc::downgrade(member.communication_group());
        assert!(weak_group.upgrade().is_some());

        drop(member);
        assert!(weak_group.upgrade().is_none());
    }

    // -----------------------------------------------------------------------
    // Sibling identity lookup
    // -----------------------------------------------------------------------

    #[test]
    fn sibling_identity_lands_in_the_policy_member() {
        let context = test_context();
        let opener = IsolationGroup::new(
            Rc::clone(&context),
            IsolationClassification::non_isolated(),
            false,
            false,
            false,
            None,
            None,
        );
        let group = Rc::clone(opener.communication_group());
        let restricted = origin("https://x.example");

        let target = UrlInfo::new("https://a.example/")
            .with_communication_origin(restricted.clone());
        let identity = opener.find_or_create_identity_for_communication_group(&target, false);

        assert_eq!(group.member_count(), 2);
        let sibling = group
            .find_matching_member(&non_isolated_policy(Some(restricted)))
            .unwrap();
        assert_ne!(sibling.token(), opener.token());
        let site = sibling.compute_site_key_for_url(&target);
        assert!(sibling.has_identity(&site));

        // Same policy and site: the sibling and its identity are reused.
        let again = opener.find_or_create_identity_for_communication_group(&target, false);
        assert_eq!(identity.token(), again.token());
        assert_eq!(group.member_count(), 2);
    }

    #[test]
    fn sibling_request_matching_own_policy_stays_home() {
        let context = test_context();
        let opener = IsolationGroup::new(
            Rc::clone(&context),
            IsolationClassification::non_isolated(),
            false,
            false,
            false,
            None,
            None,
        );
        let group = Rc::clone(opener.communication_group());

        // No communication origin, non-isolated: the opener's own policy.
        let target = UrlInfo::new("https://a.example/");
        let identity = opener.find_or_create_identity_for_communication_group(&target, false);

        assert_eq!(group.member_count(), 1);
        let site = opener.compute_site_key_for_url(&target);
        assert!(opener.has_identity(&site));
        assert!(!identity.is_default_identity());
    }

    #[test]
    #[should_panic(expected = "asked for a sibling identity")]
    fn fenced_group_sibling_request_aborts() {
        let context = test_context();
        let group = CommunicationGroup::new(context, false, true, false);
        group.find_or_create_sibling_identity_for_url(&UrlInfo::new("https://a.example/"), false);
    }

    // -----------------------------------------------------------------------
    // Registration invariants
    // -----------------------------------------------------------------------

    #[test]
    #[should_panic(expected = "is already a member")]
    fn double_member_registration_aborts() {
        let context = test_context();
        let member = IsolationGroup::new(
            context,
            IsolationClassification::non_isolated(),
            false,
            false,
            false,
            None,
            None,
        );
        let group = Rc::clone(member.communication_group());
        group.register_member(&member);
    }

    #[test]
    #[should_panic(expected = "already has a member with policy")]
    fn duplicate_policy_registration_aborts() {
        let context = test_context();
        let first = IsolationGroup::new(
            Rc::clone(&context),
            IsolationClassification::non_isolated(),
            false,
            false,
            false,
            None,
            None,
        );
        let group = Rc::clone(first.communication_group());

        // Same (no origin, non-isolated) policy, registered with its own
        // communication group; registering it here collides with `first`.
        let outsider = IsolationGroup::new(
            Rc::clone(&context),
            IsolationClassification::non_isolated(),
            false,
            false,
            false,
            None,
            None,
        );
        group.register_member(&outsider);
    }

    #[test]
    #[should_panic(expected = "disagree on fixed storage partition")]
    fn fixed_partition_mismatch_aborts() {
        let context = test_context();
        let first = IsolationGroup::new(
            Rc::clone(&context),
            IsolationClassification::non_isolated(),
            false,
            false,
            false,
            None,
            None,
        );
        let group = Rc::clone(first.communication_group());

        // Distinct policy so the mismatch check is what fires.
        let outsider = IsolationGroup::new(
            Rc::clone(&context),
            IsolationClassification::non_isolated(),
            false,
            false,
            true,
            None,
            Some(origin("https://y.example")),
        );
        group.register_member(&outsider);
    }

    #[test]
    #[should_panic(expected = "is not a member")]
    fn unregistering_a_non_member_aborts() {
        let context = test_context();
        let member = IsolationGroup::new(
            Rc::clone(&context),
            IsolationClassification::non_isolated(),
            false,
            false,
            false,
            None,
            None,
        );
        let other = CommunicationGroup::new(Rc::clone(&context), false, false, false);
        other.unregister_member(member.token());
    }

    #[test]
    #[should_panic(expected = "guest communication groups require a fixed storage partition")]
    fn guest_without_fixed_partition_aborts() {
        let context = test_context();
        CommunicationGroup::new(context, true, false, false);
    }

    // -----------------------------------------------------------------------
    // Usage accounting
    // -----------------------------------------------------------------------

    #[test]
    fn aggregate_usage_sums_live_members() {
        let context = test_context();
        let group = CommunicationGroup::new(context, false, false, false);
        let g1 = group.find_or_create_member_for_policy(&non_isolated_policy(None));
        let g2 = group
            .find_or_create_member_for_policy(&non_isolated_policy(Some(origin("https://x.example"))));

        g1.increment_usage();
        g1.increment_usage();
        g2.increment_usage();

        assert_eq!(group.total_usage_count(), 3);
        assert_eq!(group.aggregate_member_usage(), 3);

        g1.decrement_usage();
        assert_eq!(group.total_usage_count(), 2);
        assert_eq!(group.aggregate_member_usage(), 2);
    }

    #[test]
    #[should_panic(expected = "total usage count underflow")]
    fn total_usage_underflow_aborts() {
        let context = test_context();
        let group = CommunicationGroup::new(context, false, false, false);
        group.decrement_total_usage();
    }
}
