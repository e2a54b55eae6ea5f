//! Owning context for the process-allocation model.
//!
//! Every group construction parameter that the surrounding browser process
//! would otherwise read from ambient singletons (feature policy, id
//! generators, collaborator registries) is injected here explicitly. One
//! [`ModelContext`] corresponds to one browser-side context; every group and
//! identity created under it shares the same `Rc<ModelContext>`.
//!
//! The context also mints the opaque tokens that give groups and identities
//! an identity beyond their address: monotonic per-context counters, unique
//! for the context's lifetime, never reused.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::identity::{IdentityFactory, SiteKeyResolver};

// ---------------------------------------------------------------------------
// Tokens — opaque per-object identities
// ---------------------------------------------------------------------------

/// Opaque token identifying one isolation group within its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IsolationGroupToken(u64);

impl fmt::Display for IsolationGroupToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ig:{}", self.0)
    }
}

/// Opaque token identifying one communication group within its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommunicationGroupToken(u64);

impl fmt::Display for CommunicationGroupToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cg:{}", self.0)
    }
}

/// Opaque token identifying one script-sharing identity within its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityToken(u64);

impl fmt::Display for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ModelPolicy — externally-evaluated configuration
// ---------------------------------------------------------------------------

/// Already-evaluated policy inputs the model does not compute itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPolicy {
    /// Whether a shared default identity may exist at all. The device
    /// heuristic (memory class, feature flags) that produces this answer
    /// lives outside the model; groups only consume the outcome.
    pub shared_default_identity_enabled: bool,
}

impl ModelPolicy {
    pub fn with_shared_default_identity() -> Self {
        Self {
            shared_default_identity_enabled: true,
        }
    }
}

// ---------------------------------------------------------------------------
// ModelContext
// ---------------------------------------------------------------------------

/// Injection point for policy, token minting, and the external collaborators
/// (site-key computation and identity construction).
pub struct ModelContext {
    policy: ModelPolicy,
    site_key_resolver: Rc<dyn SiteKeyResolver>,
    identity_factory: Rc<dyn IdentityFactory>,
    next_isolation_group_id: Cell<u64>,
    next_communication_group_id: Cell<u64>,
    next_identity_id: Cell<u64>,
}

impl ModelContext {
    pub fn new(
        policy: ModelPolicy,
        site_key_resolver: Rc<dyn SiteKeyResolver>,
        identity_factory: Rc<dyn IdentityFactory>,
    ) -> Rc<Self> {
        Rc::new(Self {
            policy,
            site_key_resolver,
            identity_factory,
            next_isolation_group_id: Cell::new(0),
            next_communication_group_id: Cell::new(0),
            next_identity_id: Cell::new(0),
        })
    }

    pub fn policy(&self) -> &ModelPolicy {
        &self.policy
    }

    pub fn site_key_resolver(&self) -> &Rc<dyn SiteKeyResolver> {
        &self.site_key_resolver
    }

    pub fn identity_factory(&self) -> &Rc<dyn IdentityFactory> {
        &self.identity_factory
    }

    pub(crate) fn mint_isolation_group_token(&self) -> IsolationGroupToken {
        IsolationGroupToken(Self::bump(&self.next_isolation_group_id))
    }

    pub(crate) fn mint_communication_group_token(&self) -> CommunicationGroupToken {
        CommunicationGroupToken(Self::bump(&self.next_communication_group_id))
    }

    /// Identities are constructed outside the crate, so their token minting
    /// is public.
    pub fn mint_identity_token(&self) -> IdentityToken {
        IdentityToken(Self::bump(&self.next_identity_id))
    }

    fn bump(cell: &Cell<u64>) -> u64 {
        let value = cell.get();
        cell.set(value + 1);
        value
    }
}

impl fmt::Debug for ModelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelContext")
            .field("policy", &self.policy)
            .field("next_isolation_group_id", &self.next_isolation_group_id.get())
            .field(
                "next_communication_group_id",
                &self.next_communication_group_id.get(),
            )
            .field("next_identity_id", &self.next_identity_id.get())
            .finish()
    }
}
