//! # ThoughtRegistry — append-only, versioned thought store
//!
//! ## Responsibility
//! Store every version of every thought definition and resolve a name (and
//! optional version) to the exact immutable definition a run should use.
//!
//! ## Guarantees
//! - Append-only: a version, once registered, is never overwritten or removed
//! - Atomic: the new version and the "latest" pointer become visible together
//!   under a single write lock; readers never see a partial definition
//! - Serialized writers: concurrent registrations for the same name receive
//!   consecutive, distinct versions
//! - Trust-tracked: versions authored by executing thoughts start untrusted
//!   until [`ThoughtRegistry::trust`] is called
//!
//! ## NOT Responsible For
//! - Compatibility between versions (see: `self_modify`)
//! - Durable storage (see: `store`)

use crate::thought::{CapabilityPolicy, Origin, RawDefinition, ThoughtDefinition, ThoughtId};
use globset::{Glob, GlobSetBuilder};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Errors produced by the registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The definition is malformed or declares an unsupported capability.
    #[error("invalid definition for '{name}': {}", .issues.join("; "))]
    Validation {
        /// Thought name as submitted.
        name: String,
        /// Every problem found.
        issues: Vec<String>,
    },

    /// No such thought, or no such version of it.
    #[error("thought not found: {name}{}", .version.map(|v| format!("@v{v}")).unwrap_or_default())]
    NotFound {
        /// Requested name.
        name: String,
        /// Requested version, if pinned.
        version: Option<u32>,
    },

    /// A restored definition does not extend its version chain contiguously.
    #[error("out-of-order restore for {id}: chain is at v{current}")]
    OutOfOrder {
        /// The definition being restored.
        id: ThoughtId,
        /// Current latest version in the chain.
        current: u32,
    },

    /// A catalogue glob pattern is invalid.
    #[error("invalid catalogue pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Parser message.
        reason: String,
    },

    /// A registration guard vetoed the insert.
    #[error("registration of '{name}' rejected: {reason}")]
    Rejected {
        /// Thought name.
        name: String,
        /// Guard message.
        reason: String,
    },
}

/// Read-only access to versioned definitions.
///
/// The graph builder is generic over this so it can be exercised against
/// fixed definition sets.
pub trait DefinitionSource {
    /// Resolve `name` at `version`, or the latest version when `None`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the name or version is unknown.
    fn resolve_definition(
        &self,
        name: &str,
        version: Option<u32>,
    ) -> Result<Arc<ThoughtDefinition>, RegistryError>;
}

/// One catalogue row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogueEntry {
    /// Thought name.
    pub name: String,
    /// Latest version.
    pub latest_version: u32,
    /// Description of the latest version.
    pub description: String,
    /// Whether the latest version has external effects.
    pub side_effecting: bool,
}

#[derive(Default)]
struct RegistryInner {
    chains: HashMap<String, Vec<Arc<ThoughtDefinition>>>,
    untrusted: HashSet<ThoughtId>,
}

/// Append-only, versioned store of thought definitions.
///
/// # Thread Safety
///
/// Many readers, one writer at a time (`parking_lot::RwLock`). Resolved
/// definitions are `Arc`s, so holding one never blocks writers.
///
/// # Example
///
/// ```rust
/// use thought_orchestrator::registry::ThoughtRegistry;
/// use thought_orchestrator::thought::{CapabilityPolicy, Origin, RawDefinition};
///
/// let registry = ThoughtRegistry::new(CapabilityPolicy::default());
/// let v1 = registry.register(RawDefinition::new("reply", "reply"), Origin::Registered).unwrap();
/// let v2 = registry.register(RawDefinition::new("reply", "reply_v2"), Origin::Registered).unwrap();
/// assert_eq!((v1.version, v2.version), (1, 2));
/// assert_eq!(registry.resolve("reply", None).unwrap().body, "reply_v2");
/// assert_eq!(registry.resolve("reply", Some(1)).unwrap().body, "reply");
/// ```
pub struct ThoughtRegistry {
    policy: CapabilityPolicy,
    inner: RwLock<RegistryInner>,
}

impl std::fmt::Debug for ThoughtRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ThoughtRegistry")
            .field("thoughts", &inner.chains.len())
            .field("untrusted", &inner.untrusted.len())
            .finish()
    }
}

impl ThoughtRegistry {
    /// Create an empty registry enforcing `policy` on declared capabilities.
    pub fn new(policy: CapabilityPolicy) -> Self {
        Self {
            policy,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// The capability policy definitions are checked against.
    pub fn policy(&self) -> &CapabilityPolicy {
        &self.policy
    }

    /// Register a new version of a thought.
    ///
    /// # Returns
    ///
    /// - `Ok(id)` with the newly assigned version
    /// - `Err(RegistryError::Validation)` if the definition is malformed or
    ///   declares a capability outside the policy
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn register(&self, raw: RawDefinition, origin: Origin) -> Result<ThoughtId, RegistryError> {
        self.register_with(raw, origin, |_, _| Ok(()))
            .map(|def| def.id.clone())
    }

    /// Register a new version, running `guard` under the write lock first.
    ///
    /// `guard` receives the current chain head (if any) and the candidate
    /// definition with its assigned version. Returning `Err(reason)` aborts
    /// the registration with nothing published. This is how the
    /// self-modification pipeline re-checks compatibility and persists the
    /// candidate atomically with respect to other writers.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::Validation`] for malformed definitions
    /// - [`RegistryError::Rejected`] if `guard` refuses
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn register_with<G>(
        &self,
        raw: RawDefinition,
        origin: Origin,
        guard: G,
    ) -> Result<Arc<ThoughtDefinition>, RegistryError>
    where
        G: FnOnce(Option<&ThoughtDefinition>, &ThoughtDefinition) -> Result<(), String>,
    {
        let name = raw.name.clone();
        self.check_permitted(&raw)?;

        let mut inner = self.inner.write();
        let head = inner.chains.get(&name).and_then(|c| c.last()).cloned();
        let version = head.as_ref().map_or(1, |h| h.id.version + 1);

        let candidate = ThoughtDefinition::from_raw(raw, version, origin).map_err(|issues| {
            RegistryError::Validation {
                name: name.clone(),
                issues,
            }
        })?;

        guard(head.as_deref(), &candidate).map_err(|reason| RegistryError::Rejected {
            name: name.clone(),
            reason,
        })?;

        let candidate = Arc::new(candidate);
        if origin.starts_untrusted() {
            inner.untrusted.insert(candidate.id.clone());
        }
        inner
            .chains
            .entry(name)
            .or_default()
            .push(Arc::clone(&candidate));
        drop(inner);

        info!(
            thought = %candidate.id,
            origin = %origin,
            side_effecting = candidate.side_effecting,
            "registry: version registered"
        );
        Ok(candidate)
    }

    /// Reinsert a persisted definition at its recorded version.
    ///
    /// Definitions must be restored in version order per name. Restored
    /// versions are trusted: trust only lapses within the process that
    /// introduced a self-modified version.
    ///
    /// # Errors
    ///
    /// [`RegistryError::OutOfOrder`] if the version does not directly extend
    /// the chain.
    pub fn restore(&self, mut definition: ThoughtDefinition) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        let current = inner
            .chains
            .get(&definition.id.name)
            .and_then(|c| c.last())
            .map_or(0, |d| d.id.version);
        if definition.id.version != current + 1 {
            return Err(RegistryError::OutOfOrder {
                id: definition.id,
                current,
            });
        }
        definition.origin = Origin::Restored;
        debug!(thought = %definition.id, "registry: restored");
        inner
            .chains
            .entry(definition.id.name.clone())
            .or_default()
            .push(Arc::new(definition));
        Ok(())
    }

    /// Resolve `name` to the latest version, or to `version` when given.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if the name or version is unknown.
    pub fn resolve(
        &self,
        name: &str,
        version: Option<u32>,
    ) -> Result<Arc<ThoughtDefinition>, RegistryError> {
        let inner = self.inner.read();
        let not_found = || RegistryError::NotFound {
            name: name.to_string(),
            version,
        };
        let chain = inner.chains.get(name).ok_or_else(not_found)?;
        let found = match version {
            None => chain.last(),
            Some(v) => v
                .checked_sub(1)
                .and_then(|i| chain.get(usize::try_from(i).unwrap_or(usize::MAX))),
        };
        found.cloned().ok_or_else(not_found)
    }

    /// Every version of `name`, oldest first.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if the name is unknown.
    pub fn list_versions(&self, name: &str) -> Result<Vec<ThoughtId>, RegistryError> {
        let inner = self.inner.read();
        inner
            .chains
            .get(name)
            .map(|chain| chain.iter().map(|d| d.id.clone()).collect())
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
                version: None,
            })
    }

    /// Latest version number of `name`, if registered.
    pub fn latest_version(&self, name: &str) -> Option<u32> {
        self.inner
            .read()
            .chains
            .get(name)
            .and_then(|c| c.last())
            .map(|d| d.id.version)
    }

    /// Mark a self-modified version as trusted.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if the version does not exist.
    pub fn trust(&self, id: &ThoughtId) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        let exists = inner
            .chains
            .get(&id.name)
            .is_some_and(|c| c.iter().any(|d| d.id == *id));
        if !exists {
            return Err(RegistryError::NotFound {
                name: id.name.clone(),
                version: Some(id.version),
            });
        }
        if inner.untrusted.remove(id) {
            info!(thought = %id, "registry: version trusted");
        }
        Ok(())
    }

    /// Returns `true` unless `id` was self-modified in this process and not
    /// yet trusted.
    pub fn is_trusted(&self, id: &ThoughtId) -> bool {
        !self.inner.read().untrusted.contains(id)
    }

    /// Thoughts whose names match any glob in `patterns`, sorted by name.
    ///
    /// An empty pattern list matches everything.
    ///
    /// # Errors
    ///
    /// [`RegistryError::InvalidPattern`] for a malformed glob.
    pub fn catalogue<S: AsRef<str>>(
        &self,
        patterns: &[S],
    ) -> Result<Vec<CatalogueEntry>, RegistryError> {
        let mut builder = GlobSetBuilder::new();
        for p in patterns {
            let glob = Glob::new(p.as_ref()).map_err(|e| RegistryError::InvalidPattern {
                pattern: p.as_ref().to_string(),
                reason: e.to_string(),
            })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|e| RegistryError::InvalidPattern {
            pattern: patterns
                .iter()
                .map(|p| p.as_ref())
                .collect::<Vec<_>>()
                .join(","),
            reason: e.to_string(),
        })?;

        let inner = self.inner.read();
        let mut entries: Vec<CatalogueEntry> = inner
            .chains
            .iter()
            .filter(|(name, _)| patterns.is_empty() || set.is_match(name.as_str()))
            .filter_map(|(name, chain)| {
                chain.last().map(|latest| CatalogueEntry {
                    name: name.clone(),
                    latest_version: latest.id.version,
                    description: latest.description.clone(),
                    side_effecting: latest.side_effecting,
                })
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Number of distinct thought names.
    pub fn len(&self) -> usize {
        self.inner.read().chains.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read().chains.is_empty()
    }

    fn check_permitted(&self, raw: &RawDefinition) -> Result<(), RegistryError> {
        let mut issues = raw.issues();
        if let Some(caps) = raw.parsed_capabilities() {
            issues.extend(
                caps.iter()
                    .filter(|c| !self.policy.permits(c))
                    .map(|c| format!("capability '{c}' is not allowed by policy")),
            );
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Validation {
                name: raw.name.clone(),
                issues,
            })
        }
    }
}

impl DefinitionSource for ThoughtRegistry {
    fn resolve_definition(
        &self,
        name: &str,
        version: Option<u32>,
    ) -> Result<Arc<ThoughtDefinition>, RegistryError> {
        self.resolve(name, version)
    }
}
