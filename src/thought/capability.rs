//! # Capabilities — named permissions a thought may request
//!
//! ## Responsibility
//! Model the permissions a thought declares (filesystem paths, shell access,
//! network, LLM calls) and the process-wide allow-list those declarations are
//! checked against.
//!
//! ## Guarantees
//! - Canonical string form: every capability round-trips through
//!   `Display`/`FromStr` (`fs.write:/tmp/out`, `shell.exec`, `network`, `llm.call`)
//! - Path capabilities are prefix-scoped: `fs.write:/tmp` covers `fs.write:/tmp/a`
//!   but never `fs.write:/tmpfoo` (component-wise comparison)
//!
//! ## NOT Responsible For
//! - Enforcing grants at execution time (see: `sandbox`)

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// A capability string could not be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unsupported capability '{0}'")]
pub struct CapabilityParseError(pub String);

/// A named permission a thought may request and a sandbox may grant.
///
/// # Panics
///
/// No methods on this type panic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Capability {
    /// Read files under the given path prefix.
    FsRead(PathBuf),
    /// Create, modify, or delete files under the given path prefix.
    FsWrite(PathBuf),
    /// Spawn shell commands.
    ShellExec,
    /// Open outbound network connections.
    Network,
    /// Call an external language model.
    LlmCall,
}

impl Capability {
    /// Short kind label, used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FsRead(_) => "fs.read",
            Self::FsWrite(_) => "fs.write",
            Self::ShellExec => "shell.exec",
            Self::Network => "network",
            Self::LlmCall => "llm.call",
        }
    }

    /// Returns `true` if holding `self` permits an action that needs `other`.
    ///
    /// Non-path capabilities cover only themselves. Path capabilities cover
    /// the same kind at the same path or any path beneath it.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn covers(&self, other: &Capability) -> bool {
        match (self, other) {
            (Self::FsRead(base), Self::FsRead(path)) | (Self::FsWrite(base), Self::FsWrite(path)) => {
                path_within(path, base)
            }
            (a, b) => a == b,
        }
    }
}

fn path_within(path: &Path, base: &Path) -> bool {
    // Paths are compared unnormalized, so `..` is never covered.
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return false;
    }
    path.starts_with(base)
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FsRead(p) => write!(f, "fs.read:{}", p.display()),
            Self::FsWrite(p) => write!(f, "fs.write:{}", p.display()),
            other => f.write_str(other.kind()),
        }
    }
}

impl FromStr for Capability {
    type Err = CapabilityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (kind, arg) = match trimmed.split_once(':') {
            Some((k, a)) => (k, Some(a)),
            None => (trimmed, None),
        };
        match (kind, arg) {
            ("fs.read", Some(p)) if !p.is_empty() => Ok(Self::FsRead(PathBuf::from(p))),
            ("fs.write", Some(p)) if !p.is_empty() => Ok(Self::FsWrite(PathBuf::from(p))),
            ("shell.exec", None) => Ok(Self::ShellExec),
            ("network", None) => Ok(Self::Network),
            ("llm.call", None) => Ok(Self::LlmCall),
            _ => Err(CapabilityParseError(s.to_string())),
        }
    }
}

impl TryFrom<String> for Capability {
    type Error = CapabilityParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Capability> for String {
    fn from(value: Capability) -> Self {
        value.to_string()
    }
}

/// Parse a list of capability strings, collecting every unsupported entry.
///
/// # Returns
///
/// - `Ok(set)` if every entry parses
/// - `Err(errors)` with one error per unsupported entry
///
/// # Panics
///
/// This function never panics.
pub fn parse_capabilities<S: AsRef<str>>(
    raw: &[S],
) -> Result<BTreeSet<Capability>, Vec<CapabilityParseError>> {
    let mut parsed = BTreeSet::new();
    let mut errors = Vec::new();
    for entry in raw {
        match entry.as_ref().parse::<Capability>() {
            Ok(cap) => {
                parsed.insert(cap);
            }
            Err(e) => errors.push(e),
        }
    }
    if errors.is_empty() {
        Ok(parsed)
    } else {
        Err(errors)
    }
}

/// Process-wide capability allow-list.
///
/// Immutable once built; the engine shares it by value.
///
/// # Example
///
/// ```rust
/// use thought_orchestrator::thought::capability::{Capability, CapabilityPolicy};
/// let policy = CapabilityPolicy::from_strings(&["fs.write:/tmp", "llm.call"]).unwrap();
/// assert!(policy.permits(&"fs.write:/tmp/out.txt".parse().unwrap()));
/// assert!(!policy.permits(&Capability::ShellExec));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityPolicy {
    allowed: BTreeSet<Capability>,
}

impl CapabilityPolicy {
    /// Build a policy from already-parsed capabilities.
    pub fn new(allowed: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }

    /// Build a policy from capability strings.
    ///
    /// # Errors
    ///
    /// Returns every entry that failed to parse.
    pub fn from_strings<S: AsRef<str>>(raw: &[S]) -> Result<Self, Vec<CapabilityParseError>> {
        parse_capabilities(raw).map(|allowed| Self { allowed })
    }

    /// Returns `true` if some allowed capability covers `cap`.
    pub fn permits(&self, cap: &Capability) -> bool {
        self.allowed.iter().any(|a| a.covers(cap))
    }

    /// The subset of `requested` this policy permits.
    pub fn narrow<'a>(
        &self,
        requested: impl IntoIterator<Item = &'a Capability>,
    ) -> BTreeSet<Capability> {
        requested
            .into_iter()
            .filter(|c| self.permits(c))
            .cloned()
            .collect()
    }

    /// Iterate the allowed capabilities.
    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.allowed.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_kinds() {
        assert_eq!(
            "fs.read:/data".parse::<Capability>(),
            Ok(Capability::FsRead(PathBuf::from("/data")))
        );
        assert_eq!(
            "fs.write:/tmp".parse::<Capability>(),
            Ok(Capability::FsWrite(PathBuf::from("/tmp")))
        );
        assert_eq!("shell.exec".parse::<Capability>(), Ok(Capability::ShellExec));
        assert_eq!("network".parse::<Capability>(), Ok(Capability::Network));
        assert_eq!("llm.call".parse::<Capability>(), Ok(Capability::LlmCall));
    }

    #[test]
    fn test_parse_rejects_unknown_and_malformed() {
        assert!("gui.click".parse::<Capability>().is_err());
        assert!("fs.write".parse::<Capability>().is_err());
        assert!("fs.write:".parse::<Capability>().is_err());
        assert!("network:example.com".parse::<Capability>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for s in ["fs.read:/a/b", "fs.write:/tmp", "shell.exec", "network", "llm.call"] {
            let cap: Capability = s.parse().expect("valid capability");
            assert_eq!(cap.to_string(), s);
        }
    }

    #[test]
    fn test_path_prefix_covers_children_only() {
        let base: Capability = "fs.write:/tmp/work".parse().expect("valid");
        assert!(base.covers(&"fs.write:/tmp/work/out.txt".parse().expect("valid")));
        assert!(base.covers(&"fs.write:/tmp/work".parse().expect("valid")));
        assert!(!base.covers(&"fs.write:/tmp/workspace".parse().expect("valid")));
        assert!(!base.covers(&"fs.read:/tmp/work/x".parse().expect("valid")));
    }

    #[test]
    fn test_parent_traversal_never_covered() {
        let base: Capability = "fs.write:/tmp".parse().expect("valid");
        assert!(!base.covers(&"fs.write:/tmp/../etc/passwd".parse().expect("valid")));
    }

    #[test]
    fn test_parse_capabilities_collects_every_error() {
        let errs = parse_capabilities(&["network", "bogus", "also.bogus"]).unwrap_err();
        assert_eq!(errs.len(), 2);
    }

    #[test]
    fn test_policy_narrow_drops_unpermitted() {
        let policy = CapabilityPolicy::from_strings(&["network"]).expect("valid");
        let requested = [Capability::Network, Capability::ShellExec];
        let narrowed = policy.narrow(requested.iter());
        assert_eq!(narrowed.len(), 1);
        assert!(narrowed.contains(&Capability::Network));
    }

    #[test]
    fn test_serde_uses_string_form() {
        let json = serde_json::to_string(&Capability::LlmCall).expect("serialize");
        assert_eq!(json, "\"llm.call\"");
        let back: Capability = serde_json::from_str("\"fs.read:/x\"").expect("deserialize");
        assert_eq!(back, Capability::FsRead(PathBuf::from("/x")));
        assert!(serde_json::from_str::<Capability>("\"gui\"").is_err());
    }
}
