//! Group-based command authorization.
//!
//! The policy is loaded once at startup and injected into the dispatcher as
//! an immutable object; re-provisioning requires an agent restart.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// What a group is allowed to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandRule {
    /// The administrator wildcard: every command is permitted and runs
    /// elevated. Spelled `"all"` in the policy file.
    Wildcard(WildcardMarker),
    /// Explicit allow-set of permitted executable names (the command's
    /// first token).
    Allow { allow: BTreeSet<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum WildcardMarker {
    #[serde(rename = "all")]
    All,
}

impl CommandRule {
    pub fn is_wildcard(&self) -> bool {
        matches!(self, CommandRule::Wildcard(_))
    }

    /// Check the command's executable name (its first whitespace token)
    /// against this rule.
    pub fn allows(&self, command: &str) -> bool {
        match self {
            CommandRule::Wildcard(_) => true,
            CommandRule::Allow { allow } => command
                .split_whitespace()
                .next()
                .map(|exe| allow.contains(exe))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationPolicy {
    pub groups: HashMap<String, CommandRule>,
}

impl AuthorizationPolicy {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Resolve the caller's groups against the policy: the first claimed
    /// group the policy knows wins, wildcard groups taking precedence so an
    /// administrator is never downgraded by an additional membership.
    pub fn resolve<'a>(
        &'a self,
        groups: &BTreeSet<String>,
    ) -> Option<(&'a str, &'a CommandRule)> {
        if let Some(found) = groups
            .iter()
            .filter_map(|g| self.groups.get_key_value(g))
            .find(|(_, rule)| rule.is_wildcard())
        {
            return Some((found.0.as_str(), found.1));
        }
        groups
            .iter()
            .find_map(|g| self.groups.get_key_value(g))
            .map(|(name, rule)| (name.as_str(), rule))
    }
}

impl Default for AuthorizationPolicy {
    fn default() -> Self {
        let mut groups = HashMap::new();
        groups.insert(
            "administrators".to_string(),
            CommandRule::Wildcard(WildcardMarker::All),
        );
        groups.insert(
            "developers".to_string(),
            CommandRule::Allow {
                allow: BTreeSet::from([
                    "ls".to_string(),
                    "whoami".to_string(),
                    "uptime".to_string(),
                ]),
            },
        );
        Self { groups }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_set_checks_first_token_only() {
        let policy = AuthorizationPolicy::default();
        let rule = policy.groups.get("developers").unwrap();
        assert!(rule.allows("ls -la /tmp"));
        assert!(rule.allows("whoami"));
        assert!(!rule.allows("rm -rf /"));
        assert!(!rule.allows(""));
    }

    #[test]
    fn wildcard_allows_everything() {
        let policy = AuthorizationPolicy::default();
        let rule = policy.groups.get("administrators").unwrap();
        assert!(rule.is_wildcard());
        assert!(rule.allows("rm -rf /"));
        assert!(rule.allows("systemctl restart kubelet"));
    }

    #[test]
    fn resolve_prefers_wildcard_membership() {
        let policy = AuthorizationPolicy::default();
        let groups = BTreeSet::from(["developers".to_string(), "administrators".to_string()]);
        let (name, rule) = policy.resolve(&groups).unwrap();
        assert_eq!(name, "administrators");
        assert!(rule.is_wildcard());
    }

    #[test]
    fn resolve_returns_none_for_unknown_groups() {
        let policy = AuthorizationPolicy::default();
        let groups = BTreeSet::from(["guests".to_string()]);
        assert!(policy.resolve(&groups).is_none());
    }

    #[test]
    fn policy_file_format_roundtrips() {
        let json = r#"{
            "groups": {
                "administrators": "all",
                "developers": { "allow": ["ls", "whoami", "uptime"] }
            }
        }"#;
        let policy: AuthorizationPolicy = serde_json::from_str(json).unwrap();
        assert!(policy.groups.get("administrators").unwrap().is_wildcard());
        assert!(policy.groups.get("developers").unwrap().allows("uptime now"));
    }
}
