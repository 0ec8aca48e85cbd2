//! Access policies and enforcement.
//!
//! A policy authorizes a set of actions on a prefix-tagged resource glob
//! (`processid:…`, `api:…`, `fs:…`, `rtmp:…`, `srt:…`) within one domain.
//! Policies are keyed per subject; the anonymous principal `$anon` may
//! carry policies without having an identity record.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::ANONYMOUS;

/// One access policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Subject the policy belongs to.
    pub name: String,
    /// Domain the policy applies in.
    #[serde(default)]
    pub domain: String,
    /// Prefix-tagged resource glob.
    pub resource: String,
    /// Authorized actions.
    pub actions: Vec<String>,
}

impl Policy {
    /// Parses a `|`-separated action set, e.g. `"read|write"` or
    /// `"CREATE|GET|DELETE"`.
    #[must_use]
    pub fn parse_actions(actions: &str) -> Vec<String> {
        actions.split('|').filter(|a| !a.is_empty()).map(str::to_string).collect()
    }
}

/// Matches a glob pattern where `*` spans any sequence and `?` a single
/// character.
fn glob_match(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();

    let (mut p, mut v) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while v < value.len() {
        if p < pattern.len() && (pattern[p] == value[v] || pattern[p] == '?') {
            p += 1;
            v += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, v));
            p += 1;
        } else if let Some((star_p, star_v)) = star {
            // backtrack: let the last * swallow one more character
            p = star_p + 1;
            v = star_v + 1;
            star = Some((star_p, star_v + 1));
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }

    p == pattern.len()
}

/// In-memory policy index answering authorization queries.
pub struct Enforcer {
    policies: RwLock<HashMap<String, Vec<Policy>>>,
}

impl Default for Enforcer {
    fn default() -> Self {
        Self::new()
    }
}

impl Enforcer {
    /// Creates an empty enforcer.
    #[must_use]
    pub fn new() -> Self {
        Self { policies: RwLock::new(HashMap::new()) }
    }

    /// Replaces the complete policy set.
    pub fn reload(&self, policies: Vec<Policy>) {
        let mut grouped: HashMap<String, Vec<Policy>> = HashMap::new();
        for policy in policies {
            grouped.entry(policy.name.clone()).or_default().push(policy);
        }
        *self.policies.write() = grouped;
    }

    /// Returns the policies of one subject.
    #[must_use]
    pub fn policies_of(&self, name: &str) -> Vec<Policy> {
        self.policies.read().get(name).cloned().unwrap_or_default()
    }

    /// Decides whether `name` may perform `action` on `resource` in
    /// `domain`.
    ///
    /// The subject's own policies and the anonymous policies are
    /// candidates; the first one matching domain, resource glob and
    /// action set grants access.
    #[must_use]
    pub fn enforce(&self, name: &str, domain: &str, resource: &str, action: &str) -> bool {
        let policies = self.policies.read();

        let candidates = policies
            .get(name)
            .into_iter()
            .chain(policies.get(ANONYMOUS))
            .flatten();

        for policy in candidates {
            if policy.domain != domain {
                continue;
            }
            if !glob_match(&policy.resource, resource) {
                continue;
            }
            if policy.actions.iter().any(|a| a == action) {
                return true;
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(name: &str, domain: &str, resource: &str, actions: &str) -> Policy {
        Policy {
            name: name.to_string(),
            domain: domain.to_string(),
            resource: resource.to_string(),
            actions: Policy::parse_actions(actions),
        }
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("processid:p1", "processid:p1"));
        assert!(glob_match("processid:*", "processid:anything"));
        assert!(glob_match("fs:/recordings/*.m3u8", "fs:/recordings/cam1.m3u8"));
        assert!(glob_match("api:/v3/*", "api:/v3/process/p1"));
        assert!(glob_match("srt:?", "srt:x"));

        assert!(!glob_match("processid:p1", "processid:p2"));
        assert!(!glob_match("fs:/recordings/*.m3u8", "fs:/other/cam1.m3u8"));
        assert!(!glob_match("srt:?", "srt:xy"));
    }

    #[test]
    fn test_parse_actions() {
        assert_eq!(Policy::parse_actions("read|write"), vec!["read", "write"]);
        assert_eq!(Policy::parse_actions("CREATE|GET|PUT|DELETE").len(), 4);
        assert!(Policy::parse_actions("").is_empty());
    }

    #[test]
    fn test_enforce_basic() {
        let enforcer = Enforcer::new();
        enforcer.reload(vec![policy("alice", "", "processid:p1", "read")]);

        assert!(enforcer.enforce("alice", "", "processid:p1", "read"));
        assert!(!enforcer.enforce("alice", "", "processid:p2", "read"));
        assert!(!enforcer.enforce("alice", "", "processid:p1", "write"));
        assert!(!enforcer.enforce("bob", "", "processid:p1", "read"));
    }

    #[test]
    fn test_enforce_domain_must_match() {
        let enforcer = Enforcer::new();
        enforcer.reload(vec![policy("alice", "prod", "processid:*", "read|write")]);

        assert!(enforcer.enforce("alice", "prod", "processid:p1", "write"));
        assert!(!enforcer.enforce("alice", "", "processid:p1", "write"));
        assert!(!enforcer.enforce("alice", "dev", "processid:p1", "write"));
    }

    #[test]
    fn test_enforce_anonymous_fallback() {
        let enforcer = Enforcer::new();
        enforcer.reload(vec![policy(ANONYMOUS, "", "rtmp:/live/*", "play")]);

        // any subject inherits the anonymous policies
        assert!(enforcer.enforce("whoever", "", "rtmp:/live/stream", "play"));
        assert!(!enforcer.enforce("whoever", "", "rtmp:/private/stream", "play"));
    }

    #[test]
    fn test_reload_replaces() {
        let enforcer = Enforcer::new();
        enforcer.reload(vec![policy("alice", "", "processid:p1", "read")]);
        enforcer.reload(vec![policy("alice", "", "processid:p2", "read")]);

        assert!(!enforcer.enforce("alice", "", "processid:p1", "read"));
        assert!(enforcer.enforce("alice", "", "processid:p2", "read"));
        assert_eq!(enforcer.policies_of("alice").len(), 1);
    }
}
