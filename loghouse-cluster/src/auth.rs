//! Authorization for the record service.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::Deserialize;

use crate::error::{ClusterError, ClusterResult};

/// Object wildcard: the service has a single log, so every rule applies to
/// all of it.
pub const OBJECT_WILDCARD: &str = "*";
/// Action name for appends.
pub const PRODUCE_ACTION: &str = "produce";
/// Action name for reads.
pub const CONSUME_ACTION: &str = "consume";

/// Decides whether a subject may perform an action on an object.
pub trait Authorizer: Send + Sync + 'static {
    fn authorize(&self, subject: &str, object: &str, action: &str) -> ClusterResult<()>;
}

/// One rule of the JSON policy file.
#[derive(Debug, Clone, Deserialize)]
struct PolicyRule {
    subject: String,
    actions: Vec<String>,
}

/// Table-driven ACL: subject to allowed actions, with `*` as a subject
/// wildcard. Unlisted subjects are denied.
#[derive(Debug, Default)]
pub struct AclAuthorizer {
    rules: HashMap<String, HashSet<String>>,
    permit_all: bool,
}

impl AclAuthorizer {
    /// An authorizer with no rules: every request is denied.
    pub fn new() -> Self {
        Self::default()
    }

    /// An authorizer that allows every subject every action. Used when no
    /// policy file is configured.
    pub fn permit_all() -> Self {
        Self {
            rules: HashMap::new(),
            permit_all: true,
        }
    }

    /// Adds a rule allowing `subject` the given actions.
    pub fn allow(
        mut self,
        subject: impl Into<String>,
        actions: impl IntoIterator<Item = &'static str>,
    ) -> Self {
        self.rules
            .entry(subject.into())
            .or_default()
            .extend(actions.into_iter().map(str::to_string));
        self
    }

    /// Loads rules from a JSON policy file: `[{"subject": "client-cn",
    /// "actions": ["produce", "consume"]}, ...]`.
    pub fn from_policy_file(path: &Path) -> ClusterResult<Self> {
        let reader = BufReader::new(File::open(path)?);
        let rules: Vec<PolicyRule> = serde_json::from_reader(reader)
            .map_err(|e| ClusterError::Config(format!("acl policy: {e}")))?;
        let mut authorizer = Self::new();
        for rule in rules {
            authorizer.rules.entry(rule.subject).or_default().extend(rule.actions);
        }
        Ok(authorizer)
    }

    fn allowed(&self, subject: &str, action: &str) -> bool {
        if self.permit_all {
            return true;
        }
        for key in [subject, "*"] {
            if let Some(actions) = self.rules.get(key) {
                if actions.contains(action) {
                    return true;
                }
            }
        }
        false
    }
}

impl Authorizer for AclAuthorizer {
    fn authorize(&self, subject: &str, _object: &str, action: &str) -> ClusterResult<()> {
        if self.allowed(subject, action) {
            Ok(())
        } else {
            Err(ClusterError::PermissionDenied {
                subject: subject.to_string(),
                action: action.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_table_denies() {
        let acl = AclAuthorizer::new();
        assert!(acl.authorize("alice", OBJECT_WILDCARD, PRODUCE_ACTION).is_err());
        assert!(acl.authorize("", OBJECT_WILDCARD, CONSUME_ACTION).is_err());
    }

    #[test]
    fn test_rule_grants_listed_actions_only() {
        let acl = AclAuthorizer::new().allow("alice", [PRODUCE_ACTION]);
        assert!(acl.authorize("alice", OBJECT_WILDCARD, PRODUCE_ACTION).is_ok());
        assert!(acl.authorize("alice", OBJECT_WILDCARD, CONSUME_ACTION).is_err());
        assert!(acl.authorize("bob", OBJECT_WILDCARD, PRODUCE_ACTION).is_err());
    }

    #[test]
    fn test_subject_wildcard() {
        let acl = AclAuthorizer::new().allow("*", [CONSUME_ACTION]);
        assert!(acl.authorize("anyone", OBJECT_WILDCARD, CONSUME_ACTION).is_ok());
        assert!(acl.authorize("anyone", OBJECT_WILDCARD, PRODUCE_ACTION).is_err());
    }

    #[test]
    fn test_permit_all() {
        let acl = AclAuthorizer::permit_all();
        assert!(acl.authorize("", OBJECT_WILDCARD, PRODUCE_ACTION).is_ok());
    }

    #[test]
    fn test_policy_file() {
        let dir = tempfile::TempDir::new().expect("create temp dir");
        let path = dir.path().join("policy.json");
        let mut file = File::create(&path).expect("create policy");
        file.write_all(
            br#"[{"subject": "root", "actions": ["produce", "consume"]},
                 {"subject": "reader", "actions": ["consume"]}]"#,
        )
        .expect("write policy");

        let acl = AclAuthorizer::from_policy_file(&path).expect("load policy");
        assert!(acl.authorize("root", OBJECT_WILDCARD, PRODUCE_ACTION).is_ok());
        assert!(acl.authorize("reader", OBJECT_WILDCARD, CONSUME_ACTION).is_ok());
        assert!(acl.authorize("reader", OBJECT_WILDCARD, PRODUCE_ACTION).is_err());
        assert!(acl.authorize("", OBJECT_WILDCARD, CONSUME_ACTION).is_err());
    }
}
