//! Identity-based bypass policy.
//!
//! The allow-list is a capability lookup: a pure function from identity to
//! a yes/no answer, injected as configuration so policy stays decoupled from
//! the gating mechanism. Matching is case-insensitive — identities are
//! normalised to lowercase once at construction.

/// Static allow-list of identities exempt from violation detection and the
/// standard session duration.
#[derive(Debug, Clone, Default)]
pub struct BypassList {
    identities: Vec<String>,
}

impl BypassList {
    pub fn new(identities: impl IntoIterator<Item = String>) -> Self {
        let mut identities: Vec<String> = identities
            .into_iter()
            .map(|id| id.trim().to_lowercase())
            .filter(|id| !id.is_empty())
            .collect();
        identities.sort_unstable();
        identities.dedup();
        Self { identities }
    }

    /// Whether `identity` is exempt. Anonymous subjects are never bypassed.
    pub fn is_bypassed(&self, identity: Option<&str>) -> bool {
        match identity {
            Some(id) => {
                let id = id.trim().to_lowercase();
                self.identities.binary_search(&id).is_ok()
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_is_case_insensitive() {
        let list = BypassList::new(["Staff@Example.com".to_string()]);
        assert!(list.is_bypassed(Some("staff@example.com")));
        assert!(list.is_bypassed(Some("STAFF@EXAMPLE.COM")));
        assert!(!list.is_bypassed(Some("other@example.com")));
    }

    #[test]
    fn anonymous_is_never_bypassed() {
        let list = BypassList::new(["staff@example.com".to_string()]);
        assert!(!list.is_bypassed(None));
    }

    #[test]
    fn whitespace_and_duplicates_are_normalised() {
        let list = BypassList::new([
            "  a@example.com ".to_string(),
            "A@example.com".to_string(),
            String::new(),
        ]);
        assert!(list.is_bypassed(Some("a@example.com")));
    }
}
