//! Counter key generation and handling.

/// A key that uniquely identifies a window counter.
///
/// The key is composed of the policy name and the caller identifier, so each
/// policy owns an independent keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The policy this counter belongs to
    pub policy: String,
    /// The caller identifier (typically a source address)
    pub identifier: String,
}

impl CounterKey {
    /// Create a new counter key from a policy name and identifier.
    pub fn new(policy: &str, identifier: &str) -> Self {
        Self {
            policy: policy.to_string(),
            identifier: identifier.to_string(),
        }
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.policy, self.identifier)
    }
}
