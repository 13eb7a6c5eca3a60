use anyhow::Context;
use std::collections::HashMap;
use std::sync::Arc;

/// Policy values with one of these prefixes mark a domain as
/// enforced-TLS-capable. Any suffix is permitted (e.g. `verify-cert`,
/// `secure-log`); the match is case-sensitive.
const CAPABLE_PREFIXES: [&str; 2] = ["verify", "secure"];

/// Immutable snapshot of the domain -> policy map, loaded once at startup
/// and shared read-only across all transactions.
#[derive(Debug)]
pub struct PolicyStore {
    entries: HashMap<String, String>,
}

impl PolicyStore {
    /// Load the policy map from a flat file: one `domain policy` entry per
    /// line, `#` comments and blank lines ignored. Keys and values exported
    /// from C-string databases may carry trailing NUL bytes; those are
    /// trimmed.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read policy store '{path}'"))?;

        let mut entries = HashMap::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            match (parts.next(), parts.next()) {
                (Some(domain), Some(policy)) => {
                    let domain = domain.trim_end_matches('\0').to_string();
                    let policy = policy.trim().trim_end_matches('\0').to_string();
                    log::debug!("policy entry: {domain} -> {policy}");
                    entries.insert(domain, policy);
                }
                _ => {
                    log::warn!("skipping malformed line {} in '{path}'", lineno + 1);
                }
            }
        }

        log::info!("loaded {} policy entries from '{path}'", entries.len());
        Ok(PolicyStore { entries })
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        PolicyStore {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, domain: &str) -> Option<&str> {
        self.entries.get(domain).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Decides enforced-TLS feasibility for a destination domain. Pure reads
/// against the immutable store; safe to share across transactions.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    store: Arc<PolicyStore>,
}

impl PolicyEngine {
    pub fn new(store: Arc<PolicyStore>) -> Self {
        PolicyEngine { store }
    }

    /// True iff the domain has a stored policy whose value starts with
    /// `verify` or `secure`. Absent domains are never capable.
    pub fn enforced_capable(&self, domain: &str) -> bool {
        match self.store.get(domain) {
            Some(policy) => CAPABLE_PREFIXES.iter().any(|p| policy.starts_with(p)),
            None => false,
        }
    }

    /// Number of store entries that qualify as enforced-TLS-capable.
    pub fn capable_count(&self) -> usize {
        self.store
            .iter()
            .filter(|(_, policy)| CAPABLE_PREFIXES.iter().any(|p| policy.starts_with(p)))
            .count()
    }
}
