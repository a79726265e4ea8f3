use crate::identity::{IdentityError, IdentityStore};
use rollcall_core::IdentityId;
use std::collections::BTreeMap;

/// Name shown for identities the registry does not know.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Read-through cache of display names for enrolled identities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityRegistry {
    names: BTreeMap<IdentityId, String>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole cache with the registered identities of `source`.
    ///
    /// On error the previous contents are kept.
    pub fn reload(&mut self, source: &dyn IdentityStore) -> Result<usize, IdentityError> {
        let names = source
            .registered()?
            .into_iter()
            .map(|identity| (identity.id, identity.name))
            .collect::<BTreeMap<_, _>>();
        self.names = names;
        tracing::debug!(identities = self.names.len(), "identity registry reloaded");
        Ok(self.names.len())
    }

    pub fn upsert(&mut self, id: IdentityId, name: impl Into<String>) {
        self.names.insert(id, name.into());
    }

    /// Display name for `id`, or [`UNKNOWN_NAME`].
    pub fn resolve(&self, id: IdentityId) -> &str {
        self.names.get(&id).map(String::as_str).unwrap_or(UNKNOWN_NAME)
    }

    pub fn contains(&self, id: IdentityId) -> bool {
        self.names.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (IdentityId, &str)> + '_ {
        self.names.iter().map(|(id, name)| (*id, name.as_str()))
    }
}
