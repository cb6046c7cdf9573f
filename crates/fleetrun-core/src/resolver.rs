//! In-process target resolver.
//!
//! Production deployments put a credential service behind `TargetResolver`;
//! this implementation backs tests and single-process embeddings with a
//! static ownership map.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::error::ResolveError;
use crate::model::HostTarget;
use crate::traits::{TargetResolver, TargetSelector};

/// Static resolver built up-front and immutable afterwards.
#[derive(Debug, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, HostTarget>,
    groups: HashMap<String, Vec<String>>,
    /// caller id -> host ids that caller owns
    owners: HashMap<String, HashSet<String>>,
}

impl StaticResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host owned by `owner`.
    #[must_use]
    pub fn host(mut self, target: HostTarget, owner: &str) -> Self {
        self.owners
            .entry(owner.to_string())
            .or_default()
            .insert(target.host_id.clone());
        self.hosts.insert(target.host_id.clone(), target);
        self
    }

    /// Register a named group of host ids, preserving order.
    #[must_use]
    pub fn group<I>(mut self, name: &str, host_ids: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.groups.insert(
            name.to_string(),
            host_ids.into_iter().map(Into::into).collect(),
        );
        self
    }

    fn lookup(&self, host_id: &str, caller_id: &str) -> Result<HostTarget, ResolveError> {
        let owned = self
            .owners
            .get(caller_id)
            .is_some_and(|ids| ids.contains(host_id));
        if !owned {
            return Err(ResolveError::Unauthorized(host_id.to_string()));
        }
        self.hosts
            .get(host_id)
            .cloned()
            .ok_or_else(|| ResolveError::Internal(format!("host registered but missing: {host_id}")))
    }
}

#[async_trait]
impl TargetResolver for StaticResolver {
    async fn resolve(
        &self,
        selector: &TargetSelector,
        caller_id: &str,
    ) -> Result<Vec<HostTarget>, ResolveError> {
        let host_ids: Vec<String> = match selector {
            TargetSelector::Hosts(ids) => ids.clone(),
            TargetSelector::Group(name) => self
                .groups
                .get(name)
                .cloned()
                .ok_or_else(|| ResolveError::Unauthorized(name.clone()))?,
        };

        host_ids
            .iter()
            .map(|id| self.lookup(id, caller_id))
            .collect()
    }
}
