//! Probe scope and target resolution.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::EngineError;
use crate::db::Store;

/// Which endpoints a run probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    All,
    Groups,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::All => "all",
            Scope::Groups => "groups",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Scope::All),
            "groups" => Ok(Scope::Groups),
            other => Err(EngineError::InvalidArgument(format!(
                "scope must be \"all\" or \"groups\", got {:?}",
                other
            ))),
        }
    }
}

/// Check a scope request before any state changes.
pub fn validate_scope(scope: Scope, group_ids: &[i64]) -> Result<(), EngineError> {
    if scope == Scope::Groups && group_ids.is_empty() {
        return Err(EngineError::InvalidArgument(
            "scope \"groups\" requires at least one group id".to_string(),
        ));
    }
    Ok(())
}

/// One endpoint to probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Target {
    pub endpoint_id: i64,
    pub address: String,
    pub name: String,
}

/// Source of the endpoints a round probes.
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn list_targets(&self, scope: Scope, group_ids: &[i64]) -> Result<Vec<Target>, EngineError>;
}

/// Resolves targets from the endpoint inventory.
pub struct StoreResolver {
    store: Arc<Store>,
}

impl StoreResolver {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TargetResolver for StoreResolver {
    async fn list_targets(&self, scope: Scope, group_ids: &[i64]) -> Result<Vec<Target>, EngineError> {
        validate_scope(scope, group_ids)?;

        let store = self.store.clone();
        let group_ids = group_ids.to_vec();
        let endpoints = tokio::task::spawn_blocking(move || match scope {
            Scope::All => store.list_endpoints(),
            Scope::Groups => store.list_endpoints_in_groups(&group_ids),
        })
        .await
        .map_err(|e| EngineError::Resolve(e.to_string()))??;

        Ok(endpoints
            .into_iter()
            .map(|e| Target {
                endpoint_id: e.id,
                address: e.address,
                name: e.name,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_scope_parse() {
        assert_eq!("all".parse::<Scope>().unwrap(), Scope::All);
        assert_eq!("groups".parse::<Scope>().unwrap(), Scope::Groups);
        assert!(matches!("some".parse::<Scope>(), Err(EngineError::InvalidArgument(_))));
        assert_eq!(serde_json::to_string(&Scope::Groups).unwrap(), "\"groups\"");
    }

    #[tokio::test]
    async fn test_store_resolver_scopes() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let edge = store.add_group("edge").unwrap();
        store.add_endpoint("a", "10.0.0.1", None).unwrap();
        let b = store.add_endpoint("b", "10.0.0.2", Some(edge.id)).unwrap();

        let resolver = StoreResolver::new(store);
        assert_eq!(resolver.list_targets(Scope::All, &[]).await.unwrap().len(), 2);

        let targets = resolver.list_targets(Scope::Groups, &[edge.id]).await.unwrap();
        assert_eq!(
            targets,
            vec![Target { endpoint_id: b.id, address: b.address, name: b.name }]
        );

        let err = resolver.list_targets(Scope::Groups, &[]).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }
}
