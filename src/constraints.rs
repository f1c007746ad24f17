//! Pure attribute/limit constraint predicates, plus a host-attribute loader
//! abstraction with a per-scheduling-decision cache.
//!
//! Attribute fetching is externally supplied (hosts are owned by the
//! resource-offer framework, not this crate) and must be consistent within
//! one scheduling decision, so [`CachingAttributeLoader`] memoizes lookups
//! for the lifetime it's held — callers construct a fresh one per decision.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::model::Attribute;

/// Supplies the attributes of a host on demand.
#[async_trait]
pub trait AttributeLoader: Send + Sync {
    async fn load(&self, host: &str) -> Result<Vec<Attribute>>;
}

/// Wraps an [`AttributeLoader`] with a cache keyed by host, valid for the
/// lifetime of the wrapper. Construct one per scheduling decision /
/// transaction — do not share across decisions, or stale attributes could
/// leak between them.
pub struct CachingAttributeLoader<L> {
    inner: L,
    cache: Mutex<HashMap<String, Arc<Vec<Attribute>>>>,
}

impl<L: AttributeLoader> CachingAttributeLoader<L> {
    pub fn new(inner: L) -> Self {
        Self { inner, cache: Mutex::new(HashMap::new()) }
    }

    pub async fn load(&self, host: &str) -> Result<Arc<Vec<Attribute>>> {
        let mut cache = self.cache.lock().await;
        if let Some(attrs) = cache.get(host) {
            return Ok(Arc::clone(attrs));
        }
        let attrs = Arc::new(self.inner.load(host).await?);
        cache.insert(host.to_string(), Arc::clone(&attrs));
        Ok(attrs)
    }
}

/// Value constraint: matches iff `negated XOR (some declared value is present
/// among the host's attribute values under `attribute_name`)`.
pub fn value_constraint_matches(
    host_attrs: &[Attribute],
    attribute_name: &str,
    values: &BTreeSet<String>,
    negated: bool,
) -> bool {
    let present = host_attrs
        .iter()
        .filter(|attr| attr.name == attribute_name)
        .any(|attr| values.iter().any(|v| attr.values.contains(v)));
    negated ^ present
}

/// Limit constraint: matches iff the number of active same-job tasks whose
/// host shares any `attribute_name` value with the candidate host is
/// strictly less than `limit`.
pub fn limit_constraint_matches(
    candidate_attrs: &[Attribute],
    attribute_name: &str,
    limit: u32,
    active_task_host_attrs: &[Vec<Attribute>],
) -> bool {
    let candidate_values: BTreeSet<&str> = candidate_attrs
        .iter()
        .filter(|attr| attr.name == attribute_name)
        .flat_map(|attr| attr.values.iter().map(String::as_str))
        .collect();
    let sharing_count = active_task_host_attrs
        .iter()
        .filter(|host_attrs| {
            host_attrs
                .iter()
                .filter(|attr| attr.name == attribute_name)
                .any(|attr| attr.values.iter().any(|v| candidate_values.contains(v.as_str())))
        })
        .count() as u32;
    sharing_count < limit
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn attr(name: &str, values: &[&str]) -> Attribute {
        Attribute { name: name.to_string(), values: values.iter().map(|v| v.to_string()).collect() }
    }

    fn values(vs: &[&str]) -> BTreeSet<String> {
        vs.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn empty_values_never_matches_unless_negated() {
        let attrs = vec![attr("rack", &["a"])];
        assert!(!value_constraint_matches(&attrs, "rack", &values(&[]), false));
        assert!(value_constraint_matches(&attrs, "rack", &values(&[]), true));
    }

    #[test]
    fn value_constraint_matches_on_shared_value() {
        let attrs = vec![attr("rack", &["a", "b"])];
        assert!(value_constraint_matches(&attrs, "rack", &values(&["b"]), false));
        assert!(!value_constraint_matches(&attrs, "rack", &values(&["c"]), false));
        assert!(!value_constraint_matches(&attrs, "rack", &values(&["b"]), true));
    }

    #[test]
    fn limit_constraint_respects_rack_isolation() {
        let h1 = vec![attr("rack", &["a"])];
        let h2 = vec![attr("rack", &["b"])];
        let active = vec![h1.clone()];

        assert!(!limit_constraint_matches(&h1, "rack", 1, &active));
        assert!(limit_constraint_matches(&h2, "rack", 1, &active));
    }

    struct StaticLoader(Vec<Attribute>);

    #[async_trait::async_trait]
    impl AttributeLoader for StaticLoader {
        async fn load(&self, _host: &str) -> Result<Vec<Attribute>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn caching_loader_returns_consistent_results() {
        let loader = CachingAttributeLoader::new(StaticLoader(vec![attr("rack", &["a"])]));
        let first = loader.load("h1").await.expect("load");
        let second = loader.load("h1").await.expect("load cached");
        assert_eq!(first, second);
    }
}
