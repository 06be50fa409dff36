//! Action catalogue.
//!
//! Read actions map to an optional cache policy; mutating actions map to the
//! cache prefixes they make stale. Both tables are closed enums with an
//! `Other` escape hatch, so unknown actions still pass straight through to the
//! API uncached.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::cache::Backend;
use crate::config::PolicyOverride;

/// Request parameters or form body: a flat JSON object.
pub type Params = Map<String, Value>;

const FIVE_MINUTES: Duration = Duration::from_secs(5 * 60);
const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// TTL applied to configured actions that do not name one.
pub const DEFAULT_TTL: Duration = FIVE_MINUTES;
/// Backend applied to configured actions that do not name one.
pub const DEFAULT_BACKEND: Backend = Backend::Global;

/// How long, and where, a read action's result is cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub backend: Backend,
}

// ============================================================================
// Reads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Query {
    CurrentOrders,
    Products,
    OrderSessions,
    Stores,
    Other(String),
}

impl Query {
    /// Reads that carry a built-in cache policy.
    pub const CACHED: [Query; 4] = [
        Query::CurrentOrders,
        Query::Products,
        Query::OrderSessions,
        Query::Stores,
    ];

    pub fn name(&self) -> &str {
        match self {
            Self::CurrentOrders => "getCurrentOrders",
            Self::Products => "getProducts",
            Self::OrderSessions => "getOrderSessions",
            Self::Stores => "getStores",
            Self::Other(name) => name,
        }
    }

    fn default_policy(&self) -> Option<CachePolicy> {
        let (ttl, backend) = match self {
            Self::CurrentOrders => (FIVE_MINUTES, Backend::Session),
            Self::Products => (ONE_DAY, Backend::Global),
            Self::OrderSessions => (FIVE_MINUTES, Backend::Session),
            Self::Stores => (ONE_DAY, Backend::Memory),
            Self::Other(_) => return None,
        };
        Some(CachePolicy { ttl, backend })
    }
}

impl From<&str> for Query {
    fn from(name: &str) -> Self {
        match name {
            "getCurrentOrders" => Self::CurrentOrders,
            "getProducts" => Self::Products,
            "getOrderSessions" => Self::OrderSessions,
            "getStores" => Self::Stores,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Mutations
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Mutation {
    UploadData,
    ToggleActive,
    OpenOrder,
    CloseOrder,
    SubmitOrder,
    Other(String),
}

/// A cache prefix to purge after a successful mutation, with its backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    pub prefix: &'static str,
    pub backend: Backend,
}

const STORES: Invalidation = Invalidation {
    prefix: "getStores_",
    backend: Backend::Memory,
};
const PRODUCTS: Invalidation = Invalidation {
    prefix: "getProducts_",
    backend: Backend::Global,
};
const CURRENT_ORDERS: Invalidation = Invalidation {
    prefix: "getCurrentOrders",
    backend: Backend::Session,
};
const ORDER_SESSIONS: Invalidation = Invalidation {
    prefix: "getOrderSessions_",
    backend: Backend::Session,
};

impl Mutation {
    pub fn name(&self) -> &str {
        match self {
            Self::UploadData => "uploadData",
            Self::ToggleActive => "toggleActive",
            Self::OpenOrder => "openOrder",
            Self::CloseOrder => "closeOrder",
            Self::SubmitOrder => "submitOrder",
            Self::Other(name) => name,
        }
    }

    /// Cache prefixes made stale by this mutation with the given body.
    pub fn invalidations(&self, body: &Params) -> Vec<Invalidation> {
        match self {
            Self::UploadData => vec![stores_or_products(body, "dataType")],
            Self::ToggleActive => vec![stores_or_products(body, "type")],
            Self::OpenOrder | Self::CloseOrder => vec![CURRENT_ORDERS],
            Self::SubmitOrder => vec![ORDER_SESSIONS],
            Self::Other(_) => Vec::new(),
        }
    }
}

fn stores_or_products(body: &Params, field: &str) -> Invalidation {
    match body.get(field).and_then(Value::as_str) {
        Some("store") => STORES,
        _ => PRODUCTS,
    }
}

impl From<&str> for Mutation {
    fn from(name: &str) -> Self {
        match name {
            "uploadData" => Self::UploadData,
            "toggleActive" => Self::ToggleActive,
            "openOrder" => Self::OpenOrder,
            "closeOrder" => Self::CloseOrder,
            "submitOrder" => Self::SubmitOrder,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Policy table
// ============================================================================

/// Read-action cache policies, fixed once built.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: HashMap<Query, CachePolicy>,
}

impl PolicyTable {
    /// The built-in policies.
    pub fn builtin() -> Self {
        let policies = Query::CACHED
            .into_iter()
            .filter_map(|query| query.default_policy().map(|policy| (query, policy)))
            .collect();
        Self { policies }
    }

    /// Built-in policies with per-action overrides applied.
    ///
    /// An override for an action without a built-in policy makes it cacheable,
    /// filling unspecified fields with [`DEFAULT_TTL`] and [`DEFAULT_BACKEND`].
    pub fn with_overrides(overrides: &BTreeMap<String, PolicyOverride>) -> Self {
        let mut table = Self::builtin();
        for (action, change) in overrides {
            let query = Query::from(action.as_str());
            let base = table.policies.get(&query).copied().unwrap_or(CachePolicy {
                ttl: DEFAULT_TTL,
                backend: DEFAULT_BACKEND,
            });
            let policy = CachePolicy {
                ttl: change.ttl.unwrap_or(base.ttl),
                backend: change.backend.unwrap_or(base.backend),
            };
            table.policies.insert(query, policy);
        }
        table
    }

    /// Policy for `query`, if it is cached.
    ///
    /// Configured actions outside the catalogue may arrive lowercased from the
    /// environment, so those names also match case-insensitively.
    pub fn policy_for(&self, query: &Query) -> Option<CachePolicy> {
        if let Some(policy) = self.policies.get(query) {
            return Some(*policy);
        }
        let Query::Other(name) = query else {
            return None;
        };
        self.policies.iter().find_map(|(known, policy)| match known {
            Query::Other(known) if known.eq_ignore_ascii_case(name) => Some(*policy),
            _ => None,
        })
    }

    /// Policies ordered by action name.
    pub fn entries(&self) -> Vec<(&Query, CachePolicy)> {
        let mut entries: Vec<_> = self
            .policies
            .iter()
            .map(|(query, policy)| (query, *policy))
            .collect();
        entries.sort_by(|a, b| a.0.name().cmp(b.0.name()));
        entries
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn body(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => panic!("body must be an object"),
        }
    }

    #[test]
    fn builtin_policies_match_catalogue() {
        let table = PolicyTable::builtin();
        assert_eq!(
            table.policy_for(&Query::CurrentOrders),
            Some(CachePolicy {
                ttl: Duration::from_secs(300),
                backend: Backend::Session
            })
        );
        assert_eq!(
            table.policy_for(&Query::Products).map(|p| p.backend),
            Some(Backend::Global)
        );
        assert_eq!(
            table.policy_for(&Query::Stores).map(|p| p.ttl),
            Some(Duration::from_secs(86_400))
        );
        assert_eq!(table.policy_for(&Query::Other("ping".into())), None);
    }

    #[test]
    fn names_round_trip() {
        for name in ["getCurrentOrders", "getProducts", "getOrderSessions", "getStores", "ping"] {
            assert_eq!(Query::from(name).name(), name);
        }
        for name in ["uploadData", "toggleActive", "openOrder", "closeOrder", "submitOrder", "x"] {
            assert_eq!(Mutation::from(name).name(), name);
        }
    }

    #[test]
    fn upload_and_toggle_route_by_body() {
        let stores = body(json!({"dataType": "store"}));
        assert_eq!(Mutation::UploadData.invalidations(&stores), vec![STORES]);
        assert_eq!(Mutation::UploadData.invalidations(&Params::new()), vec![PRODUCTS]);

        let toggle_store = body(json!({"type": "store"}));
        let toggle_product = body(json!({"type": "product"}));
        assert_eq!(Mutation::ToggleActive.invalidations(&toggle_store), vec![STORES]);
        assert_eq!(Mutation::ToggleActive.invalidations(&toggle_product), vec![PRODUCTS]);
    }

    #[test]
    fn order_mutations_target_session_backend() {
        for mutation in [Mutation::OpenOrder, Mutation::CloseOrder] {
            let rules = mutation.invalidations(&Params::new());
            assert_eq!(rules.len(), 1);
            assert_eq!(rules[0].prefix, "getCurrentOrders");
            assert_eq!(rules[0].backend, Backend::Session);
        }
        assert_eq!(Mutation::SubmitOrder.invalidations(&Params::new()), vec![ORDER_SESSIONS]);
        assert!(Mutation::Other("noop".into()).invalidations(&Params::new()).is_empty());
    }

    #[test]
    fn overrides_adjust_and_extend_policies() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "getProducts".to_string(),
            PolicyOverride {
                ttl: Some(Duration::from_secs(60)),
                backend: None,
            },
        );
        overrides.insert(
            "getCategories".to_string(),
            PolicyOverride {
                ttl: None,
                backend: Some(Backend::Memory),
            },
        );

        let table = PolicyTable::with_overrides(&overrides);
        assert_eq!(
            table.policy_for(&Query::Products),
            Some(CachePolicy {
                ttl: Duration::from_secs(60),
                backend: Backend::Global
            })
        );
        assert_eq!(
            table.policy_for(&Query::from("getCategories")),
            Some(CachePolicy {
                ttl: DEFAULT_TTL,
                backend: Backend::Memory
            })
        );
    }

    #[test]
    fn lowercased_custom_override_matches_requested_action() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "getcategories".to_string(),
            PolicyOverride {
                ttl: Some(Duration::from_secs(90)),
                backend: Some(Backend::Session),
            },
        );

        let table = PolicyTable::with_overrides(&overrides);
        assert_eq!(
            table.policy_for(&Query::from("getCategories")),
            Some(CachePolicy {
                ttl: Duration::from_secs(90),
                backend: Backend::Session
            })
        );
        assert_eq!(table.policy_for(&Query::from("getCategory")), None);
    }

    #[test]
    fn entries_are_sorted_by_name() {
        let names: Vec<_> = PolicyTable::builtin()
            .entries()
            .into_iter()
            .map(|(query, _)| query.name().to_string())
            .collect();
        assert_eq!(
            names,
            ["getCurrentOrders", "getOrderSessions", "getProducts", "getStores"]
        );
    }
}
