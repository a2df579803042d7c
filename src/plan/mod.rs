//! PlanResolver (component D) — named policy templates layered beneath
//! per-key overrides.
//!
//! The plan table is grounded on the teacher's `RoutingState` /
//! `ArcSwap<RouteTable>` hot-swap pattern (`server/state.rs`): the whole
//! table is replaced atomically on mutation, giving lock-free reads on
//! the hot ACL-check path (`is_tool_allowed_by_plan`, `get_credit_multiplier`).

use crate::keys::KeyRegistry;
use arc_swap::ArcSwap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const MAX_PLANS: usize = 100;
const MAX_DESCRIPTION_LEN: usize = 500;

fn valid_plan_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub name: String,
    pub description: String,
    /// 0 = inherit the global/per-key rate limit.
    pub rate_limit_per_min: u32,
    pub daily_call_limit: u64,
    pub monthly_call_limit: u64,
    /// 0 = unlimited.
    pub daily_credit_limit: f64,
    pub monthly_credit_limit: f64,
    pub credit_multiplier: f64,
    pub allowed_tools: HashSet<String>,
    pub denied_tools: HashSet<String>,
    pub max_concurrent: u32,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Plan {
    pub fn new(name: &str, description: &str, now_ms: i64) -> Result<Self, String> {
        if !valid_plan_name(name) {
            return Err(format!(
                "plan name must match [A-Za-z0-9_-]{{1,64}}, got {name:?}"
            ));
        }
        if description.len() > MAX_DESCRIPTION_LEN {
            return Err(format!(
                "plan description must be <= {MAX_DESCRIPTION_LEN} chars"
            ));
        }
        Ok(Self {
            name: name.to_string(),
            description: description.to_string(),
            rate_limit_per_min: 0,
            daily_call_limit: 0,
            monthly_call_limit: 0,
            daily_credit_limit: 0.0,
            monthly_credit_limit: 0.0,
            credit_multiplier: 1.0,
            allowed_tools: HashSet::new(),
            denied_tools: HashSet::new(),
            max_concurrent: 0,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        })
    }

    /// Clamp the multiplier to `>= 0` per spec.md §3.
    pub fn with_credit_multiplier(mut self, multiplier: f64) -> Self {
        self.credit_multiplier = multiplier.max(0.0);
        self
    }
}

#[derive(Debug, Clone)]
pub struct AclDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

pub struct PlanResolver {
    plans: ArcSwap<HashMap<String, Plan>>,
    keys: Arc<KeyRegistry>,
}

impl PlanResolver {
    pub fn new(keys: Arc<KeyRegistry>) -> Self {
        Self {
            plans: ArcSwap::new(Arc::new(HashMap::new())),
            keys,
        }
    }

    pub fn upsert_plan(&self, plan: Plan) -> Result<(), String> {
        let current = self.plans.load();
        if !current.contains_key(&plan.name) && current.len() >= MAX_PLANS {
            return Err(format!("plan limit reached ({MAX_PLANS})"));
        }
        let mut next = (**current).clone();
        next.insert(plan.name.clone(), plan);
        self.plans.store(Arc::new(next));
        Ok(())
    }

    /// Deletion is forbidden while any key references the plan.
    pub fn delete_plan(&self, name: &str) -> Result<(), String> {
        let referencing = self.keys.count_referencing_plan(name);
        if referencing > 0 {
            return Err(format!(
                "plan {name} is referenced by {referencing} key(s)"
            ));
        }
        let current = self.plans.load();
        if !current.contains_key(name) {
            return Err(format!("plan {name} does not exist"));
        }
        let mut next = (**current).clone();
        next.remove(name);
        self.plans.store(Arc::new(next));
        Ok(())
    }

    pub fn get_plan(&self, name: &str) -> Option<Plan> {
        self.plans.load().get(name).cloned()
    }

    pub fn plan_count(&self) -> usize {
        self.plans.load().len()
    }

    /// Assign (`Some`) or remove (`None`) the plan a key resolves to.
    /// Validates the plan exists when assigning.
    pub fn assign_key(&self, key: &str, plan_name: Option<&str>) -> Result<(), String> {
        match plan_name {
            None => {
                self.keys.set_plan(key, None);
                Ok(())
            }
            Some(name) => {
                if self.plans.load().get(name).is_none() {
                    return Err(format!("plan {name} does not exist"));
                }
                if !self.keys.set_plan(key, Some(name.to_string())) {
                    return Err(format!("key {key} does not exist"));
                }
                Ok(())
            }
        }
    }

    pub fn get_key_plan(&self, key: &str) -> Option<Plan> {
        let record = self.keys.get(key)?;
        let plan_name = record.plan?;
        self.get_plan(&plan_name)
    }

    /// Deny wins: deniedTools checked before allowedTools (spec.md §4.D,
    /// invariant 6).
    pub fn is_tool_allowed_by_plan(&self, key: &str, tool: &str) -> AclDecision {
        let Some(plan) = self.get_key_plan(key) else {
            return AclDecision {
                allowed: true,
                reason: None,
            };
        };

        if !plan.denied_tools.is_empty() && plan.denied_tools.contains(tool) {
            return AclDecision {
                allowed: false,
                reason: Some(format!("denied by plan \"{}\"", plan.name)),
            };
        }

        if !plan.allowed_tools.is_empty() && !plan.allowed_tools.contains(tool) {
            return AclDecision {
                allowed: false,
                reason: Some(format!("not in plan \"{}\" allowed list", plan.name)),
            };
        }

        AclDecision {
            allowed: true,
            reason: None,
        }
    }

    pub fn get_credit_multiplier(&self, key: &str) -> f64 {
        self.get_key_plan(key)
            .map(|p| p.credit_multiplier)
            .unwrap_or(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<KeyRegistry>, PlanResolver) {
        let keys = Arc::new(KeyRegistry::new());
        keys.create("abcdefgh12345678", "alice", 0, None, None).unwrap();
        let resolver = PlanResolver::new(keys.clone());
        (keys, resolver)
    }

    #[test]
    fn plan_acl_scenario_from_spec() {
        // spec.md §8 scenario 7.
        let (_keys, resolver) = setup();
        let mut plan = Plan::new("free", "basic tier", 0).unwrap();
        plan.denied_tools.insert("dangerous".to_string());
        resolver.upsert_plan(plan).unwrap();
        resolver
            .assign_key("abcdefgh12345678", Some("free"))
            .unwrap();

        let denied = resolver.is_tool_allowed_by_plan("abcdefgh12345678", "dangerous");
        assert!(!denied.allowed);
        assert!(denied.reason.unwrap().contains("denied by plan \"free\""));

        let allowed = resolver.is_tool_allowed_by_plan("abcdefgh12345678", "other");
        assert!(allowed.allowed);
    }

    #[test]
    fn deny_wins_over_allow_invariant() {
        // spec.md §8 invariant 6.
        let (_keys, resolver) = setup();
        let mut plan = Plan::new("mixed", "", 0).unwrap();
        plan.allowed_tools.insert("dangerous".to_string());
        plan.denied_tools.insert("dangerous".to_string());
        resolver.upsert_plan(plan).unwrap();
        resolver
            .assign_key("abcdefgh12345678", Some("mixed"))
            .unwrap();

        let decision = resolver.is_tool_allowed_by_plan("abcdefgh12345678", "dangerous");
        assert!(!decision.allowed);
    }

    #[test]
    fn no_plan_allows_everything() {
        let (_keys, resolver) = setup();
        let decision = resolver.is_tool_allowed_by_plan("abcdefgh12345678", "anything");
        assert!(decision.allowed);
        assert_eq!(resolver.get_credit_multiplier("abcdefgh12345678"), 1.0);
    }

    #[test]
    fn multiplier_is_clamped_non_negative() {
        let plan = Plan::new("p", "", 0).unwrap().with_credit_multiplier(-5.0);
        assert_eq!(plan.credit_multiplier, 0.0);
    }

    #[test]
    fn assign_unknown_plan_fails() {
        let (_keys, resolver) = setup();
        let err = resolver.assign_key("abcdefgh12345678", Some("ghost"));
        assert!(err.is_err());
    }

    #[test]
    fn delete_forbidden_while_referenced() {
        let (_keys, resolver) = setup();
        resolver
            .upsert_plan(Plan::new("free", "", 0).unwrap())
            .unwrap();
        resolver
            .assign_key("abcdefgh12345678", Some("free"))
            .unwrap();
        assert!(resolver.delete_plan("free").is_err());

        resolver.assign_key("abcdefgh12345678", None).unwrap();
        assert!(resolver.delete_plan("free").is_ok());
    }

    #[test]
    fn invalid_plan_name_rejected() {
        assert!(Plan::new("has spaces", "", 0).is_err());
        assert!(Plan::new("", "", 0).is_err());
    }

    #[test]
    fn plan_limit_enforced() {
        let (_keys, resolver) = setup();
        for i in 0..MAX_PLANS {
            resolver
                .upsert_plan(Plan::new(&format!("p{i}"), "", 0).unwrap())
                .unwrap();
        }
        let overflow = resolver.upsert_plan(Plan::new("overflow", "", 0).unwrap());
        assert!(overflow.is_err());
    }
}
