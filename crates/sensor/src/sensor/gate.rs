//! Trigger gates: one compiled expression per trigger plus the group rules it may reference.

use std::collections::{BTreeSet, HashMap, HashSet};

use sha2::{Digest, Sha256};

use super::expr::{normalize, Expr};
use crate::crd::{GroupType, SensorSpec, Trigger};
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct Group {
    name: String,
    group_type: GroupType,
    members: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TriggerGate {
    pub trigger: String,
    pub expr: Expr,
    /// Dependency names the expression depends on, groups expanded
    pub dependencies: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct Gates {
    /// Normalized identifier to dependency name
    dependencies: HashMap<String, String>,
    /// Normalized identifier to group
    groups: HashMap<String, Group>,
    triggers: Vec<TriggerGate>,
}

/// Expression a trigger is gated on: its explicit conditions, or every ungrouped
/// dependency and every group ANDed together.
pub fn build_expression(spec: &SensorSpec, trigger: &Trigger) -> String {
    if let Some(conditions) = trigger.conditions.as_deref().filter(|c| !c.trim().is_empty()) {
        return conditions.to_string();
    }

    let grouped: HashSet<&str> = spec
        .dependency_groups
        .iter()
        .flat_map(|g| g.dependencies.iter().map(String::as_str))
        .collect();

    spec.dependencies
        .iter()
        .map(|d| d.name.as_str())
        .filter(|name| !grouped.contains(name))
        .chain(spec.dependency_groups.iter().map(|g| g.name.as_str()))
        .collect::<Vec<_>>()
        .join(" && ")
}

impl Gates {
    pub fn compile(spec: &SensorSpec) -> Result<Self> {
        let mut dependencies = HashMap::new();
        for dep in &spec.dependencies {
            if dependencies
                .insert(normalize(&dep.name), dep.name.clone())
                .is_some()
            {
                return Err(Error::Validation(format!(
                    "dependency name '{}' collides with another dependency",
                    dep.name
                )));
            }
        }

        let mut groups = HashMap::new();
        for group in &spec.dependency_groups {
            let id = normalize(&group.name);
            if dependencies.contains_key(&id) || groups.contains_key(&id) {
                return Err(Error::Validation(format!(
                    "dependency group name '{}' collides with another dependency or group",
                    group.name
                )));
            }
            for member in &group.dependencies {
                if !spec.dependencies.iter().any(|d| &d.name == member) {
                    return Err(Error::Validation(format!(
                        "dependency group '{}' references unknown dependency '{}'",
                        group.name, member
                    )));
                }
            }
            groups.insert(
                id,
                Group {
                    name: group.name.clone(),
                    group_type: group.group_type,
                    members: group.dependencies.clone(),
                },
            );
        }

        let mut gates = Gates {
            dependencies,
            groups,
            triggers: Vec::with_capacity(spec.triggers.len()),
        };

        for trigger in &spec.triggers {
            let source = build_expression(spec, trigger);
            let expr = Expr::parse(&source).map_err(|e| {
                Error::Validation(format!(
                    "trigger '{}': invalid conditions '{}': {}",
                    trigger.template.name, source, e
                ))
            })?;

            let mut deps = BTreeSet::new();
            for ident in expr.identifiers() {
                if let Some(dep) = gates.dependencies.get(&ident) {
                    deps.insert(dep.clone());
                } else if let Some(group) = gates.groups.get(&ident) {
                    deps.extend(group.members.iter().cloned());
                } else {
                    return Err(Error::Validation(format!(
                        "trigger '{}': conditions reference unknown dependency or group '{}'",
                        trigger.template.name, ident
                    )));
                }
            }

            gates.triggers.push(TriggerGate {
                trigger: trigger.template.name.clone(),
                expr,
                dependencies: deps,
            });
        }

        Ok(gates)
    }

    pub fn triggers(&self) -> &[TriggerGate] {
        &self.triggers
    }

    pub fn gate(&self, trigger: &str) -> Option<&TriggerGate> {
        self.triggers.iter().find(|g| g.trigger == trigger)
    }

    /// Evaluate a trigger's gate against the set of resolved dependency names.
    pub fn evaluate(&self, gate: &TriggerGate, resolved: &HashSet<String>) -> bool {
        gate.expr.eval(&|ident: &str| self.identifier_holds(ident, resolved))
    }

    fn identifier_holds(&self, ident: &str, resolved: &HashSet<String>) -> bool {
        if let Some(dep) = self.dependencies.get(ident) {
            return resolved.contains(dep);
        }
        self.groups
            .get(ident)
            .map(|g| group_holds(g, resolved))
            .unwrap_or(false)
    }

    /// Names of the groups whose rule holds.
    pub fn resolved_groups(&self, resolved: &HashSet<String>) -> Vec<String> {
        let mut names: Vec<String> = self
            .groups
            .values()
            .filter(|g| group_holds(g, resolved))
            .map(|g| g.name.clone())
            .collect();
        names.sort();
        names
    }
}

fn group_holds(group: &Group, resolved: &HashSet<String>) -> bool {
    match group.group_type {
        GroupType::And => group.members.iter().all(|m| resolved.contains(m)),
        GroupType::Or => group.members.iter().any(|m| resolved.contains(m)),
    }
}

/// Stable digest of a set of event ids, independent of their order.
pub fn fingerprint<'a, I>(event_ids: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut ids: Vec<&str> = event_ids.into_iter().collect();
    ids.sort_unstable();
    let mut hasher = Sha256::new();
    for id in ids {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DependencyGroup, EventDependency, LogTrigger, TriggerTemplate};

    fn dependency(name: &str) -> EventDependency {
        EventDependency {
            name: name.to_string(),
            event_source_name: "webhook".to_string(),
            event_name: name.to_string(),
            filters: None,
        }
    }

    fn trigger(name: &str, conditions: Option<&str>) -> Trigger {
        Trigger {
            template: TriggerTemplate {
                name: name.to_string(),
                log: Some(LogTrigger {}),
                ..Default::default()
            },
            conditions: conditions.map(str::to_string),
            parameters: vec![],
            policy: None,
            retry_strategy: None,
            rate_limit: None,
            weight: 0,
        }
    }

    fn spec(deps: &[&str], groups: Vec<DependencyGroup>, triggers: Vec<Trigger>) -> SensorSpec {
        SensorSpec {
            dependencies: deps.iter().map(|d| dependency(d)).collect(),
            dependency_groups: groups,
            triggers,
            repeat: true,
            error_on_failed_round: false,
        }
    }

    fn resolved(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_expression_waits_for_everything() {
        let s = spec(&["dep1", "dep2"], vec![], vec![trigger("t", None)]);
        assert_eq!(build_expression(&s, &s.triggers[0]), "dep1 && dep2");

        let gates = Gates::compile(&s).unwrap();
        let gate = gates.gate("t").unwrap();
        assert!(!gates.evaluate(gate, &resolved(&["dep1"])));
        assert!(gates.evaluate(gate, &resolved(&["dep1", "dep2"])));
    }

    #[test]
    fn test_default_expression_uses_groups() {
        let groups = vec![DependencyGroup {
            name: "either".to_string(),
            dependencies: vec!["a".to_string(), "b".to_string()],
            group_type: GroupType::Or,
        }];
        let s = spec(&["a", "b", "c"], groups, vec![trigger("t", None)]);
        assert_eq!(build_expression(&s, &s.triggers[0]), "c && either");

        let gates = Gates::compile(&s).unwrap();
        let gate = gates.gate("t").unwrap();
        assert!(gates.evaluate(gate, &resolved(&["b", "c"])));
        assert!(!gates.evaluate(gate, &resolved(&["a", "b"])));
        let expected: BTreeSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(gate.dependencies, expected);
        assert_eq!(gates.resolved_groups(&resolved(&["a"])), vec!["either"]);
    }

    #[test]
    fn test_explicit_conditions_with_hyphens() {
        let s = spec(
            &["dep-a", "dep-b", "dep-c"],
            vec![],
            vec![trigger("t", Some("dep-a && (dep-b || dep-c)"))],
        );
        let gates = Gates::compile(&s).unwrap();
        let gate = gates.gate("t").unwrap();
        assert!(gates.evaluate(gate, &resolved(&["dep-a", "dep-c"])));
        assert!(!gates.evaluate(gate, &resolved(&["dep-b", "dep-c"])));
    }

    #[test]
    fn test_unknown_identifier_is_validation_error() {
        let s = spec(&["a"], vec![], vec![trigger("t", Some("a && missing"))]);
        assert!(matches!(Gates::compile(&s), Err(Error::Validation(_))));
    }

    #[test]
    fn test_normalized_collision_is_validation_error() {
        let s = spec(&["dep-a", "dep_a"], vec![], vec![trigger("t", None)]);
        assert!(matches!(Gates::compile(&s), Err(Error::Validation(_))));
    }

    #[test]
    fn test_fingerprint_ignores_order() {
        assert_eq!(fingerprint(["b", "a"]), fingerprint(["a", "b"]));
        assert_ne!(fingerprint(["a", "b"]), fingerprint(["a", "c"]));
    }
}
