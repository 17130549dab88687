//! Task graph registry.
//!
//! Stores task definitions plus two edge sets over task names:
//!
//! - `Group(src, dest)`: `src` is a subtask of `dest`; `dest` completes after `src`.
//! - `DependsOn(src, dest)`: `src` may only start once `dest` is done.
//!
//! Edges are append-only and de-duplicated by `(kind, src, dest)`.

use std::collections::HashMap;

use tracing::{debug, info};

use taskmesh_core::{CoreError, NodeId, NodeInfo};

use crate::task::{TaskDef, TaskOrigin, TaskRef};

/// Kind of a graph edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    Group,
    DependsOn,
}

/// A directed edge between two task names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub kind: BindingKind,
    pub src: String,
    pub dest: String,
}

/// Outcome of a matching access rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPolicy {
    Allow,
    Deny,
}

/// Allow/deny rule matched by exact name or glob.
#[derive(Debug, Clone)]
pub struct AccessRule {
    pattern: String,
    matcher: glob::Pattern,
    policy: AccessPolicy,
}

impl AccessRule {
    pub fn new(pattern: impl Into<String>, policy: AccessPolicy) -> Result<Self, CoreError> {
        let pattern = pattern.into();
        let matcher = glob::Pattern::new(&pattern).map_err(|e| {
            CoreError::InvalidDefinition(format!("bad access pattern '{pattern}': {e}"))
        })?;
        Ok(Self {
            pattern,
            matcher,
            policy,
        })
    }

    pub fn allow(pattern: impl Into<String>) -> Result<Self, CoreError> {
        Self::new(pattern, AccessPolicy::Allow)
    }

    pub fn deny(pattern: impl Into<String>) -> Result<Self, CoreError> {
        Self::new(pattern, AccessPolicy::Deny)
    }

    fn matches(&self, name: &str) -> bool {
        self.pattern == name || self.matcher.matches(name)
    }

    /// Number of literal characters in the pattern.
    fn specificity(&self) -> usize {
        self.pattern
            .chars()
            .filter(|c| !matches!(c, '*' | '?' | '[' | ']'))
            .count()
    }
}

/// Registry of task definitions and the bindings between them.
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: HashMap<String, TaskRef>,
    bindings: Vec<Binding>,
    rules: Vec<AccessRule>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local task and the edges it declares.
    pub fn add_task(&mut self, def: TaskDef) -> Result<(), CoreError> {
        validate_name(&def.name)?;
        for dest in def.depends_on.iter().chain(def.group_in.iter()) {
            validate_name(dest)?;
            if *dest == def.name {
                return Err(CoreError::InvalidDefinition(format!(
                    "task '{}' cannot bind to itself",
                    def.name
                )));
            }
        }

        let node_infos = match self.tasks.get(&def.name) {
            Some(existing) if existing.origin == TaskOrigin::Local => {
                return Err(CoreError::DuplicateTask(def.name));
            }
            Some(existing) => existing.node_infos.clone(),
            None => Vec::new(),
        };

        let name = def.name.clone();
        let depends_on = def.depends_on.clone();
        let group_in = def.group_in.clone();

        let mut task = TaskRef::from_def(def);
        task.node_infos = node_infos;
        debug!(task = %name, variant = ?task.variant, "Registered task");
        self.tasks.insert(name.clone(), task);

        for dest in depends_on {
            self.bind(BindingKind::DependsOn, &name, &dest);
        }
        for dest in group_in {
            self.bind(BindingKind::Group, &name, &dest);
        }
        Ok(())
    }

    /// Look up a task without mutating the registry. A name only used as a
    /// group destination resolves to a fresh implicit group.
    pub fn resolve(&self, name: &str) -> Result<TaskRef, CoreError> {
        if let Some(task) = self.tasks.get(name) {
            return Ok(task.clone());
        }
        if self.is_group_destination(name) {
            return Ok(TaskRef::implicit_group(name));
        }
        Err(CoreError::TaskNotFound(name.to_string()))
    }

    /// Look up a task, registering an implicit group when needed.
    pub fn get(&mut self, name: &str) -> Result<TaskRef, CoreError> {
        let task = self.resolve(name)?;
        if task.origin == TaskOrigin::Implicit && !self.tasks.contains_key(name) {
            self.tasks.insert(name.to_string(), task.clone());
        }
        Ok(task)
    }

    /// Resolve several names; fails on the first unknown one.
    pub fn get_tasks<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<TaskRef>, CoreError> {
        names.iter().map(|n| self.resolve(n.as_ref())).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name) || self.is_group_destination(name)
    }

    /// Sorted names of registered tasks.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    /// Sorted names of tasks executable on this node.
    pub fn local_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.is_local())
            .map(|t| t.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Declare `src` a subtask of `dest`.
    pub fn group(&mut self, src: &str, dest: &str) -> Result<(), CoreError> {
        self.checked_bind(BindingKind::Group, src, dest)
    }

    /// Declare that `src` waits for `dest`.
    pub fn depends_on(&mut self, src: &str, dest: &str) -> Result<(), CoreError> {
        self.checked_bind(BindingKind::DependsOn, src, dest)
    }

    /// Names grouped under `name`.
    pub fn subtasks(&self, name: &str) -> Vec<String> {
        self.bindings
            .iter()
            .filter(|b| b.kind == BindingKind::Group && b.dest == name)
            .map(|b| b.src.clone())
            .collect()
    }

    /// Names `name` waits for.
    pub fn dependencies(&self, name: &str) -> Vec<String> {
        self.bindings
            .iter()
            .filter(|b| b.kind == BindingKind::DependsOn && b.src == name)
            .map(|b| b.dest.clone())
            .collect()
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Replace the access rules.
    pub fn set_rules(&mut self, rules: Vec<AccessRule>) {
        self.rules = rules;
    }

    pub fn add_rule(&mut self, rule: AccessRule) {
        self.rules.push(rule);
    }

    /// Access policy. An exact-name rule wins over any glob; among globs the
    /// most specific pattern (most literal characters) wins, ties going to the
    /// rule declared first. No rules, or no match, allows.
    pub fn access(&self, name: &str) -> bool {
        if let Some(rule) = self.rules.iter().find(|rule| rule.pattern == name) {
            return rule.policy == AccessPolicy::Allow;
        }

        let mut best: Option<&AccessRule> = None;
        for rule in self.rules.iter().filter(|rule| rule.matches(name)) {
            if best.map_or(true, |b| rule.specificity() > b.specificity()) {
                best = Some(rule);
            }
        }
        best.map_or(true, |rule| rule.policy == AccessPolicy::Allow)
    }

    /// Record that `node_id` can run `name`, creating a remote task if unknown.
    pub fn add_remote(&mut self, name: &str, node_id: &NodeId, has_worker: bool) {
        let info = NodeInfo::new(node_id.clone(), has_worker);
        match self.tasks.get_mut(name) {
            Some(task) => task.merge_node_info(info),
            None => {
                info!(task = %name, node_id = %node_id, "Discovered remote task");
                self.tasks
                    .insert(name.to_string(), TaskRef::remote(name, info));
            }
        }
    }

    /// Withdraw `node_id` from `name`. Remote tasks without any node left are
    /// removed. Returns true if the task was removed.
    pub fn withdraw_remote(&mut self, name: &str, node_id: &NodeId) -> bool {
        let Some(task) = self.tasks.get_mut(name) else {
            return false;
        };
        task.node_infos.retain(|info| &info.node_id != node_id);

        if task.origin == TaskOrigin::Remote && task.node_infos.is_empty() {
            self.remove_task(name);
            return true;
        }
        false
    }

    /// Withdraw a node from every task.
    pub fn withdraw_node(&mut self, node_id: &NodeId) {
        let names: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.node_infos.iter().any(|i| &i.node_id == node_id))
            .map(|t| t.name.clone())
            .collect();
        for name in names {
            self.withdraw_remote(&name, node_id);
        }
    }

    /// Remove a task together with every edge touching it.
    pub fn remove_task(&mut self, name: &str) -> Option<TaskRef> {
        let removed = self.tasks.remove(name);
        self.bindings.retain(|b| b.src != name && b.dest != name);
        if removed.is_some() {
            debug!(task = %name, "Removed task");
        }
        removed
    }

    fn is_group_destination(&self, name: &str) -> bool {
        self.bindings
            .iter()
            .any(|b| b.kind == BindingKind::Group && b.dest == name)
    }

    fn checked_bind(&mut self, kind: BindingKind, src: &str, dest: &str) -> Result<(), CoreError> {
        validate_name(src)?;
        validate_name(dest)?;
        if src == dest {
            return Err(CoreError::InvalidDefinition(format!(
                "task '{src}' cannot bind to itself"
            )));
        }
        self.bind(kind, src, dest);
        Ok(())
    }

    fn bind(&mut self, kind: BindingKind, src: &str, dest: &str) {
        let binding = Binding {
            kind,
            src: src.to_string(),
            dest: dest.to_string(),
        };
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
    }
}

fn validate_name(name: &str) -> Result<(), CoreError> {
    if name.trim().is_empty() {
        return Err(CoreError::InvalidDefinition("empty task name".to_string()));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(CoreError::InvalidDefinition(format!(
            "task name '{name}' contains whitespace"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskmesh_core::TaskVariant;

    fn noop(name: &str) -> TaskDef {
        TaskDef::new(name).exec(|_ctx| async { Ok(json!(null)) })
    }

    #[test]
    fn test_access_without_rules_allows_everything() {
        let graph = TaskGraph::new();
        assert!(graph.access("anything"));
    }

    #[test]
    fn test_access_deny_all() {
        let mut graph = TaskGraph::new();
        graph.set_rules(vec![AccessRule::deny("*").unwrap()]);
        assert!(!graph.access("foo_x"));
        assert!(!graph.access("bar"));
    }

    #[test]
    fn test_access_specific_glob_beats_wildcard() {
        let mut graph = TaskGraph::new();
        graph.set_rules(vec![
            AccessRule::deny("*").unwrap(),
            AccessRule::allow("foo_*").unwrap(),
        ]);
        assert!(graph.access("foo_x"));
        assert!(!graph.access("bar"));
    }

    #[test]
    fn test_access_exact_name_beats_glob() {
        let mut graph = TaskGraph::new();
        graph.set_rules(vec![
            AccessRule::allow("foo_*").unwrap(),
            AccessRule::deny("foo_secret").unwrap(),
        ]);
        assert!(graph.access("foo_x"));
        assert!(!graph.access("foo_secret"));
    }

    #[test]
    fn test_access_equal_specificity_first_declared_wins() {
        let mut graph = TaskGraph::new();
        graph.set_rules(vec![
            AccessRule::allow("a*").unwrap(),
            AccessRule::deny("*b").unwrap(),
        ]);
        assert!(graph.access("ab"));
    }

    #[test]
    fn test_access_unmatched_rules_allow() {
        let mut graph = TaskGraph::new();
        graph.set_rules(vec![AccessRule::deny("secret").unwrap()]);
        assert!(!graph.access("secret"));
        assert!(graph.access("public"));
    }

    #[test]
    fn test_duplicate_local_task_is_rejected() {
        let mut graph = TaskGraph::new();
        graph.add_task(noop("a")).unwrap();
        assert_eq!(
            graph.add_task(noop("a")).unwrap_err(),
            CoreError::DuplicateTask("a".to_string())
        );
    }

    #[test]
    fn test_invalid_names_are_rejected() {
        let mut graph = TaskGraph::new();
        assert!(matches!(
            graph.add_task(noop("")),
            Err(CoreError::InvalidDefinition(_))
        ));
        assert!(matches!(
            graph.add_task(noop("a").depends_on("a")),
            Err(CoreError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn test_edges_direction_and_dedup() {
        let mut graph = TaskGraph::new();
        graph.add_task(noop("a")).unwrap();
        graph.add_task(noop("b").depends_on("a")).unwrap();
        graph.depends_on("b", "a").unwrap();

        assert_eq!(graph.dependencies("b"), vec!["a".to_string()]);
        assert!(graph.dependencies("a").is_empty());
        assert_eq!(graph.bindings().len(), 1);
    }

    #[test]
    fn test_group_destination_becomes_implicit_group() {
        let mut graph = TaskGraph::new();
        graph.add_task(noop("lint").group_in("check")).unwrap();
        graph.add_task(noop("test").group_in("check")).unwrap();

        let group = graph.get("check").unwrap();
        assert_eq!(group.variant(), TaskVariant::Group);
        assert_eq!(group.origin(), TaskOrigin::Implicit);
        assert_eq!(graph.subtasks("check"), vec!["lint", "test"]);
        assert!(graph.names().contains(&"check".to_string()));
    }

    #[test]
    fn test_get_tasks_fails_on_unknown_name() {
        let mut graph = TaskGraph::new();
        graph.add_task(noop("a")).unwrap();
        assert_eq!(
            graph.get_tasks(&["a", "missing"]).unwrap_err(),
            CoreError::TaskNotFound("missing".to_string())
        );
        assert_eq!(graph.get_tasks(&["a"]).unwrap().len(), 1);
    }

    #[test]
    fn test_remote_tasks_merge_by_node() {
        let mut graph = TaskGraph::new();
        let n1 = NodeId::new("n1");
        let n2 = NodeId::new("n2");

        graph.add_remote("r", &n1, false);
        graph.add_remote("r", &n1, true);
        graph.add_remote("r", &n2, true);

        let task = graph.resolve("r").unwrap();
        assert_eq!(task.variant(), TaskVariant::Remote);
        assert_eq!(task.node_infos().len(), 2);
        assert_eq!(task.worker_nodes(), vec![n1.clone(), n2.clone()]);

        assert!(!graph.withdraw_remote("r", &n1));
        assert!(graph.withdraw_remote("r", &n2));
        assert!(!graph.contains("r"));
    }

    #[test]
    fn test_remote_info_on_local_task_keeps_task() {
        let mut graph = TaskGraph::new();
        let n1 = NodeId::new("n1");
        graph.add_task(noop("a")).unwrap();
        graph.add_remote("a", &n1, true);

        let task = graph.resolve("a").unwrap();
        assert_eq!(task.variant(), TaskVariant::Callback);
        assert_eq!(task.worker_nodes(), vec![n1.clone()]);

        graph.withdraw_node(&n1);
        assert!(graph.contains("a"));
    }

    #[test]
    fn test_remove_task_drops_edges() {
        let mut graph = TaskGraph::new();
        graph.add_task(noop("a")).unwrap();
        graph.add_task(noop("b").depends_on("a").group_in("g")).unwrap();

        graph.remove_task("b");

        assert!(graph.bindings().is_empty());
        assert!(graph.resolve("g").is_err());
    }
}
