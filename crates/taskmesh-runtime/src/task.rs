//! Task definitions: properties, executables and the registration builder.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use taskmesh_core::{NodeId, NodeInfo, PropertySpec, TaskVariant};

use crate::runner::TaskContext;
use crate::BoxError;

/// Executable body of a task.
#[async_trait]
pub trait TaskExecutable: Send + Sync {
    /// Run the task. An object result has its declared outgoing keys
    /// published to the runner.
    async fn exec(&self, ctx: TaskContext) -> Result<Value, BoxError>;
}

/// Value conversion hook applied to a resolved property.
pub type ConvertFn = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// Factory creating a fresh executable per run.
pub type ExecutableFactory = Arc<dyn Fn() -> Box<dyn TaskExecutable> + Send + Sync>;

/// A declared incoming, outgoing or runtime property.
#[derive(Clone)]
pub struct PropertyDef {
    spec: PropertySpec,
    convert: Option<ConvertFn>,
}

impl PropertyDef {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            spec: PropertySpec::required(name),
            convert: None,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            spec: PropertySpec::optional(name),
            convert: None,
        }
    }

    /// Builder method to set a default value.
    pub fn with_default(mut self, value: Value) -> Self {
        self.spec.default = Some(value);
        self
    }

    /// Builder method to set a conversion hook.
    pub fn with_convert<F>(mut self, convert: F) -> Self
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.convert = Some(Arc::new(convert));
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn is_optional(&self) -> bool {
        self.spec.optional
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.spec.default.as_ref()
    }

    pub fn spec(&self) -> &PropertySpec {
        &self.spec
    }

    /// Apply the conversion hook, if any.
    pub fn convert(&self, value: Value) -> Result<Value, String> {
        match &self.convert {
            Some(convert) => convert(value),
            None => Ok(value),
        }
    }
}

impl fmt::Debug for PropertyDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyDef")
            .field("spec", &self.spec)
            .field("convert", &self.convert.is_some())
            .finish()
    }
}

/// How a task's body is obtained at run time.
#[derive(Clone)]
pub enum Executable {
    Callback(Arc<dyn TaskExecutable>),
    Class(ExecutableFactory),
    Instance(Arc<dyn TaskExecutable>),
    None,
}

impl Executable {
    /// Executable to use for one run.
    pub(crate) fn instantiate(&self) -> Option<Arc<dyn TaskExecutable>> {
        match self {
            Self::Callback(exec) | Self::Instance(exec) => Some(exec.clone()),
            Self::Class(factory) => Some(Arc::from(factory())),
            Self::None => None,
        }
    }
}

struct FnTask<F>(F);

#[async_trait]
impl<F, Fut> TaskExecutable for FnTask<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
{
    async fn exec(&self, ctx: TaskContext) -> Result<Value, BoxError> {
        (self.0)(ctx).await
    }
}

/// Completion handle for callback-style tasks. Must be finished exactly once;
/// dropping it unfinished fails the task.
pub struct Done {
    tx: oneshot::Sender<Result<Value, BoxError>>,
}

impl Done {
    pub fn ok(self, value: Value) {
        let _ = self.tx.send(Ok(value));
    }

    pub fn err(self, error: impl Into<BoxError>) {
        let _ = self.tx.send(Err(error.into()));
    }

    pub fn finish(self, result: Result<Value, BoxError>) {
        let _ = self.tx.send(result);
    }
}

struct CallbackTask<F>(F);

#[async_trait]
impl<F> TaskExecutable for CallbackTask<F>
where
    F: Fn(TaskContext, Done) + Send + Sync,
{
    async fn exec(&self, ctx: TaskContext) -> Result<Value, BoxError> {
        let (tx, rx) = oneshot::channel();
        (self.0)(ctx, Done { tx });
        rx.await
            .map_err(|_| BoxError::from("callback dropped without signalling completion"))?
    }
}

/// Registration builder for a task.
pub struct TaskDef {
    pub(crate) name: String,
    pub(crate) variant: TaskVariant,
    pub(crate) executable: Executable,
    pub(crate) incoming: Vec<PropertyDef>,
    pub(crate) outgoing: Vec<PropertyDef>,
    pub(crate) runtime: Vec<PropertyDef>,
    pub(crate) permissions: Vec<String>,
    pub(crate) description: String,
    pub(crate) depends_on: Vec<String>,
    pub(crate) group_in: Vec<String>,
}

impl TaskDef {
    /// Start a definition. Without an executable it registers as a group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variant: TaskVariant::Group,
            executable: Executable::None,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            runtime: Vec::new(),
            permissions: Vec::new(),
            description: String::new(),
            depends_on: Vec::new(),
            group_in: Vec::new(),
        }
    }

    /// Use an async closure as the body.
    pub fn exec<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        self.variant = TaskVariant::Callback;
        self.executable = Executable::Callback(Arc::new(FnTask(f)));
        self
    }

    /// Use a callback-style closure receiving a [`Done`] handle.
    pub fn exec_callback<F>(mut self, f: F) -> Self
    where
        F: Fn(TaskContext, Done) + Send + Sync + 'static,
    {
        self.variant = TaskVariant::Callback;
        self.executable = Executable::Callback(Arc::new(CallbackTask(f)));
        self
    }

    /// Construct a fresh executable for every run.
    pub fn class<F, E>(mut self, factory: F) -> Self
    where
        F: Fn() -> E + Send + Sync + 'static,
        E: TaskExecutable + 'static,
    {
        self.variant = TaskVariant::Class;
        self.executable = Executable::Class(Arc::new(move || {
            Box::new(factory()) as Box<dyn TaskExecutable>
        }));
        self
    }

    /// Share one executable across runs.
    pub fn instance(mut self, exec: Arc<dyn TaskExecutable>) -> Self {
        self.variant = TaskVariant::Instance;
        self.executable = Executable::Instance(exec);
        self
    }

    pub fn incoming(mut self, property: PropertyDef) -> Self {
        self.incoming.push(property);
        self
    }

    pub fn outgoing(mut self, property: PropertyDef) -> Self {
        self.outgoing.push(property);
        self
    }

    pub fn runtime(mut self, property: PropertyDef) -> Self {
        self.runtime.push(property);
        self
    }

    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// This task waits for `dest`.
    pub fn depends_on(mut self, dest: impl Into<String>) -> Self {
        self.depends_on.push(dest.into());
        self
    }

    /// This task is a subtask of group `dest`.
    pub fn group_in(mut self, dest: impl Into<String>) -> Self {
        self.group_in.push(dest.into());
        self
    }
}

/// Origin of a registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOrigin {
    Local,
    Remote,
    /// Created on demand for a name only used as a group destination.
    Implicit,
}

/// Registered definition of a task.
#[derive(Clone)]
pub struct TaskRef {
    pub(crate) name: String,
    pub(crate) variant: TaskVariant,
    pub(crate) origin: TaskOrigin,
    pub(crate) executable: Executable,
    pub(crate) incoming: Vec<PropertyDef>,
    pub(crate) outgoing: Vec<PropertyDef>,
    pub(crate) runtime: Vec<PropertyDef>,
    pub(crate) permissions: Vec<String>,
    pub(crate) description: String,
    pub(crate) node_infos: Vec<NodeInfo>,
}

impl TaskRef {
    pub(crate) fn from_def(def: TaskDef) -> Self {
        Self {
            name: def.name,
            variant: def.variant,
            origin: TaskOrigin::Local,
            executable: def.executable,
            incoming: def.incoming,
            outgoing: def.outgoing,
            runtime: def.runtime,
            permissions: def.permissions,
            description: def.description,
            node_infos: Vec::new(),
        }
    }

    pub(crate) fn implicit_group(name: &str) -> Self {
        let mut task = Self::from_def(TaskDef::new(name));
        task.origin = TaskOrigin::Implicit;
        task
    }

    pub(crate) fn remote(name: &str, info: NodeInfo) -> Self {
        let mut task = Self::from_def(TaskDef::new(name));
        task.variant = TaskVariant::Remote;
        task.origin = TaskOrigin::Remote;
        task.node_infos.push(info);
        task
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variant(&self) -> TaskVariant {
        self.variant
    }

    pub fn origin(&self) -> TaskOrigin {
        self.origin
    }

    pub fn executable(&self) -> &Executable {
        &self.executable
    }

    pub fn incoming(&self) -> &[PropertyDef] {
        &self.incoming
    }

    pub fn outgoing(&self) -> &[PropertyDef] {
        &self.outgoing
    }

    pub fn runtime(&self) -> &[PropertyDef] {
        &self.runtime
    }

    pub fn permissions(&self) -> &[String] {
        &self.permissions
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn node_infos(&self) -> &[NodeInfo] {
        &self.node_infos
    }

    /// True if the task can run on this node.
    pub fn is_local(&self) -> bool {
        self.origin != TaskOrigin::Remote
    }

    /// Nodes known to run the task with a worker.
    pub fn worker_nodes(&self) -> Vec<NodeId> {
        self.node_infos
            .iter()
            .filter(|info| info.has_worker)
            .map(|info| info.node_id.clone())
            .collect()
    }

    /// Union by node id, replacing the worker flag.
    pub(crate) fn merge_node_info(&mut self, info: NodeInfo) {
        match self
            .node_infos
            .iter_mut()
            .find(|existing| existing.node_id == info.node_id)
        {
            Some(existing) => existing.has_worker = info.has_worker,
            None => self.node_infos.push(info),
        }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("name", &self.name)
            .field("variant", &self.variant)
            .field("origin", &self.origin)
            .field("incoming", &self.incoming)
            .field("outgoing", &self.outgoing)
            .field("node_infos", &self.node_infos)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_def_without_exec_is_group() {
        let task = TaskRef::from_def(TaskDef::new("all"));
        assert_eq!(task.variant(), TaskVariant::Group);
        assert!(task.executable().instantiate().is_none());
    }

    #[test]
    fn test_exec_sets_callback_variant() {
        let task = TaskRef::from_def(TaskDef::new("a").exec(|_ctx| async { Ok(json!(1)) }));
        assert_eq!(task.variant(), TaskVariant::Callback);
        assert!(task.executable().instantiate().is_some());
    }

    #[test]
    fn test_property_convert_hook() {
        let prop = PropertyDef::required("count").with_convert(|v| {
            v.as_str()
                .and_then(|s| s.parse::<i64>().ok())
                .map(Value::from)
                .ok_or_else(|| "not a number".to_string())
        });
        assert_eq!(prop.convert(json!("42")).unwrap(), json!(42));
        assert!(prop.convert(json!("x")).is_err());
    }

    #[test]
    fn test_merge_node_info_replaces_worker_flag() {
        let mut task = TaskRef::remote("r", NodeInfo::new(NodeId::new("n1"), false));
        task.merge_node_info(NodeInfo::new(NodeId::new("n1"), true));
        task.merge_node_info(NodeInfo::new(NodeId::new("n2"), false));

        assert_eq!(task.node_infos().len(), 2);
        assert_eq!(task.worker_nodes(), vec![NodeId::new("n1")]);
    }
}
