//! Session orchestration: registration-time dependency validation and the
//! sequential task loop with typed per-bit outcomes.

use super::{PluginError, SessionContext, TaskGroup, TaskKind, TaskMask};
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::instrument;

/// Outcome of one task bit, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    NotSupported,
    Ok,
    PortalInaccessible,
    Cancelled,
    IoError,
    WrongCredentials,
    UnknownPortalFormat,
    PluginTimeout,
}

impl TaskResult {
    pub fn severity(self) -> u16 {
        match self {
            TaskResult::NotSupported => 100,
            TaskResult::Ok => 200,
            TaskResult::PortalInaccessible => 300,
            TaskResult::Cancelled => 320,
            TaskResult::IoError => 350,
            TaskResult::WrongCredentials => 400,
            TaskResult::UnknownPortalFormat => 500,
            TaskResult::PluginTimeout => 600,
        }
    }

    pub fn is_ok(self) -> bool {
        self == TaskResult::Ok
    }
}

impl PartialOrd for TaskResult {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaskResult {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.severity().cmp(&other.severity())
    }
}

/// Per-bit results of one session, plus the diagnostic trace of a format
/// failure when one occurred.
#[derive(Debug, Default)]
pub struct SessionReport {
    pub results: BTreeMap<TaskKind, TaskResult>,
    pub trace: Option<String>,
}

impl SessionReport {
    /// Highest severity across all reported bits.
    pub fn worst(&self) -> TaskResult {
        self.results
            .values()
            .copied()
            .max()
            .unwrap_or(TaskResult::NotSupported)
    }

    fn record_mask(&mut self, mask: TaskMask, result: TaskResult) {
        for kind in mask.iter() {
            self.results.insert(kind, result);
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("task provides no bits")]
    EmptyProvides,
    #[error("provided bits {0} overlap an earlier task")]
    ProvidesOverlap(TaskMask),
    #[error("dependency bits {0} are not provided by any earlier task")]
    ForwardDependency(TaskMask),
}

/// Ordered task list with registration-time dependency validation. The
/// registration order is the topological order; no per-run sorting happens.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Vec<Box<dyn TaskGroup>>,
    provided: TaskMask,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task: Box<dyn TaskGroup>) -> Result<(), RegistrationError> {
        let provides = task.provides();
        if provides.is_empty() {
            return Err(RegistrationError::EmptyProvides);
        }
        if provides.intersects(self.provided) {
            return Err(RegistrationError::ProvidesOverlap(
                provides.intersection(self.provided),
            ));
        }
        let missing = task.depends().difference(self.provided);
        if !missing.is_empty() {
            return Err(RegistrationError::ForwardDependency(missing));
        }
        self.provided = self.provided.union(provides);
        self.tasks.push(task);
        Ok(())
    }

    pub fn provided(&self) -> TaskMask {
        self.provided
    }
}

/// Session lifecycle hooks for login/logout handshakes.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    async fn on_session_start(&self, _ctx: &mut SessionContext) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_session_end(&self, _ctx: &mut SessionContext) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Default hooks for plugins without a session handshake.
pub struct NoHooks;

#[async_trait]
impl SessionHooks for NoHooks {}

/// Runs one sync session over a registry. Exceptions from task bodies never
/// escape; every requested bit always gets a typed outcome.
pub struct SessionRunner {
    registry: TaskRegistry,
    hooks: Box<dyn SessionHooks>,
}

impl SessionRunner {
    pub fn new(registry: TaskRegistry) -> Self {
        Self {
            registry,
            hooks: Box::new(NoHooks),
        }
    }

    pub fn with_hooks(registry: TaskRegistry, hooks: Box<dyn SessionHooks>) -> Self {
        Self { registry, hooks }
    }

    #[instrument(skip(self, ctx), fields(credential_id = ctx.log.credential_id))]
    pub async fn run_session(&self, ctx: &mut SessionContext, requested: TaskMask) -> SessionReport {
        let mut report = SessionReport::default();

        let unsupported = requested.difference(self.registry.provided());
        report.record_mask(unsupported, TaskResult::NotSupported);

        let mut todo = requested.intersection(self.registry.provided());
        // One reverse scan suffices: dependencies were registered earlier,
        // so OR-ing them in while walking backwards converges.
        for task in self.registry.tasks.iter().rev() {
            if task.provides().intersects(todo) {
                todo = todo.union(task.depends());
            }
        }

        if todo.is_empty() {
            return report;
        }
        tracing::debug!(%todo, "session starting");

        if let Err(err) = self.hooks.on_session_start(ctx).await {
            let (result, trace) = classify_error(&err);
            tracing::warn!(error = %err, "session start hook failed");
            report.record_mask(todo, result);
            report.trace = trace;
            return report;
        }

        while !todo.is_empty() {
            if ctx.is_cancelled() {
                report.record_mask(todo, TaskResult::Cancelled);
                break;
            }
            let Some(task) = self
                .registry
                .tasks
                .iter()
                .find(|t| t.provides().intersects(todo))
            else {
                // Unreachable after the expansion above; bail defensibly.
                report.record_mask(todo, TaskResult::NotSupported);
                break;
            };
            match task.run(ctx).await {
                Ok(()) => {
                    report.record_mask(task.provides(), TaskResult::Ok);
                    todo = todo.difference(task.provides());
                }
                Err(err) => {
                    // One shared outcome for everything still pending.
                    let (result, trace) = classify_error(&err);
                    tracing::warn!(error = %err, %todo, "task failed, aborting session");
                    report.record_mask(todo, result);
                    report.trace = trace;
                    break;
                }
            }
        }

        if let Err(err) = self.hooks.on_session_end(ctx).await {
            tracing::warn!(error = %err, "session end hook failed");
        }
        report
    }
}

fn classify_error(err: &PluginError) -> (TaskResult, Option<String>) {
    match err {
        PluginError::Io(_) | PluginError::Storage(_) | PluginError::Http(_) => {
            (TaskResult::IoError, None)
        }
        PluginError::WrongCredentials => (TaskResult::WrongCredentials, None),
        PluginError::ServerUnavailable(trace) => {
            (TaskResult::PortalInaccessible, Some(trace.clone()))
        }
        PluginError::FormatChanged(trace) => {
            (TaskResult::UnknownPortalFormat, Some(trace.clone()))
        }
    }
}
