use std::collections::BTreeSet;

use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::io::remote::RemoteApi;
use crate::io::store::LocalStore;
use crate::model::EntityKind;
use crate::policy::{Boundary, Failure, FailurePolicy, for_debug_flag, guard};
use crate::reconcile::{ReconcileReport, Reconciler, RunContext};

/// Kinds backed by remote tables, in the order their steps run. A kind may
/// only reference kinds listed before it, itself, or vocabularies.
pub const DEPENDENCY_ORDER: [EntityKind; 5] = [
    EntityKind::Actor,
    EntityKind::Role,
    EntityKind::Affiliation,
    EntityKind::Source,
    EntityKind::Evidence,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunMode {
    /// Skips import-optional kinds.
    #[default]
    Default,
    Full,
}

/// Lifecycle of one orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    NotStarted,
    Running(EntityKind),
    Completed,
    CompletedWithErrors(Vec<Failure>),
    Aborted(Failure),
}

/// Gets told which kinds changed after a run that did not abort.
pub trait SyncObserver {
    fn entities_changed(&mut self, kinds: &[EntityKind]);
}

/// Observer that only logs the changed kinds.
#[derive(Debug, Default)]
pub struct LogObserver;

impl SyncObserver for LogObserver {
    fn entities_changed(&mut self, kinds: &[EntityKind]) {
        let kinds: Vec<&str> = kinds.iter().map(|kind| kind.as_str()).collect();
        info!(kinds = ?kinds, "entities changed");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub mode: RunMode,
    pub policy: &'static str,
    pub steps: Vec<ReconcileReport>,
    pub failures: Vec<Failure>,
}

impl RunReport {
    pub fn step(&self, kind: EntityKind) -> Option<&ReconcileReport> {
        self.steps.iter().find(|step| step.kind == kind)
    }

    pub fn changed_kinds(&self) -> Vec<EntityKind> {
        self.steps
            .iter()
            .filter(|step| step.has_changes())
            .map(|step| step.kind)
            .collect()
    }
}

/// Kinds the run reconciles, in dependency order.
///
/// Every relation of a planned kind must target the kind itself, a kind
/// without a table, or a tabled kind planned before it.
pub fn plan(config: &Config, mode: RunMode) -> Result<Vec<EntityKind>> {
    let planned: Vec<EntityKind> = DEPENDENCY_ORDER
        .into_iter()
        .filter(|kind| config.has_table(*kind))
        .filter(|kind| mode == RunMode::Full || !config.is_optional(*kind))
        .collect();

    let mut earlier: BTreeSet<EntityKind> = BTreeSet::new();
    for kind in &planned {
        let Some(entity) = config.entity(*kind) else {
            continue;
        };
        for relation in &entity.relations {
            let target = relation.target;
            if target != *kind && config.has_table(target) && !earlier.contains(&target) {
                return Err(SyncError::DependencyOrder {
                    kind: *kind,
                    depends_on: target,
                });
            }
        }
        earlier.insert(*kind);
    }
    Ok(planned)
}

/// Runs the reconciliation steps of one import under a failure policy.
pub struct Orchestrator<'a> {
    config: &'a Config,
    api: &'a dyn RemoteApi,
    store: &'a mut dyn LocalStore,
    observers: Vec<Box<dyn SyncObserver + 'a>>,
    state: RunState,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a Config, api: &'a dyn RemoteApi, store: &'a mut dyn LocalStore) -> Self {
        Self {
            config,
            api,
            store,
            observers: Vec::new(),
            state: RunState::NotStarted,
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn SyncObserver + 'a>) {
        self.observers.push(observer);
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Runs with the policy selected by the configuration's debug flag.
    pub fn run(&mut self, mode: RunMode) -> Result<RunReport> {
        let mut policy = for_debug_flag(self.config.debug);
        self.run_with(mode, policy.as_mut())
    }

    #[instrument(level = "info", skip_all, fields(?mode, policy = policy.name()))]
    pub fn run_with(&mut self, mode: RunMode, policy: &mut dyn FailurePolicy) -> Result<RunReport> {
        let config = self.config;
        let api = self.api;
        let state = &mut self.state;

        let kinds = match plan(config, mode) {
            Ok(kinds) => kinds,
            Err(error) => {
                *state = RunState::Aborted(Failure::new(&Boundary::Run, &error));
                return Err(error);
            }
        };
        info!(kinds = ?kinds, "starting import");

        let mut steps: Vec<ReconcileReport> = Vec::new();
        let mut context = RunContext::default();
        let outcome = guard(policy, &mut *self.store, &Boundary::Run, |store, policy| {
            for kind in &kinds {
                *state = RunState::Running(*kind);
                let reconciler = Reconciler::new(config, *kind)?;
                let step = guard(policy, store, &Boundary::Step(*kind), |store, policy| {
                    reconciler.run(api, store, policy, &context)
                })?;
                if let Some(step) = step {
                    steps.push(step);
                }
                // A failed step still counts as reconciled so its dependents
                // report missing targets row by row.
                context.reconciled.insert(*kind);
            }
            Ok(())
        });

        if let Err(error) = outcome {
            let boundary = match state {
                RunState::Running(kind) => Boundary::Step(*kind),
                _ => Boundary::Run,
            };
            let failure = Failure::new(&boundary, &error);
            warn!(error_kind = %failure.error_kind, message = %failure.message, "import aborted");
            *state = RunState::Aborted(failure);
            return Err(error);
        }

        let report = RunReport {
            mode,
            policy: policy.name(),
            steps,
            failures: policy.failures().to_vec(),
        };
        *state = if report.failures.is_empty() {
            RunState::Completed
        } else {
            RunState::CompletedWithErrors(report.failures.clone())
        };
        info!(
            steps = report.steps.len(),
            failures = report.failures.len(),
            "import finished"
        );

        let changed = report.changed_kinds();
        if !changed.is_empty() {
            for observer in self.observers.iter_mut() {
                observer.entities_changed(&changed);
            }
        }
        Ok(report)
    }
}
