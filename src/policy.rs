//! Failure regimes applied around runs, steps and rows.

use tracing::warn;

use crate::error::{ErrorKind, Result, SyncError};
use crate::io::store::LocalStore;
use crate::model::EntityKind;

/// A unit of work that a policy may wrap in its own transactional scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Boundary {
    Run,
    Step(EntityKind),
    Row {
        kind: EntityKind,
        external_id: String,
    },
}

impl Boundary {
    fn scope(&self) -> &'static str {
        match self {
            Boundary::Run => "sync_run",
            Boundary::Step(_) => "sync_step",
            Boundary::Row { .. } => "sync_row",
        }
    }

    pub fn row(kind: EntityKind, external_id: impl Into<String>) -> Self {
        Boundary::Row {
            kind,
            external_id: external_id.into(),
        }
    }

    pub fn kind(&self) -> Option<EntityKind> {
        match self {
            Boundary::Run => None,
            Boundary::Step(kind) | Boundary::Row { kind, .. } => Some(*kind),
        }
    }

    pub fn external_id(&self) -> Option<&str> {
        match self {
            Boundary::Row { external_id, .. } => Some(external_id),
            _ => None,
        }
    }
}

/// An error recorded instead of aborting the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: Option<EntityKind>,
    pub external_id: Option<String>,
    pub error_kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn new(boundary: &Boundary, error: &SyncError) -> Self {
        Self {
            kind: boundary.kind(),
            external_id: boundary.external_id().map(str::to_string),
            error_kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Decides where transactional scopes go and what happens to errors.
pub trait FailurePolicy {
    fn name(&self) -> &'static str;

    /// Whether `boundary` gets its own scope that is rolled back on error.
    fn wraps(&self, boundary: &Boundary) -> bool;

    /// Handles an error raised inside `boundary`. Returning `Err` aborts the
    /// enclosing work.
    fn on_error(&mut self, boundary: &Boundary, error: SyncError) -> Result<()>;

    fn failures(&self) -> &[Failure];
}

/// Whole run in one scope; the first error rolls back and propagates.
#[derive(Debug, Default)]
pub struct Strict;

impl FailurePolicy for Strict {
    fn name(&self) -> &'static str {
        "strict"
    }

    fn wraps(&self, boundary: &Boundary) -> bool {
        *boundary == Boundary::Run
    }

    fn on_error(&mut self, _boundary: &Boundary, error: SyncError) -> Result<()> {
        Err(error)
    }

    fn failures(&self) -> &[Failure] {
        &[]
    }
}

/// Scopes per step and per row; non-fatal errors are collected.
#[derive(Debug, Default)]
pub struct Lenient {
    failures: Vec<Failure>,
}

impl FailurePolicy for Lenient {
    fn name(&self) -> &'static str {
        "lenient"
    }

    fn wraps(&self, boundary: &Boundary) -> bool {
        *boundary != Boundary::Run
    }

    fn on_error(&mut self, boundary: &Boundary, error: SyncError) -> Result<()> {
        if error.is_fatal() {
            return Err(error);
        }
        let failure = Failure::new(boundary, &error);
        warn!(
            kind = ?failure.kind,
            external_id = ?failure.external_id,
            error_kind = %failure.error_kind,
            message = %failure.message,
            "recorded failure and continuing"
        );
        self.failures.push(failure);
        Ok(())
    }

    fn failures(&self) -> &[Failure] {
        &self.failures
    }
}

/// Picks the policy driven by the debug flag.
pub fn for_debug_flag(debug: bool) -> Box<dyn FailurePolicy> {
    if debug {
        Box::new(Lenient::default())
    } else {
        Box::new(Strict)
    }
}

/// Runs `body` inside `boundary`. `Ok(None)` means the policy absorbed an
/// error and the boundary's writes were discarded.
pub fn guard<T>(
    policy: &mut dyn FailurePolicy,
    store: &mut dyn LocalStore,
    boundary: &Boundary,
    body: impl FnOnce(&mut dyn LocalStore, &mut dyn FailurePolicy) -> Result<T>,
) -> Result<Option<T>> {
    let scoped = policy.wraps(boundary);
    run_scoped(scoped, policy, store, boundary, body)
}

/// Like [`guard`], but always gives `boundary` its own scope. Used for work
/// with remote side effects, where an outer rollback would lose the local
/// record of writes that already happened.
pub fn isolate<T>(
    policy: &mut dyn FailurePolicy,
    store: &mut dyn LocalStore,
    boundary: &Boundary,
    body: impl FnOnce(&mut dyn LocalStore, &mut dyn FailurePolicy) -> Result<T>,
) -> Result<Option<T>> {
    run_scoped(true, policy, store, boundary, body)
}

fn run_scoped<T>(
    scoped: bool,
    policy: &mut dyn FailurePolicy,
    store: &mut dyn LocalStore,
    boundary: &Boundary,
    body: impl FnOnce(&mut dyn LocalStore, &mut dyn FailurePolicy) -> Result<T>,
) -> Result<Option<T>> {
    if scoped {
        store.begin(boundary.scope())?;
    }
    match body(&mut *store, &mut *policy) {
        Ok(value) => {
            if scoped {
                store.commit(boundary.scope())?;
            }
            Ok(Some(value))
        }
        Err(error) => {
            if scoped {
                store.rollback(boundary.scope())?;
            }
            policy.on_error(boundary, error)?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::store::SqliteStore;
    use crate::model::{Attributes, ExternalId, NewRecord};

    fn insert_role(store: &mut dyn LocalStore, id: &str) -> Result<()> {
        store.insert(&NewRecord::new(
            EntityKind::Role,
            Some(ExternalId::new(id)),
            Attributes::new(),
        ))?;
        Ok(())
    }

    fn row(id: &str) -> Boundary {
        Boundary::Row {
            kind: EntityKind::Role,
            external_id: id.to_string(),
        }
    }

    #[test]
    fn lenient_discards_only_the_failing_row() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let mut policy = Lenient::default();

        guard(&mut policy, &mut store, &row("1"), |store, _| insert_role(store, "1")).unwrap();
        let failed = guard(&mut policy, &mut store, &row("2"), |store, _| {
            insert_role(store, "2")?;
            Err::<(), _>(SyncError::RemoteApi("boom".into()))
        })
        .unwrap();

        assert!(failed.is_none());
        assert_eq!(store.records(EntityKind::Role).unwrap().len(), 1);
        assert_eq!(policy.failures().len(), 1);
        assert_eq!(policy.failures()[0].external_id.as_deref(), Some("2"));
        assert_eq!(policy.failures()[0].error_kind, ErrorKind::RemoteApi);
    }

    #[test]
    fn lenient_still_aborts_on_dependency_errors() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let mut policy = Lenient::default();

        let result = guard(&mut policy, &mut store, &Boundary::Step(EntityKind::Affiliation), |_, _| {
            Err::<(), _>(SyncError::DependencyOrder {
                kind: EntityKind::Affiliation,
                depends_on: EntityKind::Actor,
            })
        });

        assert!(matches!(result, Err(SyncError::DependencyOrder { .. })));
        assert!(policy.failures().is_empty());
    }

    #[test]
    fn strict_rolls_back_the_run_scope() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let mut policy = Strict;

        let result = guard(&mut policy, &mut store, &Boundary::Run, |store, policy| {
            guard(policy, store, &row("1"), |store, _| insert_role(store, "1"))?;
            guard(policy, store, &row("2"), |_, _| {
                Err::<(), _>(SyncError::RemoteApi("boom".into()))
            })
        });

        assert!(result.is_err());
        assert!(store.records(EntityKind::Role).unwrap().is_empty());
    }
}
