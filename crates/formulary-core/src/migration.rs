//! Ordered, re-entrant schema migration steps and their runner.
//!
//! Every step carries an explicit precondition (`Guard`) evaluated against
//! the live schema, so a second run, or a run resumed after a crash, turns
//! already-applied steps into no-ops instead of errors. The runner records
//! each step in a ledger and halts on the first failure; there is no
//! cross-step rollback.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Precondition that must hold for a step's forward action to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// Always run; the statement is itself idempotent.
    Always,
    TableAbsent { table: &'static str },
    TablePresent { table: &'static str },
    ColumnAbsent { table: &'static str, column: &'static str },
    ColumnPresent { table: &'static str, column: &'static str },
    IndexAbsent { index: &'static str },
    ConstraintAbsent { table: &'static str, constraint: &'static str },
    ConstraintNotValidated { table: &'static str, constraint: &'static str },
    /// `from` exists and `to` does not.
    TableRenamable { from: &'static str, to: &'static str },
    /// `from` exists on `table` and `to` does not.
    ColumnRenamable {
        table: &'static str,
        from: &'static str,
        to: &'static str,
    },
}

/// A single schema change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    CreateTable {
        table: &'static str,
        definition: &'static str,
    },
    AddColumn {
        table: &'static str,
        column: &'static str,
        definition: &'static str,
    },
    CreateIndex {
        index: &'static str,
        table: &'static str,
        unique: bool,
        definition: &'static str,
    },
    AddConstraint {
        table: &'static str,
        constraint: &'static str,
        definition: &'static str,
    },
    ValidateConstraint {
        table: &'static str,
        constraint: &'static str,
    },
    RenameTable {
        from: &'static str,
        to: &'static str,
    },
    RenameColumn {
        table: &'static str,
        from: &'static str,
        to: &'static str,
    },
    DropColumn {
        table: &'static str,
        column: &'static str,
    },
    DropTable {
        table: &'static str,
    },
    /// Free-form statement with its own guard.
    Statement { sql: &'static str, guard: Guard },
}

impl SchemaChange {
    /// Precondition derived from the change itself.
    pub fn guard(&self) -> Guard {
        match *self {
            Self::CreateTable { table, .. } => Guard::TableAbsent { table },
            Self::AddColumn { table, column, .. } => Guard::ColumnAbsent { table, column },
            Self::CreateIndex { index, .. } => Guard::IndexAbsent { index },
            Self::AddConstraint {
                table, constraint, ..
            } => Guard::ConstraintAbsent { table, constraint },
            Self::ValidateConstraint { table, constraint } => {
                Guard::ConstraintNotValidated { table, constraint }
            }
            Self::RenameTable { from, to } => Guard::TableRenamable { from, to },
            Self::RenameColumn { table, from, to } => Guard::ColumnRenamable { table, from, to },
            Self::DropColumn { table, column } => Guard::ColumnPresent { table, column },
            Self::DropTable { table } => Guard::TablePresent { table },
            Self::Statement { ref guard, .. } => guard.clone(),
        }
    }

    /// Whether the change can destroy data.
    pub fn is_destructive(&self) -> bool {
        matches!(self, Self::DropColumn { .. } | Self::DropTable { .. })
    }

    /// SQL for the forward action.
    pub fn to_sql(&self) -> String {
        match self {
            Self::CreateTable { table, definition } => {
                format!("CREATE TABLE {} ({})", table, definition)
            }
            Self::AddColumn {
                table,
                column,
                definition,
            } => format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition),
            Self::CreateIndex {
                index,
                table,
                unique,
                definition,
            } => format!(
                "CREATE {}INDEX {} ON {} {}",
                if *unique { "UNIQUE " } else { "" },
                index,
                table,
                definition
            ),
            Self::AddConstraint {
                table,
                constraint,
                definition,
            } => format!(
                "ALTER TABLE {} ADD CONSTRAINT {} {}",
                table, constraint, definition
            ),
            Self::ValidateConstraint { table, constraint } => {
                format!("ALTER TABLE {} VALIDATE CONSTRAINT {}", table, constraint)
            }
            Self::RenameTable { from, to } => format!("ALTER TABLE {} RENAME TO {}", from, to),
            Self::RenameColumn { table, from, to } => {
                format!("ALTER TABLE {} RENAME COLUMN {} TO {}", table, from, to)
            }
            Self::DropColumn { table, column } => {
                format!("ALTER TABLE {} DROP COLUMN {}", table, column)
            }
            Self::DropTable { table } => format!("DROP TABLE {}", table),
            Self::Statement { sql, .. } => sql.to_string(),
        }
    }
}

/// An ordered, named unit of schema change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStep {
    pub name: &'static str,
    pub description: &'static str,
    pub change: SchemaChange,
    /// Steps that must precede this one. Destructive steps must name the
    /// steps that moved data off what they drop.
    pub requires: &'static [&'static str],
}

impl MigrationStep {
    pub const fn new(name: &'static str, description: &'static str, change: SchemaChange) -> Self {
        Self {
            name,
            description,
            change,
            requires: &[],
        }
    }

    pub const fn requires(mut self, requires: &'static [&'static str]) -> Self {
        self.requires = requires;
        self
    }
}

/// Ledger state of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Applying,
    Applied,
    Failed,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Applied | Self::Failed)
    }

    /// Allowed ledger transitions. `Applying -> Applying` resumes a step whose
    /// process died; `Failed -> Pending` is the administrative reset.
    pub fn can_transition(&self, to: StepState) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Applying)
                | (Self::Applying, Self::Applying)
                | (Self::Applying, Self::Applied)
                | (Self::Applying, Self::Failed)
                | (Self::Failed, Self::Pending)
        )
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "applying" => Ok(Self::Applying),
            "applied" => Ok(Self::Applied),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Internal(format!("unknown step state '{}'", other))),
        }
    }
}

/// An ordered list of steps.
#[derive(Debug, Clone, Default)]
pub struct MigrationPlan {
    pub name: &'static str,
    pub steps: Vec<MigrationStep>,
}

impl MigrationPlan {
    pub fn new(name: &'static str, steps: Vec<MigrationStep>) -> Self {
        Self { name, steps }
    }

    /// Check ordering constraints.
    ///
    /// `prior` names steps from plans that always run before this one.
    pub fn validate(&self, prior: &[&str]) -> Result<()> {
        let mut seen: HashSet<&str> = prior.iter().copied().collect();
        for step in &self.steps {
            if step.change.is_destructive() && step.requires.is_empty() {
                return Err(Error::Config(format!(
                    "destructive step '{}' must declare the steps it depends on",
                    step.name
                )));
            }
            for dep in step.requires {
                if !seen.contains(dep) {
                    return Err(Error::Config(format!(
                        "step '{}' requires '{}', which does not run before it",
                        step.name, dep
                    )));
                }
            }
            if !seen.insert(step.name) {
                return Err(Error::Config(format!(
                    "step '{}' is declared twice",
                    step.name
                )));
            }
        }
        Ok(())
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name).collect()
    }
}

/// Storage side of the runner: schema introspection, ledger, execution.
#[async_trait]
pub trait MigrationExecutor: Send + Sync {
    /// Create the ledger if absent.
    async fn ensure_ledger(&self) -> Result<()>;

    /// Ledger state of a step; `None` if never recorded.
    async fn step_state(&self, name: &str) -> Result<Option<StepState>>;

    /// Record a step's state, with the error text for failures.
    async fn record_state(&self, name: &str, state: StepState, error: Option<&str>)
        -> Result<()>;

    /// Whether the guard permits the forward action.
    async fn guard_allows(&self, guard: &Guard) -> Result<bool>;

    /// Execute the forward action, atomically where the store allows.
    async fn apply(&self, step: &MigrationStep) -> Result<()>;

    /// Take an exclusive lock around the whole run.
    async fn acquire_lock(&self) -> Result<()> {
        Ok(())
    }

    async fn release_lock(&self) -> Result<()> {
        Ok(())
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Forward action executed.
    pub applied: Vec<String>,
    /// Guard showed the change already in place.
    pub already_satisfied: Vec<String>,
    /// Ledger already marked applied.
    pub skipped: Vec<String>,
}

impl RunSummary {
    fn merge(&mut self, other: RunSummary) {
        self.applied.extend(other.applied);
        self.already_satisfied.extend(other.already_satisfied);
        self.skipped.extend(other.skipped);
    }
}

/// Applies plans in order through an executor.
pub struct MigrationRunner<'a, E: MigrationExecutor + ?Sized> {
    executor: &'a E,
    use_lock: bool,
}

impl<'a, E: MigrationExecutor + ?Sized> MigrationRunner<'a, E> {
    pub fn new(executor: &'a E) -> Self {
        Self {
            executor,
            use_lock: true,
        }
    }

    pub fn with_lock(mut self, use_lock: bool) -> Self {
        self.use_lock = use_lock;
        self
    }

    /// Run one plan.
    pub async fn run(&self, plan: &MigrationPlan) -> Result<RunSummary> {
        self.run_all(std::slice::from_ref(plan)).await
    }

    /// Run several plans in order under one lock.
    pub async fn run_all(&self, plans: &[MigrationPlan]) -> Result<RunSummary> {
        self.run_after(&[], plans).await
    }

    /// Run `plans` on a schema where `earlier` already ran.
    ///
    /// `earlier` only satisfies step dependencies; its steps are not executed.
    pub async fn run_after(
        &self,
        earlier: &[MigrationPlan],
        plans: &[MigrationPlan],
    ) -> Result<RunSummary> {
        let mut prior: Vec<&str> = earlier.iter().flat_map(|p| p.step_names()).collect();
        for plan in plans {
            plan.validate(&prior)?;
            prior.extend(plan.step_names());
        }

        if self.use_lock {
            self.executor.acquire_lock().await?;
        }
        let result = self.run_unlocked(plans).await;
        if self.use_lock {
            if let Err(e) = self.executor.release_lock().await {
                warn!(
                    subsystem = "migration",
                    component = "runner",
                    error = %e,
                    "Failed to release migration lock"
                );
            }
        }
        result
    }

    async fn run_unlocked(&self, plans: &[MigrationPlan]) -> Result<RunSummary> {
        let start = Instant::now();
        self.executor.ensure_ledger().await?;

        let mut summary = RunSummary::default();
        for plan in plans {
            let mut plan_summary = RunSummary::default();
            for step in &plan.steps {
                self.run_step(step, &mut plan_summary).await?;
            }
            info!(
                subsystem = "migration",
                component = "runner",
                op = "run_plan",
                plan = plan.name,
                applied = plan_summary.applied.len(),
                already_satisfied = plan_summary.already_satisfied.len(),
                skipped = plan_summary.skipped.len(),
                "Migration plan complete"
            );
            summary.merge(plan_summary);
        }

        info!(
            subsystem = "migration",
            component = "runner",
            op = "run",
            duration_ms = start.elapsed().as_millis() as u64,
            result_count = summary.applied.len(),
            "Migrations complete"
        );
        Ok(summary)
    }

    async fn run_step(&self, step: &MigrationStep, summary: &mut RunSummary) -> Result<()> {
        match self.executor.step_state(step.name).await? {
            Some(StepState::Applied) => {
                debug!(
                    subsystem = "migration",
                    component = "runner",
                    step = step.name,
                    "Step already applied"
                );
                summary.skipped.push(step.name.to_string());
                return Ok(());
            }
            Some(StepState::Failed) => {
                error!(
                    subsystem = "migration",
                    component = "runner",
                    step = step.name,
                    "Step left failed by an earlier run; reset it before re-running"
                );
                return Err(Error::MigrationStepFailed {
                    step: step.name.to_string(),
                    source: Box::new(Error::Internal(
                        "step is marked failed in the ledger".to_string(),
                    )),
                });
            }
            Some(StepState::Applying) => {
                warn!(
                    subsystem = "migration",
                    component = "runner",
                    step = step.name,
                    "Resuming step interrupted mid-apply"
                );
            }
            Some(StepState::Pending) | None => {}
        }

        self.executor
            .record_state(step.name, StepState::Applying, None)
            .await?;

        let guard = step.change.guard();
        let outcome = match self.executor.guard_allows(&guard).await {
            Ok(false) => {
                debug!(
                    subsystem = "migration",
                    component = "runner",
                    step = step.name,
                    "Guard satisfied, change already present"
                );
                self.executor
                    .record_state(step.name, StepState::Applied, None)
                    .await?;
                summary.already_satisfied.push(step.name.to_string());
                return Ok(());
            }
            Ok(true) => {
                let started = Instant::now();
                self.executor.apply(step).await.map(|_| started)
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(started) => {
                self.executor
                    .record_state(step.name, StepState::Applied, None)
                    .await?;
                info!(
                    subsystem = "migration",
                    component = "runner",
                    step = step.name,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "{}",
                    step.description
                );
                summary.applied.push(step.name.to_string());
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(record_err) = self
                    .executor
                    .record_state(step.name, StepState::Failed, Some(&message))
                    .await
                {
                    warn!(
                        subsystem = "migration",
                        component = "runner",
                        step = step.name,
                        error = %record_err,
                        "Could not record step failure"
                    );
                }
                error!(
                    subsystem = "migration",
                    component = "runner",
                    step = step.name,
                    error = %message,
                    "Migration step failed, halting"
                );
                Err(Error::MigrationStepFailed {
                    step: step.name.to_string(),
                    source: Box::new(e),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Executor over a set of named schema objects.
    #[derive(Default)]
    struct FakeSchema {
        objects: Mutex<HashSet<String>>,
        ledger: Mutex<HashMap<String, (StepState, Option<String>)>>,
        applied: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
        locks: Mutex<Vec<&'static str>>,
    }

    impl FakeSchema {
        fn with_objects(objects: &[&str]) -> Self {
            Self {
                objects: Mutex::new(objects.iter().map(|s| s.to_string()).collect()),
                ..Default::default()
            }
        }

        fn has(&self, name: &str) -> bool {
            self.objects.lock().unwrap().contains(name)
        }

        fn state(&self, name: &str) -> Option<StepState> {
            self.ledger.lock().unwrap().get(name).map(|(s, _)| *s)
        }
    }

    #[async_trait]
    impl MigrationExecutor for FakeSchema {
        async fn ensure_ledger(&self) -> Result<()> {
            Ok(())
        }

        async fn step_state(&self, name: &str) -> Result<Option<StepState>> {
            Ok(self.state(name))
        }

        async fn record_state(
            &self,
            name: &str,
            state: StepState,
            error: Option<&str>,
        ) -> Result<()> {
            self.ledger
                .lock()
                .unwrap()
                .insert(name.to_string(), (state, error.map(str::to_string)));
            Ok(())
        }

        async fn guard_allows(&self, guard: &Guard) -> Result<bool> {
            Ok(match guard {
                Guard::Always => true,
                Guard::TableAbsent { table } => !self.has(table),
                Guard::TablePresent { table } => self.has(table),
                Guard::ColumnAbsent { table, column } => !self.has(&format!("{table}.{column}")),
                Guard::ColumnPresent { table, column } => self.has(&format!("{table}.{column}")),
                Guard::IndexAbsent { index } => !self.has(index),
                Guard::ConstraintAbsent { constraint, .. } => !self.has(constraint),
                Guard::ConstraintNotValidated { constraint, .. } => {
                    !self.has(&format!("{constraint}:valid"))
                }
                Guard::TableRenamable { from, to } => self.has(from) && !self.has(to),
                Guard::ColumnRenamable { table, from, to } => {
                    self.has(&format!("{table}.{from}")) && !self.has(&format!("{table}.{to}"))
                }
            })
        }

        async fn apply(&self, step: &MigrationStep) -> Result<()> {
            if self.fail_on == Some(step.name) {
                return Err(Error::Internal("relation does not exist".into()));
            }
            let mut objects = self.objects.lock().unwrap();
            match &step.change {
                SchemaChange::CreateTable { table, .. } => {
                    objects.insert(table.to_string());
                }
                SchemaChange::AddColumn { table, column, .. } => {
                    objects.insert(format!("{table}.{column}"));
                }
                SchemaChange::CreateIndex { index, .. } => {
                    objects.insert(index.to_string());
                }
                SchemaChange::AddConstraint { constraint, .. } => {
                    objects.insert(constraint.to_string());
                }
                SchemaChange::ValidateConstraint { constraint, .. } => {
                    objects.insert(format!("{constraint}:valid"));
                }
                SchemaChange::RenameTable { from, to } => {
                    objects.remove(*from);
                    objects.insert(to.to_string());
                }
                SchemaChange::RenameColumn { table, from, to } => {
                    objects.remove(&format!("{table}.{from}"));
                    objects.insert(format!("{table}.{to}"));
                }
                SchemaChange::DropColumn { table, column } => {
                    objects.remove(&format!("{table}.{column}"));
                }
                SchemaChange::DropTable { table } => {
                    objects.remove(*table);
                }
                SchemaChange::Statement { .. } => {}
            }
            self.applied.lock().unwrap().push(step.name.to_string());
            Ok(())
        }

        async fn acquire_lock(&self) -> Result<()> {
            self.locks.lock().unwrap().push("acquire");
            Ok(())
        }

        async fn release_lock(&self) -> Result<()> {
            self.locks.lock().unwrap().push("release");
            Ok(())
        }
    }

    fn plan() -> MigrationPlan {
        MigrationPlan::new(
            "test",
            vec![
                MigrationStep::new(
                    "rename_formula_table",
                    "Rename legacy formula table",
                    SchemaChange::RenameTable {
                        from: "formula",
                        to: "tbl_formula",
                    },
                ),
                MigrationStep::new(
                    "rename_formula_id",
                    "Rename id to formula_id",
                    SchemaChange::RenameColumn {
                        table: "tbl_formula",
                        from: "id",
                        to: "formula_id",
                    },
                ),
                MigrationStep::new(
                    "add_formula_handle",
                    "Add formula handle column",
                    SchemaChange::AddColumn {
                        table: "tbl_formula",
                        column: "formula_handle",
                        definition: "VARCHAR(100)",
                    },
                ),
                MigrationStep::new(
                    "uq_formula_handle",
                    "Sparse unique formula handle",
                    SchemaChange::CreateIndex {
                        index: "uq_formula_handle",
                        table: "tbl_formula",
                        unique: true,
                        definition: "(formula_handle) WHERE formula_handle IS NOT NULL",
                    },
                ),
            ],
        )
    }

    #[tokio::test]
    async fn test_run_applies_in_order_and_records_ledger() {
        let schema = FakeSchema::with_objects(&["formula", "tbl_formula.id"]);
        let summary = MigrationRunner::new(&schema).run(&plan()).await.unwrap();

        assert_eq!(
            *schema.applied.lock().unwrap(),
            vec![
                "rename_formula_table",
                "rename_formula_id",
                "add_formula_handle",
                "uq_formula_handle"
            ]
        );
        assert_eq!(summary.applied.len(), 4);
        assert_eq!(schema.state("uq_formula_handle"), Some(StepState::Applied));
        assert!(schema.has("tbl_formula.formula_handle"));
        assert_eq!(*schema.locks.lock().unwrap(), vec!["acquire", "release"]);
    }

    #[tokio::test]
    async fn test_second_run_is_a_noop() {
        let schema = FakeSchema::with_objects(&["formula", "tbl_formula.id"]);
        let runner = MigrationRunner::new(&schema);
        runner.run(&plan()).await.unwrap();
        let second = runner.run(&plan()).await.unwrap();

        assert!(second.applied.is_empty());
        assert_eq!(second.skipped.len(), 4);
        assert_eq!(schema.applied.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_guards_skip_changes_already_present_without_ledger() {
        // Schema migrated by hand before the ledger existed.
        let schema = FakeSchema::with_objects(&[
            "tbl_formula",
            "tbl_formula.formula_id",
            "tbl_formula.formula_handle",
        ]);
        let summary = MigrationRunner::new(&schema).run(&plan()).await.unwrap();

        assert_eq!(summary.applied, vec!["uq_formula_handle".to_string()]);
        assert_eq!(summary.already_satisfied.len(), 3);
    }

    #[tokio::test]
    async fn test_failure_halts_and_marks_step_failed() {
        let schema = FakeSchema {
            fail_on: Some("add_formula_handle"),
            ..FakeSchema::with_objects(&["formula", "tbl_formula.id"])
        };
        let err = MigrationRunner::new(&schema).run(&plan()).await.unwrap_err();

        match &err {
            Error::MigrationStepFailed { step, source } => {
                assert_eq!(step, "add_formula_handle");
                assert!(source.to_string().contains("relation does not exist"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(schema.state("add_formula_handle"), Some(StepState::Failed));
        assert_eq!(schema.state("uq_formula_handle"), None);
        // Lock released even on failure.
        assert_eq!(*schema.locks.lock().unwrap(), vec!["acquire", "release"]);
    }

    #[tokio::test]
    async fn test_failed_step_blocks_later_runs_until_reset() {
        let schema = FakeSchema::with_objects(&["formula", "tbl_formula.id"]);
        schema
            .record_state("rename_formula_id", StepState::Failed, Some("boom"))
            .await
            .unwrap();

        let err = MigrationRunner::new(&schema).run(&plan()).await.unwrap_err();
        assert!(matches!(err, Error::MigrationStepFailed { ref step, .. } if step == "rename_formula_id"));
        assert_eq!(*schema.applied.lock().unwrap(), vec!["rename_formula_table"]);

        schema
            .record_state("rename_formula_id", StepState::Pending, None)
            .await
            .unwrap();
        let summary = MigrationRunner::new(&schema).run(&plan()).await.unwrap();
        assert_eq!(summary.applied.len(), 3);
    }

    #[tokio::test]
    async fn test_interrupted_step_resumes_through_guard() {
        let schema = FakeSchema::with_objects(&["tbl_formula", "tbl_formula.formula_id"]);
        schema
            .record_state("rename_formula_table", StepState::Applied, None)
            .await
            .unwrap();
        schema
            .record_state("rename_formula_id", StepState::Applying, None)
            .await
            .unwrap();

        let summary = MigrationRunner::new(&schema)
            .with_lock(false)
            .run(&plan())
            .await
            .unwrap();
        assert_eq!(summary.already_satisfied, vec!["rename_formula_id".to_string()]);
        assert!(schema.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_after_satisfies_dependencies_without_running_earlier() {
        let schema = FakeSchema::with_objects(&["tbl_formula", "tbl_formula.formula_handle"]);
        let later = MigrationPlan::new(
            "later",
            vec![MigrationStep::new(
                "uq_formula_handle_late",
                "Sparse unique formula handle",
                SchemaChange::CreateIndex {
                    index: "uq_formula_handle",
                    table: "tbl_formula",
                    unique: true,
                    definition: "(formula_handle) WHERE formula_handle IS NOT NULL",
                },
            )
            .requires(&["add_formula_handle"])],
        );
        let runner = MigrationRunner::new(&schema);
        assert!(runner.run(&later).await.is_err());

        let summary = runner
            .run_after(std::slice::from_ref(&plan()), std::slice::from_ref(&later))
            .await
            .unwrap();
        assert_eq!(summary.applied, vec!["uq_formula_handle_late".to_string()]);
        assert_eq!(schema.state("add_formula_handle"), None);
    }

    #[test]
    fn test_destructive_step_needs_requires() {
        let drop = MigrationStep::new(
            "drop_legacy_topic",
            "Drop legacy topic column",
            SchemaChange::DropColumn {
                table: "tbl_formula",
                column: "topic",
            },
        );
        let bad = MigrationPlan::new("bad", vec![drop.clone()]);
        assert!(bad.validate(&[]).is_err());

        let out_of_order = MigrationPlan::new(
            "bad",
            vec![drop.clone().requires(&["backfill_topic_handle"])],
        );
        assert!(out_of_order.validate(&[]).is_err());
        assert!(out_of_order.validate(&["backfill_topic_handle"]).is_ok());
    }

    #[test]
    fn test_duplicate_step_names_rejected() {
        let mut steps = plan().steps;
        steps.push(steps[0].clone());
        assert!(MigrationPlan::new("dup", steps).validate(&[]).is_err());
    }

    #[test]
    fn test_sql_rendering() {
        let idx = SchemaChange::CreateIndex {
            index: "uq_term_handle",
            table: "tbl_term",
            unique: true,
            definition: "(term_handle) WHERE term_handle IS NOT NULL",
        };
        assert_eq!(
            idx.to_sql(),
            "CREATE UNIQUE INDEX uq_term_handle ON tbl_term (term_handle) WHERE term_handle IS NOT NULL"
        );
        assert_eq!(
            SchemaChange::RenameColumn {
                table: "tbl_formula",
                from: "id",
                to: "formula_id"
            }
            .to_sql(),
            "ALTER TABLE tbl_formula RENAME COLUMN id TO formula_id"
        );
    }

    #[test]
    fn test_state_transitions() {
        assert!(StepState::Pending.can_transition(StepState::Applying));
        assert!(StepState::Applying.can_transition(StepState::Failed));
        assert!(!StepState::Applied.can_transition(StepState::Applying));
        assert!(!StepState::Failed.can_transition(StepState::Applying));
        assert!(StepState::Failed.can_transition(StepState::Pending));
        assert_eq!("applied".parse::<StepState>().unwrap(), StepState::Applied);
    }
}
