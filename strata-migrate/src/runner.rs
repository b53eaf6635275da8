//! Transactional migration runner.
//!
//! Drives a registry of change units against a live database: takes the
//! advisory lock, diffs registry versions against the applied set, and runs
//! each pending unit inside its own transaction. The bookkeeping insert or
//! delete shares that transaction, so a unit and its history record commit
//! or roll back together. The first failing unit aborts the batch; units
//! already committed stay committed.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::access::SchemaAccess;
use crate::error::{MigrateResult, MigrationError};
use crate::registry::MigrationRegistry;
use crate::state::{MigrationRecord, StateTracker};

/// Advisory lock key claimed for the duration of a batch. Shared by every
/// process migrating the same database.
pub const DEFAULT_LOCK_KEY: i64 = 0x7374_7261_7461;

/// Runner tuning knobs.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Advisory lock key; override when several independent schemas share
    /// one database.
    pub lock_key: i64,
    /// Per-unit wall-clock budget. A unit exceeding it is rolled back and
    /// the batch aborts with [`MigrationError::MigrationTimedOut`].
    pub unit_timeout: Option<Duration>,
    /// Plan and report without executing any unit.
    pub dry_run: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            lock_key: DEFAULT_LOCK_KEY,
            unit_timeout: None,
            dry_run: false,
        }
    }
}

impl RunnerConfig {
    pub fn lock_key(mut self, key: i64) -> Self {
        self.lock_key = key;
        self
    }

    pub fn unit_timeout(mut self, timeout: Duration) -> Self {
        self.unit_timeout = Some(timeout);
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Upper bound for an upward run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Apply every pending unit.
    Latest,
    /// Apply pending units up to and including this version.
    Version(i64),
}

/// Outcome of a completed batch.
#[derive(Debug, Clone)]
pub struct MigrationReport {
    /// Versions applied or reverted, in execution order.
    pub versions: Vec<i64>,
    pub duration_ms: u128,
    pub warnings: Vec<String>,
}

impl MigrationReport {
    pub fn summary(&self) -> String {
        if self.versions.is_empty() {
            "nothing to do".to_string()
        } else {
            format!(
                "{} unit(s) in {} ms: {}",
                self.versions.len(),
                self.duration_ms,
                self.versions
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        }
    }
}

/// Applied and pending versions as currently recorded.
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub applied: Vec<MigrationRecord>,
    pub pending: Vec<i64>,
}

pub struct MigrationRunner<'a> {
    registry: &'a MigrationRegistry,
    access: &'a dyn SchemaAccess,
    config: RunnerConfig,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(registry: &'a MigrationRegistry, access: &'a dyn SchemaAccess) -> Self {
        Self::with_config(registry, access, RunnerConfig::default())
    }

    pub fn with_config(
        registry: &'a MigrationRegistry,
        access: &'a dyn SchemaAccess,
        config: RunnerConfig,
    ) -> Self {
        Self {
            registry,
            access,
            config,
        }
    }

    /// Apply every pending unit up to `target`, in ascending version order.
    pub async fn up_to(&self, target: Target) -> MigrateResult<MigrationReport> {
        self.locked(|| self.run_up(target)).await
    }

    /// Apply every pending unit.
    pub async fn up(&self) -> MigrateResult<MigrationReport> {
        self.up_to(Target::Latest).await
    }

    /// Revert applied units above `target`, newest first. `target` itself
    /// stays applied; 0 reverts everything.
    pub async fn down_to(&self, target: i64) -> MigrateResult<MigrationReport> {
        self.locked(|| self.run_down(target)).await
    }

    /// Applied records and pending versions. Takes no lock; the answer is a
    /// point-in-time snapshot.
    pub async fn status(&self) -> MigrateResult<MigrationStatus> {
        let tracker = StateTracker::new(self.access);
        tracker.ensure_table().await?;
        let applied = tracker.applied_records().await?;
        let applied_set: BTreeSet<i64> = applied.iter().map(|r| r.version).collect();
        let pending = self
            .registry
            .ordered_versions()
            .into_iter()
            .filter(|v| !applied_set.contains(v))
            .collect();
        Ok(MigrationStatus { applied, pending })
    }

    async fn locked<F, Fut>(&self, body: F) -> MigrateResult<MigrationReport>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = MigrateResult<MigrationReport>>,
    {
        if !self.access.try_advisory_lock(self.config.lock_key).await? {
            return Err(MigrationError::MigrationInProgress);
        }
        let outcome = body().await;
        // Lock release is best-effort; a dropped session releases it anyway.
        if let Err(release) = self.access.release_advisory_lock(self.config.lock_key).await {
            warn!(error = %release, "failed to release advisory lock");
        }
        outcome
    }

    async fn run_up(&self, target: Target) -> MigrateResult<MigrationReport> {
        let started = Instant::now();
        let tracker = StateTracker::new(self.access);
        tracker.ensure_table().await?;
        let applied = tracker.applied_versions().await?;

        let pending: Vec<i64> = self
            .registry
            .ordered_versions()
            .into_iter()
            .filter(|v| !applied.contains(v))
            .filter(|v| match target {
                Target::Latest => true,
                Target::Version(bound) => *v <= bound,
            })
            .collect();

        let mut report = MigrationReport {
            versions: Vec::new(),
            duration_ms: 0,
            warnings: Vec::new(),
        };

        for version in pending {
            let unit = self.registry.lookup(version)?;
            if self.config.dry_run {
                report
                    .warnings
                    .push(format!("[DRY RUN] would apply {version} {}", unit.name()));
                report.versions.push(version);
                continue;
            }
            info!(version, name = unit.name(), "applying");
            self.apply_unit(version, Direction::Up).await?;
            report.versions.push(version);
        }

        report.duration_ms = started.elapsed().as_millis();
        info!(summary = %report.summary(), "migration batch complete");
        Ok(report)
    }

    async fn run_down(&self, target: i64) -> MigrateResult<MigrationReport> {
        let started = Instant::now();
        let tracker = StateTracker::new(self.access);
        tracker.ensure_table().await?;
        let applied = tracker.applied_versions().await?;

        let reverting: Vec<i64> = applied.into_iter().filter(|v| *v > target).rev().collect();

        // Refuse up front rather than stopping half-way through the batch.
        for version in &reverting {
            let unit = self.registry.lookup(*version)?;
            if !unit.reversible() {
                return Err(MigrationError::IrreversibleMigration {
                    version: *version,
                    name: unit.name().to_string(),
                });
            }
        }

        let mut report = MigrationReport {
            versions: Vec::new(),
            duration_ms: 0,
            warnings: Vec::new(),
        };

        for version in reverting {
            let unit = self.registry.lookup(version)?;
            if self.config.dry_run {
                report
                    .warnings
                    .push(format!("[DRY RUN] would revert {version} {}", unit.name()));
                report.versions.push(version);
                continue;
            }
            info!(version, name = unit.name(), "reverting");
            self.apply_unit(version, Direction::Down).await?;
            report.versions.push(version);
        }

        report.duration_ms = started.elapsed().as_millis();
        info!(summary = %report.summary(), "migration batch complete");
        Ok(report)
    }

    /// One unit, one transaction: schema work and the bookkeeping row commit
    /// together or not at all.
    async fn apply_unit(&self, version: i64, direction: Direction) -> MigrateResult<()> {
        let unit = self.registry.lookup(version)?;
        let ctx = crate::change::MigrationCtx::new(self.access);
        let tracker = StateTracker::new(self.access);

        self.access.begin().await?;

        let work = async {
            match direction {
                Direction::Up => {
                    unit.up(&ctx).await?;
                    tracker.record_applied(version, unit.name()).await
                }
                Direction::Down => {
                    unit.down(&ctx).await?;
                    tracker.record_reverted(version).await
                }
            }
        };

        let outcome = match self.config.unit_timeout {
            Some(budget) => match tokio::time::timeout(budget, work).await {
                Ok(inner) => inner,
                Err(_) => Err(MigrationError::MigrationTimedOut {
                    version,
                    elapsed_ms: budget.as_millis() as u64,
                }),
            },
            None => work.await,
        };

        match outcome {
            Ok(()) => self.access.commit().await,
            Err(cause) => {
                error!(version, name = unit.name(), error = %cause, "unit failed, rolling back");
                if let Err(rollback) = self.access.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                match cause {
                    timeout @ MigrationError::MigrationTimedOut { .. } => Err(timeout),
                    other => Err(MigrationError::UnitFailed {
                        version,
                        name: unit.name().to_string(),
                        source: Box::new(other),
                    }),
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Up,
    Down,
}
