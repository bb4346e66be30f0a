//! Version migration for stored user models
//!
//! Compatibility analysis, staged migration plans, guarded execution with a
//! durable rollback anchor, and targeted repair of corrupted records. Every
//! attempt moves through an explicit state machine; durable state only
//! changes through the store's save/restore paths, so a failure before
//! persistence leaves the stored model untouched.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSeverity};
use crate::crypto::ENCRYPTION_METHOD;
use crate::model::{
    DataIntegrityCheck, IntegrityIssue, IssueKind, ModelDraft, ModelMetadata, ModelPayload,
    ModelPerformance, PerformanceImpact, UserModel, VersionTriple,
};
use crate::store::{ModelStore, StoreError};

/// Ceiling for a single step's estimated duration (10 minutes)
pub const MAX_STEP_DURATION_MS: u64 = 600_000;

/// Ceiling for a whole plan's estimated duration (15 minutes)
pub const MAX_PLAN_DURATION_MS: u64 = 900_000;

/// Terminal attempt records kept per manager; the oldest beyond this are
/// dropped when another attempt reaches a terminal state.
const MAX_RETAINED_TERMINAL: usize = 64;

const GATE_STEP_MS: u64 = 1_000;
const INTEGRITY_STEP_MS: u64 = 15_000;
const DATA_FORMAT_STEP_MS: u64 = 120_000;
const SCHEMA_STEP_MS: u64 = 60_000;
const STAMP_STEP_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Unknown migration plan: {0}")]
    UnknownPlan(String),

    #[error("Plan already executed: {0}")]
    PlanAlreadyExecuted(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// How involved a migration between two versions is
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MigrationComplexity {
    Simple,
    Moderate,
    Complex,
    Critical,
}

impl MigrationComplexity {
    /// Duration estimate for one migration of this complexity
    pub fn estimated_duration_ms(&self) -> u64 {
        match self {
            MigrationComplexity::Simple => 30_000,
            MigrationComplexity::Moderate => 120_000,
            MigrationComplexity::Complex => 300_000,
            MigrationComplexity::Critical => 600_000,
        }
    }

    pub fn baseline_risk(&self) -> RiskLevel {
        match self {
            MigrationComplexity::Simple => RiskLevel::Low,
            MigrationComplexity::Moderate => RiskLevel::Medium,
            MigrationComplexity::Complex => RiskLevel::High,
            MigrationComplexity::Critical => RiskLevel::Critical,
        }
    }
}

impl std::fmt::Display for MigrationComplexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MigrationComplexity::Simple => "simple",
            MigrationComplexity::Moderate => "moderate",
            MigrationComplexity::Complex => "complex",
            MigrationComplexity::Critical => "critical",
        };
        write!(f, "{}", name)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        write!(f, "{}", name)
    }
}

/// Lifecycle of one migration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Planned,
    Executing,
    Completed,
    Failed,
    RolledBack,
    Escalated,
}

impl MigrationState {
    /// Terminal states admit no further transitions. A failed attempt is
    /// not terminal: it can still be rolled back.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationState::Completed | MigrationState::RolledBack | MigrationState::Escalated
        )
    }
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MigrationState::Planned => "planned",
            MigrationState::Executing => "executing",
            MigrationState::Completed => "completed",
            MigrationState::Failed => "failed",
            MigrationState::RolledBack => "rolled_back",
            MigrationState::Escalated => "escalated",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of a pure source/target version comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilityAssessment {
    pub source_version: String,
    pub target_version: String,
    pub is_compatible: bool,
    pub migration_required: bool,
    pub migration_complexity: MigrationComplexity,
    pub risk_level: RiskLevel,
    pub compatibility_issues: Vec<String>,
    pub estimated_duration_ms: u64,
}

/// Compare two version strings. Pure: no stored state is consulted.
pub fn assess_compatibility(source_version: &str, target_version: &str) -> CompatibilityAssessment {
    let parsed_source = VersionTriple::parse(source_version);
    let parsed_target = VersionTriple::parse(target_version);

    let (Some(source), Some(target)) = (parsed_source, parsed_target) else {
        let mut issues = Vec::new();
        if parsed_source.is_none() {
            issues.push(format!("unparseable source version: {}", source_version));
        }
        if parsed_target.is_none() {
            issues.push(format!("unparseable target version: {}", target_version));
        }
        return CompatibilityAssessment {
            source_version: source_version.to_string(),
            target_version: target_version.to_string(),
            is_compatible: false,
            migration_required: false,
            migration_complexity: MigrationComplexity::Critical,
            risk_level: RiskLevel::Critical,
            compatibility_issues: issues,
            estimated_duration_ms: 0,
        };
    };

    if source == target {
        return CompatibilityAssessment {
            source_version: source_version.to_string(),
            target_version: target_version.to_string(),
            is_compatible: true,
            migration_required: false,
            migration_complexity: MigrationComplexity::Simple,
            risk_level: RiskLevel::Low,
            compatibility_issues: Vec::new(),
            estimated_duration_ms: 0,
        };
    }

    if source.major != target.major {
        let complexity = MigrationComplexity::Critical;
        return CompatibilityAssessment {
            source_version: source_version.to_string(),
            target_version: target_version.to_string(),
            is_compatible: false,
            migration_required: true,
            migration_complexity: complexity,
            risk_level: complexity.baseline_risk(),
            compatibility_issues: vec![format!(
                "major version change {} -> {} requires a coordinated upgrade",
                source, target
            )],
            estimated_duration_ms: complexity.estimated_duration_ms(),
        };
    }

    let minor_delta = source.minor.abs_diff(target.minor);
    let complexity = match minor_delta {
        0 => MigrationComplexity::Simple,
        1 => MigrationComplexity::Moderate,
        _ => MigrationComplexity::Complex,
    };

    let mut issues = Vec::new();
    if target < source {
        issues.push(format!(
            "downgrade within the {}.x line: {} -> {}",
            source.major, source, target
        ));
    }

    CompatibilityAssessment {
        source_version: source_version.to_string(),
        target_version: target_version.to_string(),
        is_compatible: true,
        migration_required: true,
        migration_complexity: complexity,
        risk_level: complexity.baseline_risk(),
        compatibility_issues: issues,
        estimated_duration_ms: complexity.estimated_duration_ms(),
    }
}

/// Kinds of work a migration step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    CompatibilityGate,
    IntegrityValidation,
    DataFormatUpgrade,
    SchemaUpdate,
    VersionStamp,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StepKind::CompatibilityGate => "compatibility_gate",
            StepKind::IntegrityValidation => "integrity_validation",
            StepKind::DataFormatUpgrade => "data_format_upgrade",
            StepKind::SchemaUpdate => "schema_update",
            StepKind::VersionStamp => "version_stamp",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStep {
    pub step_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub description: String,
    pub estimated_duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskKind {
    DataLoss,
    SystemInstability,
    Downgrade,
}

impl std::fmt::Display for RiskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RiskKind::DataLoss => "data_loss",
            RiskKind::SystemInstability => "system_instability",
            RiskKind::Downgrade => "downgrade",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskFactor {
    #[serde(rename = "type")]
    pub kind: RiskKind,
    pub severity: RiskLevel,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub risk_level: RiskLevel,
    pub risk_factors: Vec<RiskFactor>,
}

/// How stored data is protected while a migration runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataPreservation {
    /// A fresh snapshot is recorded before the first step runs
    PreMigrationBackup,
    /// The plan cannot execute; only already-recorded backups protect the data
    ExistingBackupsOnly,
}

impl std::fmt::Display for DataPreservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataPreservation::PreMigrationBackup => "pre_migration_backup",
            DataPreservation::ExistingBackupsOnly => "existing_backups_only",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackStep {
    pub step_id: String,
    pub name: String,
    pub description: String,
    pub estimated_duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackPlan {
    pub rollback_steps: Vec<RollbackStep>,
    pub estimated_rollback_time_ms: u64,
    pub data_preservation: DataPreservation,
    pub success_criteria: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationCheck {
    pub name: String,
    pub description: String,
}

/// Immutable migration plan. Created once, executed at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPlan {
    pub plan_id: String,
    pub user_id: String,
    pub source_version: String,
    pub target_version: String,
    pub migration_steps: Vec<MigrationStep>,
    pub risk_assessment: RiskAssessment,
    pub rollback_plan: RollbackPlan,
    pub validation_checks: Vec<ValidationCheck>,
    pub estimated_duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Append-only execution log. Entries are timestamped as they are pushed
/// and can never be removed or reordered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationLog {
    entries: Vec<MigrationLogEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationLogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl MigrationLog {
    pub fn push(&mut self, message: impl Into<String>) {
        self.entries.push(MigrationLogEntry {
            timestamp: Utc::now(),
            message: message.into(),
        });
    }

    pub fn entries(&self) -> &[MigrationLogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of one execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationResult {
    pub migration_id: String,
    pub plan_id: String,
    pub user_id: String,
    pub success: bool,
    pub state: MigrationState,
    pub from_version: String,
    pub to_version: String,
    pub steps_completed: usize,
    pub steps_total: usize,
    pub integrity: DataIntegrityCheck,
    pub elapsed_ms: u64,
    pub performance_impact: PerformanceImpact,
    pub rollback_available: bool,
    pub log: MigrationLog,
    pub error: Option<String>,
}

/// Outcome of an explicit rollback request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResult {
    pub migration_id: String,
    pub user_id: Option<String>,
    pub success: bool,
    pub restored_version: Option<String>,
    pub rollback_time_ms: u64,
    pub integrity: DataIntegrityCheck,
    pub log: MigrationLog,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoverabilityLevel {
    Full,
    Partial,
    None,
}

impl std::fmt::Display for RecoverabilityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecoverabilityLevel::Full => "full",
            RecoverabilityLevel::Partial => "partial",
            RecoverabilityLevel::None => "none",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataLossAssessment {
    pub has_data_loss: bool,
    pub recoverability_level: RecoverabilityLevel,
    pub details: Vec<String>,
}

/// Outcome of a repair pass. The repaired model is returned to the caller
/// and is not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairResult {
    pub user_id: String,
    pub success: bool,
    pub repaired_model: UserModel,
    pub fixes_applied: Vec<String>,
    pub unresolved: Vec<String>,
    pub data_loss: DataLossAssessment,
}

/// Host resource signals consulted during planning
pub trait ResourceProbe: Send + Sync {
    /// Free bytes available to the vault's filesystem, if known
    fn available_disk_bytes(&self) -> Option<u64>;
}

/// Probe returning a preset figure. The embedding application wires its
/// own resource monitor through this seam.
pub struct FixedProbe {
    available: Option<u64>,
}

impl FixedProbe {
    pub fn new(available_bytes: u64) -> Self {
        Self {
            available: Some(available_bytes),
        }
    }

    pub fn unknown() -> Self {
        Self { available: None }
    }
}

impl ResourceProbe for FixedProbe {
    fn available_disk_bytes(&self) -> Option<u64> {
        self.available
    }
}

/// Bookkeeping for one registered plan and its attempt
#[derive(Clone)]
struct PlanRecord {
    plan: MigrationPlan,
    state: MigrationState,
    migration_id: Option<String>,
    anchor_backup_id: Option<String>,
    pre_checksum: Option<String>,
}

/// Working copy mutated by migration steps. Durable state is only touched
/// once every step has succeeded.
struct WorkingModel {
    version: String,
    payload: ModelPayload,
    metadata: ModelMetadata,
    performance: ModelPerformance,
}

struct FailureOutcome {
    state: MigrationState,
    steps_completed: usize,
    rollback_available: bool,
    integrity: DataIntegrityCheck,
    error: String,
}

/// Plans, executes, rolls back, and repairs model migrations
pub struct MigrationManager {
    store: Arc<ModelStore>,
    plans: RwLock<HashMap<String, PlanRecord>>,
    migrations: RwLock<HashMap<String, String>>,
    probe: Option<Arc<dyn ResourceProbe>>,
}

impl MigrationManager {
    pub fn new(store: Arc<ModelStore>) -> Self {
        Self {
            store,
            plans: RwLock::new(HashMap::new()),
            migrations: RwLock::new(HashMap::new()),
            probe: None,
        }
    }

    pub fn with_resource_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    fn set_state(&self, plan_id: &str, state: MigrationState) {
        if let Some(record) = self.plans.write().get_mut(plan_id) {
            record.state = state;
        }
        if state.is_terminal() {
            self.prune_terminal_records();
        }
    }

    /// Drop the oldest terminal attempt records beyond the retention cap,
    /// along with their migration-id entries. Pending and FAILED attempts
    /// are never pruned; a FAILED attempt still holds its rollback anchor.
    fn prune_terminal_records(&self) {
        let mut plans = self.plans.write();
        let terminal = plans
            .values()
            .filter(|record| record.state.is_terminal())
            .count();
        if terminal <= MAX_RETAINED_TERMINAL {
            return;
        }

        let mut candidates: Vec<(String, DateTime<Utc>)> = plans
            .values()
            .filter(|record| record.state.is_terminal())
            .map(|record| (record.plan.plan_id.clone(), record.plan.created_at))
            .collect();
        candidates.sort_by_key(|(_, created_at)| *created_at);

        let mut migrations = self.migrations.write();
        for (plan_id, _) in candidates
            .iter()
            .take(terminal - MAX_RETAINED_TERMINAL)
        {
            if let Some(record) = plans.remove(plan_id) {
                if let Some(migration_id) = record.migration_id {
                    migrations.remove(&migration_id);
                }
            }
        }
    }

    /// Current state of a registered plan's attempt
    pub fn plan_state(&self, plan_id: &str) -> Option<MigrationState> {
        self.plans.read().get(plan_id).map(|record| record.state)
    }

    /// Current state of the attempt that produced a migration id
    pub fn migration_state(&self, migration_id: &str) -> Option<MigrationState> {
        let plan_id = self.migrations.read().get(migration_id).cloned()?;
        self.plan_state(&plan_id)
    }

    /// Pure compatibility analysis between two version strings
    pub fn validate_model_compatibility(
        &self,
        source_version: &str,
        target_version: &str,
    ) -> CompatibilityAssessment {
        assess_compatibility(source_version, target_version)
    }

    /// Build and register a plan for migrating one model to a target
    /// version. Plans are produced even for incompatible spans; execution
    /// refuses them at the compatibility gate.
    pub fn create_migration_plan(
        &self,
        source_model: &UserModel,
        target_version: &str,
    ) -> MigrationPlan {
        let assessment = assess_compatibility(&source_model.version, target_version);
        let parsed_source = VersionTriple::parse(&source_model.version);
        let parsed_target = VersionTriple::parse(target_version);

        let mut outline: Vec<(StepKind, &str, String, u64)> = vec![
            (
                StepKind::CompatibilityGate,
                "compatibility gate",
                format!(
                    "confirm {} -> {} is migratable",
                    source_model.version, target_version
                ),
                GATE_STEP_MS,
            ),
            (
                StepKind::IntegrityValidation,
                "integrity validation",
                "verify checksum, structure, and consistency of the source model".to_string(),
                INTEGRITY_STEP_MS,
            ),
        ];
        if assessment.migration_complexity >= MigrationComplexity::Complex {
            outline.push((
                StepKind::DataFormatUpgrade,
                "data format upgrade",
                "raise the payload format revision to the target generation".to_string(),
                DATA_FORMAT_STEP_MS,
            ));
        }
        if let (Some(source), Some(target)) = (parsed_source, parsed_target) {
            if source.minor != target.minor {
                outline.push((
                    StepKind::SchemaUpdate,
                    "schema update",
                    "reconcile schema fields with the target version".to_string(),
                    SCHEMA_STEP_MS,
                ));
            }
        }
        outline.push((
            StepKind::VersionStamp,
            "version stamp",
            format!("stamp model and payload at {}", target_version),
            STAMP_STEP_MS,
        ));

        let migration_steps: Vec<MigrationStep> = outline
            .into_iter()
            .enumerate()
            .map(|(index, (kind, name, description, duration))| MigrationStep {
                step_id: format!("step_{}_{}", index + 1, kind),
                name: name.to_string(),
                kind,
                description,
                estimated_duration_ms: duration,
            })
            .collect();

        let mut risk_factors = Vec::new();
        if !assessment.is_compatible {
            risk_factors.push(RiskFactor {
                kind: RiskKind::DataLoss,
                severity: RiskLevel::Critical,
                description: "major version change cannot preserve schema guarantees automatically"
                    .to_string(),
            });
        }
        if let (Some(source), Some(target)) = (parsed_source, parsed_target) {
            if target < source {
                risk_factors.push(RiskFactor {
                    kind: RiskKind::Downgrade,
                    severity: RiskLevel::Medium,
                    description: format!(
                        "target {} is older than source {}",
                        target_version, source_model.version
                    ),
                });
            }
        }
        if let Some(probe) = &self.probe {
            if let Some(available) = probe.available_disk_bytes() {
                let threshold = self.store.low_disk_threshold();
                if available < threshold {
                    risk_factors.push(RiskFactor {
                        kind: RiskKind::SystemInstability,
                        severity: RiskLevel::High,
                        description: format!(
                            "available disk space {} bytes is below the {} byte floor",
                            available, threshold
                        ),
                    });
                }
            }
        }
        let risk_level = risk_factors
            .iter()
            .map(|factor| factor.severity)
            .fold(assessment.risk_level, std::cmp::max);

        let rollback_plan = RollbackPlan {
            rollback_steps: vec![
                RollbackStep {
                    step_id: "rollback_1_restore_anchor".to_string(),
                    name: "restore pre-migration backup".to_string(),
                    description: "reinstall the snapshot recorded before the first step ran"
                        .to_string(),
                    estimated_duration_ms: 20_000,
                },
                RollbackStep {
                    step_id: "rollback_2_verify".to_string(),
                    name: "verify restored model".to_string(),
                    description: "run a full integrity check over the restored model".to_string(),
                    estimated_duration_ms: 10_000,
                },
            ],
            estimated_rollback_time_ms: 30_000,
            data_preservation: if assessment.is_compatible {
                DataPreservation::PreMigrationBackup
            } else {
                DataPreservation::ExistingBackupsOnly
            },
            success_criteria: vec![
                "restored checksum matches the pre-migration snapshot".to_string(),
                "post-rollback integrity check passes".to_string(),
            ],
        };

        let mut validation_checks = vec![
            ValidationCheck {
                name: "post-migration integrity".to_string(),
                description: "checksum, structure, and consistency must pass after persistence"
                    .to_string(),
            },
            ValidationCheck {
                name: "version stamp".to_string(),
                description: format!("model version must equal {}", target_version),
            },
        ];
        if !assessment.is_compatible {
            validation_checks.push(ValidationCheck {
                name: "manual review".to_string(),
                description: "a major version span requires operator sign-off before execution"
                    .to_string(),
            });
        }

        let estimated_duration_ms = migration_steps
            .iter()
            .map(|step| step.estimated_duration_ms)
            .sum();

        let plan = MigrationPlan {
            plan_id: format!("plan_{}", Uuid::new_v4().simple()),
            user_id: source_model.user_id.clone(),
            source_version: source_model.version.clone(),
            target_version: target_version.to_string(),
            migration_steps,
            risk_assessment: RiskAssessment {
                risk_level,
                risk_factors,
            },
            rollback_plan,
            validation_checks,
            estimated_duration_ms,
            created_at: Utc::now(),
        };

        self.plans.write().insert(
            plan.plan_id.clone(),
            PlanRecord {
                plan: plan.clone(),
                state: MigrationState::Planned,
                migration_id: None,
                anchor_backup_id: None,
                pre_checksum: None,
            },
        );

        info!(
            plan = %plan.plan_id,
            user = %plan.user_id,
            from = %plan.source_version,
            to = %plan.target_version,
            complexity = %assessment.migration_complexity,
            "migration plan created"
        );

        plan
    }

    /// Execute a registered plan. The plan is consumed: a second execution
    /// attempt returns `PlanAlreadyExecuted`. Expected failures land in the
    /// returned result, not in the error channel.
    pub async fn execute_migration_plan(
        &self,
        plan: &MigrationPlan,
    ) -> Result<MigrationResult, MigrationError> {
        // claim the plan exactly once
        let (claimed, migration_id) = {
            let mut plans = self.plans.write();
            let record = plans
                .get_mut(&plan.plan_id)
                .ok_or_else(|| MigrationError::UnknownPlan(plan.plan_id.clone()))?;
            if record.state != MigrationState::Planned {
                return Err(MigrationError::PlanAlreadyExecuted(plan.plan_id.clone()));
            }
            record.state = MigrationState::Executing;
            let migration_id = format!("mig_{}", Uuid::new_v4().simple());
            record.migration_id = Some(migration_id.clone());
            (record.plan.clone(), migration_id)
        };
        self.migrations
            .write()
            .insert(migration_id.clone(), claimed.plan_id.clone());

        // The store's per-user lock serializes this whole attempt against
        // direct saves, backups, and restores for the same user. Everything
        // below goes through the `_locked` store entry points.
        let user_lock = self.store.user_lock(&claimed.user_id);
        let _guard = user_lock.lock().await;

        let started = Instant::now();
        let mut log = MigrationLog::default();
        log.push(format!(
            "migration {} started for plan {}",
            migration_id, claimed.plan_id
        ));
        info!(
            migration = %migration_id,
            plan = %claimed.plan_id,
            user = %claimed.user_id,
            "migration started"
        );
        self.store.audit_log().record_event(
            AuditEvent::MigrationStarted,
            AuditSeverity::Info,
            format!("migration {} started for {}", migration_id, claimed.user_id),
        );

        let steps_total = claimed.migration_steps.len();

        // load the source model; durable state is untouched if this fails
        let source = match self.store.load_locked(&claimed.user_id).await {
            Ok(model) => model,
            Err(e) => {
                log.push(format!("source model could not be loaded: {}", e));
                self.audit_failure(&migration_id, &e.to_string());
                return Ok(self.failure_result(
                    &claimed,
                    &migration_id,
                    started,
                    log,
                    FailureOutcome {
                        state: MigrationState::Failed,
                        steps_completed: 0,
                        rollback_available: false,
                        integrity: DataIntegrityCheck::rejected(
                            format!("source model could not be loaded: {}", e),
                            &["userId"],
                        ),
                        error: e.to_string(),
                    },
                ));
            }
        };
        let pre_checksum = source.model_data.checksum.clone();

        // durable rollback anchor before any step runs
        let anchor = match self.store.backup_locked(&claimed.user_id).await {
            Ok(info) => info,
            Err(e) => {
                log.push(format!("rollback anchor could not be recorded: {}", e));
                self.audit_failure(&migration_id, &e.to_string());
                return Ok(self.failure_result(
                    &claimed,
                    &migration_id,
                    started,
                    log,
                    FailureOutcome {
                        state: MigrationState::Failed,
                        steps_completed: 0,
                        rollback_available: false,
                        integrity: DataIntegrityCheck::rejected(
                            format!("rollback anchor could not be recorded: {}", e),
                            &["backupId"],
                        ),
                        error: e.to_string(),
                    },
                ));
            }
        };
        log.push(format!("rollback anchor {} recorded", anchor.backup_id));
        {
            let mut plans = self.plans.write();
            if let Some(record) = plans.get_mut(&claimed.plan_id) {
                record.anchor_backup_id = Some(anchor.backup_id.clone());
                record.pre_checksum = Some(pre_checksum.clone());
            }
        }

        // steps mutate a working copy only
        let mut working = match self.store.decode_payload(&source).await {
            Ok(payload) => WorkingModel {
                version: source.version.clone(),
                payload,
                metadata: source.metadata.clone(),
                performance: source.performance.clone(),
            },
            Err(e) => {
                log.push(format!("source payload could not be decoded: {}", e));
                self.audit_failure(&migration_id, &e.to_string());
                return Ok(self.failure_result(
                    &claimed,
                    &migration_id,
                    started,
                    log,
                    FailureOutcome {
                        state: MigrationState::Failed,
                        steps_completed: 0,
                        rollback_available: true,
                        integrity: DataIntegrityCheck::rejected(
                            format!("source payload could not be decoded: {}", e),
                            &["modelData"],
                        ),
                        error: e.to_string(),
                    },
                ));
            }
        };

        let mut steps_completed = 0usize;
        let mut step_failure: Option<String> = None;
        for step in &claimed.migration_steps {
            match self.apply_step(step, &claimed, &source, &mut working).await {
                Ok(()) => {
                    steps_completed += 1;
                    log.push(format!("step {} ({}) completed", step.step_id, step.name));
                }
                Err(reason) => {
                    log.push(format!(
                        "step {} ({}) failed: {}",
                        step.step_id, step.name, reason
                    ));
                    step_failure = Some(reason);
                    break;
                }
            }
        }

        if let Some(reason) = step_failure {
            // nothing was persisted; the stored model is exactly as before
            warn!(
                migration = %migration_id,
                user = %claimed.user_id,
                "migration failed before persistence: {}",
                reason
            );
            self.audit_failure(&migration_id, &reason);
            let integrity = match self.store.verify_model(&source).await {
                Ok(check) => check,
                Err(e) => DataIntegrityCheck::rejected(
                    format!("integrity check unavailable: {}", e),
                    &["modelData"],
                ),
            };
            return Ok(self.failure_result(
                &claimed,
                &migration_id,
                started,
                log,
                FailureOutcome {
                    state: MigrationState::Failed,
                    steps_completed,
                    rollback_available: true,
                    integrity,
                    error: reason,
                },
            ));
        }

        // persist through the normal save path
        let draft = ModelDraft {
            user_id: claimed.user_id.clone(),
            version: working.version.clone(),
            created_at: source.created_at,
            last_updated: Utc::now(),
            payload: working.payload.clone(),
            metadata: working.metadata.clone(),
            performance: working.performance.clone(),
        };
        let migrated = match self.store.save_locked(&claimed.user_id, draft).await {
            Ok(model) => model,
            Err(e) => {
                log.push(format!("persisting the migrated model failed: {}", e));
                return Ok(self
                    .rollback_after_failure(
                        &claimed,
                        &migration_id,
                        &anchor.backup_id,
                        steps_completed,
                        started,
                        log,
                        format!("persisting the migrated model failed: {}", e),
                    )
                    .await);
            }
        };
        log.push(format!(
            "migrated model persisted at version {}",
            migrated.version
        ));

        let integrity = match self.store.verify_model(&migrated).await {
            Ok(check) => check,
            Err(e) => DataIntegrityCheck::rejected(
                format!("integrity check unavailable: {}", e),
                &["modelData"],
            ),
        };
        if !integrity.passed {
            log.push("post-migration integrity check failed".to_string());
            return Ok(self
                .rollback_after_failure(
                    &claimed,
                    &migration_id,
                    &anchor.backup_id,
                    steps_completed,
                    started,
                    log,
                    "post-migration integrity check failed".to_string(),
                )
                .await);
        }

        self.set_state(&claimed.plan_id, MigrationState::Completed);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        log.push(format!(
            "migration {} completed in {} ms",
            migration_id, elapsed_ms
        ));
        info!(
            migration = %migration_id,
            user = %claimed.user_id,
            from = %claimed.source_version,
            to = %claimed.target_version,
            "migration completed"
        );
        self.store.audit_log().record_event(
            AuditEvent::MigrationCompleted,
            AuditSeverity::Info,
            format!(
                "migration {} completed for {}: {} -> {}",
                migration_id, claimed.user_id, claimed.source_version, claimed.target_version
            ),
        );

        let old_size = source.model_data.compressed_size;
        let new_size = migrated.model_data.compressed_size;
        let throughput_delta = if old_size == 0 {
            0.0
        } else {
            1.0 - (new_size as f64 / old_size as f64)
        };

        Ok(MigrationResult {
            migration_id,
            plan_id: claimed.plan_id.clone(),
            user_id: claimed.user_id.clone(),
            success: true,
            state: MigrationState::Completed,
            from_version: claimed.source_version.clone(),
            to_version: claimed.target_version.clone(),
            steps_completed,
            steps_total,
            integrity,
            elapsed_ms,
            performance_impact: PerformanceImpact {
                latency_ms: elapsed_ms,
                memory_delta_bytes: new_size as i64 - old_size as i64,
                throughput_delta,
            },
            rollback_available: true,
            log,
            error: None,
        })
    }

    async fn apply_step(
        &self,
        step: &MigrationStep,
        plan: &MigrationPlan,
        source: &UserModel,
        working: &mut WorkingModel,
    ) -> Result<(), String> {
        match step.kind {
            StepKind::CompatibilityGate => {
                if source.version != plan.source_version {
                    return Err(format!(
                        "model version changed since planning: {} is now {}",
                        plan.source_version, source.version
                    ));
                }
                let assessment =
                    assess_compatibility(&plan.source_version, &plan.target_version);
                if !assessment.is_compatible {
                    return Err(format!(
                        "incompatible versions: {}",
                        assessment.compatibility_issues.join("; ")
                    ));
                }
                // saves enforce monotonic versions, so a downgrade can never
                // persist; restoring a recorded backup is the supported path
                let parsed = (
                    VersionTriple::parse(&plan.source_version),
                    VersionTriple::parse(&plan.target_version),
                );
                if let (Some(source_version), Some(target_version)) = parsed {
                    if target_version < source_version {
                        return Err(
                            "target version is older than the stored model; restore a backup instead"
                                .to_string(),
                        );
                    }
                }
                Ok(())
            }
            StepKind::IntegrityValidation => {
                let check = self
                    .store
                    .verify_model(source)
                    .await
                    .map_err(|e| format!("integrity check unavailable: {}", e))?;
                if !check.passed {
                    let kinds: Vec<String> =
                        check.issues.iter().map(|i| i.kind.to_string()).collect();
                    return Err(format!(
                        "pre-migration integrity check failed: {}",
                        kinds.join(", ")
                    ));
                }
                Ok(())
            }
            StepKind::DataFormatUpgrade => {
                if let Some(target) = VersionTriple::parse(&plan.target_version) {
                    working.payload.format_revision =
                        working.payload.format_revision.max(target.minor);
                }
                Ok(())
            }
            StepKind::SchemaUpdate => {
                working.metadata.schema_fields.sort();
                working.metadata.schema_fields.dedup();
                Ok(())
            }
            StepKind::VersionStamp => {
                working.version = plan.target_version.clone();
                working.payload.schema_version = plan.target_version.clone();
                Ok(())
            }
        }
    }

    fn audit_failure(&self, migration_id: &str, reason: &str) {
        self.store.audit_log().record_event(
            AuditEvent::MigrationFailed,
            AuditSeverity::Error,
            format!("migration {} failed: {}", migration_id, reason),
        );
    }

    fn failure_result(
        &self,
        plan: &MigrationPlan,
        migration_id: &str,
        started: Instant,
        log: MigrationLog,
        outcome: FailureOutcome,
    ) -> MigrationResult {
        self.set_state(&plan.plan_id, outcome.state);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        MigrationResult {
            migration_id: migration_id.to_string(),
            plan_id: plan.plan_id.clone(),
            user_id: plan.user_id.clone(),
            success: false,
            state: outcome.state,
            from_version: plan.source_version.clone(),
            to_version: plan.target_version.clone(),
            steps_completed: outcome.steps_completed,
            steps_total: plan.migration_steps.len(),
            integrity: outcome.integrity,
            elapsed_ms,
            performance_impact: PerformanceImpact {
                latency_ms: elapsed_ms,
                memory_delta_bytes: 0,
                throughput_delta: 0.0,
            },
            rollback_available: outcome.rollback_available,
            log,
            error: Some(outcome.error),
        }
    }

    /// A failure at or after persistence: restore the anchor automatically.
    /// Restore success ends at ROLLED_BACK; restore failure escalates.
    /// Caller holds the store's user lock.
    #[allow(clippy::too_many_arguments)]
    async fn rollback_after_failure(
        &self,
        plan: &MigrationPlan,
        migration_id: &str,
        anchor_backup_id: &str,
        steps_completed: usize,
        started: Instant,
        mut log: MigrationLog,
        reason: String,
    ) -> MigrationResult {
        warn!(
            migration = %migration_id,
            user = %plan.user_id,
            "attempting automatic rollback: {}",
            reason
        );
        self.audit_failure(migration_id, &reason);

        match self
            .store
            .restore_locked(&plan.user_id, anchor_backup_id)
            .await
        {
            Ok(restored) => {
                log.push(format!(
                    "rolled back to anchor {} at version {}",
                    anchor_backup_id, restored.restored_version
                ));
                self.store.audit_log().record_event(
                    AuditEvent::MigrationRolledBack,
                    AuditSeverity::Warning,
                    format!(
                        "migration {} rolled back for {}",
                        migration_id, plan.user_id
                    ),
                );
                self.failure_result(
                    plan,
                    migration_id,
                    started,
                    log,
                    FailureOutcome {
                        state: MigrationState::RolledBack,
                        steps_completed,
                        rollback_available: true,
                        integrity: restored.integrity,
                        error: reason,
                    },
                )
            }
            Err(e) => {
                log.push(format!("automatic rollback failed: {}", e));
                error!(
                    migration = %migration_id,
                    user = %plan.user_id,
                    "rollback failed; manual intervention required: {}",
                    e
                );
                self.store.audit_log().record_event(
                    AuditEvent::MigrationEscalated,
                    AuditSeverity::Critical,
                    format!(
                        "migration {} escalated for {}: rollback failed: {}",
                        migration_id, plan.user_id, e
                    ),
                );
                self.failure_result(
                    plan,
                    migration_id,
                    started,
                    log,
                    FailureOutcome {
                        state: MigrationState::Escalated,
                        steps_completed,
                        rollback_available: false,
                        integrity: DataIntegrityCheck::rejected(
                            format!("rollback failed: {}", e),
                            &["backupId"],
                        ),
                        error: format!("{} (rollback failed: {})", reason, e),
                    },
                )
            }
        }
    }

    /// Restore the pre-migration snapshot recorded for an attempt.
    /// An unknown migration id yields a failure result, not an error.
    pub async fn rollback_migration(
        &self,
        migration_id: &str,
    ) -> Result<RollbackResult, MigrationError> {
        let started = Instant::now();
        let mut log = MigrationLog::default();

        let record = {
            let plan_id = self.migrations.read().get(migration_id).cloned();
            plan_id.and_then(|id| self.plans.read().get(&id).cloned())
        };
        let Some(record) = record else {
            log.push(format!(
                "no recorded migration attempt for {}",
                migration_id
            ));
            warn!(migration = migration_id, "rollback requested for unknown migration");
            return Ok(RollbackResult {
                migration_id: migration_id.to_string(),
                user_id: None,
                success: false,
                restored_version: None,
                rollback_time_ms: started.elapsed().as_millis() as u64,
                integrity: DataIntegrityCheck::rejected(
                    "no recorded migration attempt",
                    &["migrationId"],
                ),
                log,
                error: Some("unknown migration id".to_string()),
            });
        };

        let plan_id = record.plan.plan_id.clone();
        let user_id = record.plan.user_id.clone();

        let user_lock = self.store.user_lock(&user_id);
        let _guard = user_lock.lock().await;

        let Some(anchor) = record.anchor_backup_id.clone() else {
            log.push("no rollback anchor was recorded for this attempt".to_string());
            self.set_state(&plan_id, MigrationState::Escalated);
            self.store.audit_log().record_event(
                AuditEvent::MigrationEscalated,
                AuditSeverity::Critical,
                format!(
                    "rollback of {} escalated for {}: no anchor recorded",
                    migration_id, user_id
                ),
            );
            return Ok(RollbackResult {
                migration_id: migration_id.to_string(),
                user_id: Some(user_id),
                success: false,
                restored_version: None,
                rollback_time_ms: started.elapsed().as_millis() as u64,
                integrity: DataIntegrityCheck::rejected(
                    "no rollback anchor recorded",
                    &["backupId"],
                ),
                log,
                error: Some("no rollback anchor recorded".to_string()),
            });
        };

        log.push(format!("restoring rollback anchor {}", anchor));
        match self.store.restore_locked(&user_id, &anchor).await {
            Ok(restored) => {
                let checksum_ok = record
                    .pre_checksum
                    .as_deref()
                    .map(|checksum| checksum == restored.restored_checksum)
                    .unwrap_or(true);

                if checksum_ok && restored.integrity.passed {
                    self.set_state(&plan_id, MigrationState::RolledBack);
                    log.push(format!(
                        "model restored at version {}",
                        restored.restored_version
                    ));
                    info!(migration = migration_id, user = %user_id, "migration rolled back");
                    self.store.audit_log().record_event(
                        AuditEvent::MigrationRolledBack,
                        AuditSeverity::Warning,
                        format!("migration {} rolled back for {}", migration_id, user_id),
                    );
                    Ok(RollbackResult {
                        migration_id: migration_id.to_string(),
                        user_id: Some(user_id),
                        success: true,
                        restored_version: Some(restored.restored_version),
                        rollback_time_ms: started.elapsed().as_millis() as u64,
                        integrity: restored.integrity,
                        log,
                        error: None,
                    })
                } else {
                    let reason = if !checksum_ok {
                        "restored checksum does not match the pre-migration snapshot"
                    } else {
                        "restored model failed integrity checks"
                    };
                    self.set_state(&plan_id, MigrationState::Escalated);
                    log.push(reason.to_string());
                    error!(migration = migration_id, user = %user_id, "{}", reason);
                    self.store.audit_log().record_event(
                        AuditEvent::MigrationEscalated,
                        AuditSeverity::Critical,
                        format!(
                            "rollback of {} escalated for {}: {}",
                            migration_id, user_id, reason
                        ),
                    );
                    Ok(RollbackResult {
                        migration_id: migration_id.to_string(),
                        user_id: Some(user_id),
                        success: false,
                        restored_version: Some(restored.restored_version),
                        rollback_time_ms: started.elapsed().as_millis() as u64,
                        integrity: restored.integrity,
                        log,
                        error: Some(reason.to_string()),
                    })
                }
            }
            Err(e) => {
                self.set_state(&plan_id, MigrationState::Escalated);
                log.push(format!("restore failed: {}", e));
                error!(
                    migration = migration_id,
                    user = %user_id,
                    "rollback restore failed: {}",
                    e
                );
                self.store.audit_log().record_event(
                    AuditEvent::MigrationEscalated,
                    AuditSeverity::Critical,
                    format!(
                        "rollback of {} escalated for {}: restore failed: {}",
                        migration_id, user_id, e
                    ),
                );
                Ok(RollbackResult {
                    migration_id: migration_id.to_string(),
                    user_id: Some(user_id),
                    success: false,
                    restored_version: None,
                    rollback_time_ms: started.elapsed().as_millis() as u64,
                    integrity: DataIntegrityCheck::rejected(
                        format!("restore failed: {}", e),
                        &["backupId"],
                    ),
                    log,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    /// Full integrity check over one model
    pub async fn validate_data_integrity(
        &self,
        model: &UserModel,
    ) -> Result<DataIntegrityCheck, MigrationError> {
        let check = self.store.verify_model(model).await?;
        if !check.passed {
            warn!(
                user = %model.user_id,
                issues = check.issues.len(),
                "integrity validation failed"
            );
            self.store.audit_log().record_event(
                AuditEvent::IntegrityFailure,
                AuditSeverity::Warning,
                format!("integrity validation failed for {}", model.user_id),
            );
        }
        Ok(check)
    }

    /// Attempt a targeted fix for each reported issue. The repaired model
    /// is returned and never persisted; callers decide whether to save it.
    pub async fn repair_corrupted_data(
        &self,
        model: &UserModel,
        issues: &[IntegrityIssue],
    ) -> Result<RepairResult, MigrationError> {
        let mut repaired = model.clone();
        let mut fixes_applied = Vec::new();
        let mut unresolved = Vec::new();
        let mut structural_defaults = false;

        for issue in issues {
            match issue.kind {
                IssueKind::ChecksumMismatch => {
                    match self.store.recompute_payload_digest(&repaired).await {
                        Ok((checksum, _)) => {
                            repaired.model_data.checksum = checksum;
                            fixes_applied.push(
                                "recomputed payload checksum from decrypted plaintext".to_string(),
                            );
                        }
                        Err(e) => {
                            unresolved.push(format!("checksum cannot be recomputed: {}", e));
                        }
                    }
                }
                IssueKind::StructureCorruption => {
                    self.repair_structure(
                        &mut repaired,
                        issue,
                        &mut fixes_applied,
                        &mut unresolved,
                        &mut structural_defaults,
                    )
                    .await;
                }
                IssueKind::DataInconsistency => {
                    self.repair_consistency(
                        &mut repaired,
                        issue,
                        &mut fixes_applied,
                        &mut unresolved,
                    )
                    .await;
                }
            }
        }

        let success = unresolved.is_empty();
        let recoverability = if !success {
            if repaired.model_data.ciphertext.is_empty() {
                RecoverabilityLevel::None
            } else {
                RecoverabilityLevel::Partial
            }
        } else if structural_defaults {
            RecoverabilityLevel::Partial
        } else {
            RecoverabilityLevel::Full
        };

        let mut details = unresolved.clone();
        if structural_defaults {
            details.push("structural fields were rebuilt from defaults".to_string());
        }

        if success {
            info!(user = %model.user_id, fixes = fixes_applied.len(), "repair applied");
            self.store.audit_log().record_event(
                AuditEvent::RepairApplied,
                AuditSeverity::Info,
                format!(
                    "{} fixes applied to the model for {}",
                    fixes_applied.len(),
                    model.user_id
                ),
            );
        } else {
            warn!(
                user = %model.user_id,
                unresolved = unresolved.len(),
                "repair left unresolved issues"
            );
        }

        Ok(RepairResult {
            user_id: model.user_id.clone(),
            success,
            repaired_model: repaired,
            fixes_applied,
            unresolved,
            data_loss: DataLossAssessment {
                has_data_loss: recoverability != RecoverabilityLevel::Full,
                recoverability_level: recoverability,
                details,
            },
        })
    }

    async fn repair_structure(
        &self,
        repaired: &mut UserModel,
        issue: &IntegrityIssue,
        fixes_applied: &mut Vec<String>,
        unresolved: &mut Vec<String>,
        structural_defaults: &mut bool,
    ) {
        if issue.affected_data.is_empty() {
            unresolved.push(issue.description.clone());
            return;
        }
        for field in &issue.affected_data {
            match field.as_str() {
                "modelData.encryptionMethod" => {
                    repaired.model_data.encryption_method = ENCRYPTION_METHOD.to_string();
                    *structural_defaults = true;
                    fixes_applied.push("reset encryption method label".to_string());
                }
                "metadata.modelType" => {
                    repaired.metadata.model_type = "personalization".to_string();
                    *structural_defaults = true;
                    fixes_applied.push("restored default model type".to_string());
                }
                "modelData.checksum" => {
                    match self.store.recompute_payload_digest(repaired).await {
                        Ok((checksum, _)) => {
                            repaired.model_data.checksum = checksum;
                            fixes_applied
                                .push("rebuilt checksum from decrypted plaintext".to_string());
                        }
                        Err(e) => {
                            unresolved.push(format!("checksum cannot be rebuilt: {}", e));
                        }
                    }
                }
                "version" => match self.store.decode_payload(repaired).await {
                    Ok(payload)
                        if VersionTriple::parse(&payload.schema_version).is_some() =>
                    {
                        repaired.version = payload.schema_version;
                        fixes_applied
                            .push("recovered version from the payload schema".to_string());
                    }
                    _ => {
                        unresolved.push("version cannot be reconstructed".to_string());
                    }
                },
                other => {
                    unresolved.push(format!("{} cannot be reconstructed", other));
                }
            }
        }
    }

    async fn repair_consistency(
        &self,
        repaired: &mut UserModel,
        issue: &IntegrityIssue,
        fixes_applied: &mut Vec<String>,
        unresolved: &mut Vec<String>,
    ) {
        if issue.affected_data.is_empty() {
            unresolved.push(issue.description.clone());
            return;
        }
        for field in &issue.affected_data {
            match field.as_str() {
                "performance.accuracy" => {
                    repaired.performance.accuracy = clamp_metric(repaired.performance.accuracy);
                    fixes_applied.push("clamped accuracy into [0, 1]".to_string());
                }
                "performance.precision" => {
                    repaired.performance.precision = clamp_metric(repaired.performance.precision);
                    fixes_applied.push("clamped precision into [0, 1]".to_string());
                }
                "performance.recall" => {
                    repaired.performance.recall = clamp_metric(repaired.performance.recall);
                    fixes_applied.push("clamped recall into [0, 1]".to_string());
                }
                "createdAt" => {
                    repaired.created_at = repaired.last_updated;
                    fixes_applied.push("realigned createdAt with lastUpdated".to_string());
                }
                "version" => match self.store.decode_payload(repaired).await {
                    Ok(payload) => {
                        repaired.version = payload.schema_version;
                        fixes_applied
                            .push("realigned model version with the payload schema".to_string());
                    }
                    Err(e) => {
                        unresolved.push(format!("version cannot be realigned: {}", e));
                    }
                },
                "modelData.originalSize" => {
                    match self.store.recompute_payload_digest(repaired).await {
                        Ok((_, length)) => {
                            repaired.model_data.original_size = length;
                            fixes_applied
                                .push("recomputed original size from plaintext".to_string());
                        }
                        Err(e) => {
                            unresolved.push(format!("original size cannot be recomputed: {}", e));
                        }
                    }
                }
                "modelData.compressedSize" => {
                    repaired.model_data.compressed_size = repaired.model_data.original_size;
                    fixes_applied
                        .push("reset compressed size bookkeeping to original size".to_string());
                }
                other => {
                    unresolved.push(format!("{} cannot be realigned", other));
                }
            }
        }
    }
}

fn clamp_metric(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
