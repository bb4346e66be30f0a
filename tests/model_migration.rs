//! Migration manager integration tests
//!
//! Covers plan construction, guarded execution, the attempt state machine,
//! rollback to the pre-migration anchor, and per-user serialization.

mod common;

use std::sync::Arc;

use modelvault::migration::{
    DataPreservation, FixedProbe, MigrationError, MigrationManager, MigrationState, RiskKind,
    RiskLevel, StepKind, MAX_PLAN_DURATION_MS, MAX_STEP_DURATION_MS,
};

// ============================================================================
// Planning
// ============================================================================

#[tokio::test]
async fn plan_satisfies_structural_invariants() {
    let vault = common::TestVault::new().expect("Failed to create vault");
    let manager = MigrationManager::new(vault.store.clone());
    let model = vault
        .store
        .save("user-1", common::sample_draft("user-1", "1.0.0"))
        .await
        .expect("save model");

    let plan = manager.create_migration_plan(&model, "1.1.0");

    assert_eq!(plan.user_id, "user-1");
    assert_eq!(plan.source_version, "1.0.0");
    assert_eq!(plan.target_version, "1.1.0");

    assert!(!plan.migration_steps.is_empty());
    assert_eq!(plan.migration_steps[0].kind, StepKind::CompatibilityGate);
    assert_eq!(
        plan.migration_steps.last().expect("at least one step").kind,
        StepKind::VersionStamp
    );
    for step in &plan.migration_steps {
        assert!(step.estimated_duration_ms < MAX_STEP_DURATION_MS);
    }
    let total: u64 = plan
        .migration_steps
        .iter()
        .map(|s| s.estimated_duration_ms)
        .sum();
    assert_eq!(plan.estimated_duration_ms, total);
    assert!(plan.estimated_duration_ms < MAX_PLAN_DURATION_MS);

    assert!(!plan.rollback_plan.rollback_steps.is_empty());
    assert!(plan.rollback_plan.estimated_rollback_time_ms > 0);
    assert!(!plan.rollback_plan.success_criteria.is_empty());
    assert_eq!(
        plan.rollback_plan.data_preservation,
        DataPreservation::PreMigrationBackup
    );
    assert!(!plan.validation_checks.is_empty());

    assert_eq!(manager.plan_state(&plan.plan_id), Some(MigrationState::Planned));
}

#[tokio::test]
async fn major_span_plan_carries_critical_risk_and_manual_review() {
    let vault = common::TestVault::new().expect("Failed to create vault");
    let manager = MigrationManager::new(vault.store.clone());
    let model = vault
        .store
        .save("user-1", common::sample_draft("user-1", "1.0.0"))
        .await
        .expect("save model");

    let plan = manager.create_migration_plan(&model, "2.0.0");

    assert_eq!(plan.risk_assessment.risk_level, RiskLevel::Critical);
    assert!(plan
        .risk_assessment
        .risk_factors
        .iter()
        .any(|f| f.kind == RiskKind::DataLoss));
    assert!(plan
        .validation_checks
        .iter()
        .any(|check| check.name == "manual review"));
    assert_eq!(
        plan.rollback_plan.data_preservation,
        DataPreservation::ExistingBackupsOnly
    );
    assert!(plan
        .migration_steps
        .iter()
        .any(|step| step.kind == StepKind::DataFormatUpgrade));
}

#[tokio::test]
async fn low_disk_probe_adds_system_instability_risk() {
    let vault = common::TestVault::new().expect("Failed to create vault");
    let manager = MigrationManager::new(vault.store.clone())
        .with_resource_probe(Arc::new(FixedProbe::new(1024)));
    let model = vault
        .store
        .save("user-1", common::sample_draft("user-1", "1.0.1"))
        .await
        .expect("save model");

    let plan = manager.create_migration_plan(&model, "1.0.2");

    assert!(plan
        .risk_assessment
        .risk_factors
        .iter()
        .any(|f| f.kind == RiskKind::SystemInstability));
    assert!(plan.risk_assessment.risk_level >= RiskLevel::High);
}

// ============================================================================
// Execution
// ============================================================================

#[tokio::test]
async fn minor_migration_completes_and_stamps_version() {
    let vault = common::TestVault::new().expect("Failed to create vault");
    let manager = MigrationManager::new(vault.store.clone());
    let model = vault
        .store
        .save(
            "user-1",
            common::sample_draft_with_marker("user-1", "1.0.0", "carried-through"),
        )
        .await
        .expect("save model");

    let plan = manager.create_migration_plan(&model, "1.1.0");
    let result = manager
        .execute_migration_plan(&plan)
        .await
        .expect("execution attempt");

    assert!(result.success, "migration should succeed: {:?}", result.error);
    assert_eq!(result.state, MigrationState::Completed);
    assert_eq!(result.steps_completed, result.steps_total);
    assert!(result.integrity.passed);
    assert!(result.rollback_available);
    assert!(result.error.is_none());
    assert!(!result.log.is_empty());
    assert_eq!(result.from_version, "1.0.0");
    assert_eq!(result.to_version, "1.1.0");

    assert_eq!(
        manager.plan_state(&plan.plan_id),
        Some(MigrationState::Completed)
    );
    assert_eq!(
        manager.migration_state(&result.migration_id),
        Some(MigrationState::Completed)
    );

    let migrated = vault.store.load("user-1").await.expect("load migrated model");
    assert_eq!(migrated.version, "1.1.0");
    let payload = vault
        .store
        .decode_payload(&migrated)
        .await
        .expect("decode migrated payload");
    assert_eq!(payload.schema_version, "1.1.0");
    assert_eq!(payload.parameters["marker"], "carried-through");

    // the pre-migration anchor is in the registry
    let backups = vault.store.list_backups("user-1").expect("list backups");
    assert!(!backups.is_empty());
    assert_eq!(backups[0].model_version, "1.0.0");
}

#[tokio::test]
async fn plan_is_consumed_exactly_once() {
    let vault = common::TestVault::new().expect("Failed to create vault");
    let manager = MigrationManager::new(vault.store.clone());
    let model = vault
        .store
        .save("user-1", common::sample_draft("user-1", "1.0.0"))
        .await
        .expect("save model");

    let plan = manager.create_migration_plan(&model, "1.0.1");
    manager
        .execute_migration_plan(&plan)
        .await
        .expect("first execution");

    let second = manager.execute_migration_plan(&plan).await;
    assert!(matches!(
        second,
        Err(MigrationError::PlanAlreadyExecuted(_))
    ));
}

#[tokio::test]
async fn plan_from_another_manager_is_unknown() {
    let vault = common::TestVault::new().expect("Failed to create vault");
    let manager_a = MigrationManager::new(vault.store.clone());
    let manager_b = MigrationManager::new(vault.store.clone());
    let model = vault
        .store
        .save("user-1", common::sample_draft("user-1", "1.0.0"))
        .await
        .expect("save model");

    let plan = manager_a.create_migration_plan(&model, "1.0.1");
    let result = manager_b.execute_migration_plan(&plan).await;
    assert!(matches!(result, Err(MigrationError::UnknownPlan(_))));
}

#[tokio::test]
async fn incompatible_major_span_fails_at_gate_without_touching_state() {
    let vault = common::TestVault::new().expect("Failed to create vault");
    let manager = MigrationManager::new(vault.store.clone());
    let model = vault
        .store
        .save(
            "user-1",
            common::sample_draft_with_marker("user-1", "1.0.0", "untouched"),
        )
        .await
        .expect("save model");
    let pre_checksum = model.model_data.checksum.clone();

    let plan = manager.create_migration_plan(&model, "2.0.0");
    let result = manager
        .execute_migration_plan(&plan)
        .await
        .expect("execution attempt");

    assert!(!result.success);
    assert_eq!(result.state, MigrationState::Failed);
    assert_eq!(result.steps_completed, 0);
    assert!(result.rollback_available);
    assert!(result
        .error
        .as_deref()
        .is_some_and(|e| e.contains("incompatible")));

    // the stored model is exactly as before the attempt
    let current = vault.store.load("user-1").await.expect("load model");
    assert_eq!(current.version, "1.0.0");
    assert_eq!(current.model_data.checksum, pre_checksum);
}

#[tokio::test]
async fn downgrade_fails_at_gate_with_restore_hint() {
    let vault = common::TestVault::new().expect("Failed to create vault");
    let manager = MigrationManager::new(vault.store.clone());
    let model = vault
        .store
        .save("user-1", common::sample_draft("user-1", "1.2.0"))
        .await
        .expect("save model");

    let plan = manager.create_migration_plan(&model, "1.1.0");
    let result = manager
        .execute_migration_plan(&plan)
        .await
        .expect("execution attempt");

    assert!(!result.success);
    assert_eq!(result.state, MigrationState::Failed);
    assert_eq!(result.steps_completed, 0);
    assert!(result
        .error
        .as_deref()
        .is_some_and(|e| e.contains("restore a backup")));

    let current = vault.store.load("user-1").await.expect("load model");
    assert_eq!(current.version, "1.2.0");
}

// ============================================================================
// Rollback
// ============================================================================

#[tokio::test]
async fn rollback_restores_pre_migration_state() {
    let vault = common::TestVault::new().expect("Failed to create vault");
    let manager = MigrationManager::new(vault.store.clone());
    let model = vault
        .store
        .save(
            "user-1",
            common::sample_draft_with_marker("user-1", "1.0.0", "original-state"),
        )
        .await
        .expect("save model");
    let pre_checksum = model.model_data.checksum.clone();

    let plan = manager.create_migration_plan(&model, "1.1.0");
    let result = manager
        .execute_migration_plan(&plan)
        .await
        .expect("execution attempt");
    assert!(result.success);

    let rollback = manager
        .rollback_migration(&result.migration_id)
        .await
        .expect("rollback attempt");
    assert!(rollback.success, "rollback should succeed: {:?}", rollback.error);
    assert_eq!(rollback.user_id.as_deref(), Some("user-1"));
    assert_eq!(rollback.restored_version.as_deref(), Some("1.0.0"));
    assert!(rollback.integrity.passed);
    assert_eq!(
        manager.plan_state(&plan.plan_id),
        Some(MigrationState::RolledBack)
    );

    let restored = vault.store.load("user-1").await.expect("load restored model");
    assert_eq!(restored.version, "1.0.0");
    assert_eq!(restored.model_data.checksum, pre_checksum);
    let payload = vault
        .store
        .decode_payload(&restored)
        .await
        .expect("decode restored payload");
    assert_eq!(payload.schema_version, "1.0.0");
    assert_eq!(payload.parameters["marker"], "original-state");
}

#[tokio::test]
async fn rollback_after_failed_attempt_restores_anchor() {
    let vault = common::TestVault::new().expect("Failed to create vault");
    let manager = MigrationManager::new(vault.store.clone());
    let model = vault
        .store
        .save("user-1", common::sample_draft("user-1", "1.0.0"))
        .await
        .expect("save model");
    let pre_checksum = model.model_data.checksum.clone();

    let plan = manager.create_migration_plan(&model, "2.0.0");
    let result = manager
        .execute_migration_plan(&plan)
        .await
        .expect("execution attempt");
    assert!(!result.success);
    assert_eq!(result.state, MigrationState::Failed);

    let rollback = manager
        .rollback_migration(&result.migration_id)
        .await
        .expect("rollback attempt");
    assert!(rollback.success);
    assert_eq!(rollback.restored_version.as_deref(), Some("1.0.0"));

    let restored = vault.store.load("user-1").await.expect("load restored model");
    assert_eq!(restored.model_data.checksum, pre_checksum);
}

#[tokio::test]
async fn rollback_of_unknown_migration_returns_failure_result() {
    let vault = common::TestVault::new().expect("Failed to create vault");
    let manager = MigrationManager::new(vault.store.clone());

    let rollback = manager
        .rollback_migration("mig_nonexistent")
        .await
        .expect("rollback attempt");
    assert!(!rollback.success);
    assert!(rollback.user_id.is_none());
    assert!(rollback.restored_version.is_none());
    assert!(!rollback.integrity.passed);
    assert!(rollback.error.is_some());
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn concurrent_save_is_never_silently_clobbered_by_migration() {
    let vault = common::TestVault::new().expect("Failed to create vault");
    let manager = MigrationManager::new(vault.store.clone());

    // Whichever side wins the user lock, the loser must fail loudly: the
    // migration refuses a model that changed after planning, and a direct
    // save refuses to regress past the migrated version.
    for user in (0..8).map(|i| format!("user-{}", i)) {
        let model = vault
            .store
            .save(
                &user,
                common::sample_draft_with_marker(&user, "1.0.0", "original"),
            )
            .await
            .expect("seed model");
        let plan = manager.create_migration_plan(&model, "1.1.0");

        let store = vault.store.clone();
        let save_user = user.clone();
        let save = tokio::spawn(async move {
            store
                .save(
                    &save_user,
                    common::sample_draft_with_marker(&save_user, "1.0.1", "fresh-user-data"),
                )
                .await
        });
        let result = manager
            .execute_migration_plan(&plan)
            .await
            .expect("execution attempt");
        let saved = save.await.expect("save task");

        let current = vault.store.load(&user).await.expect("load model");
        let payload = vault
            .store
            .decode_payload(&current)
            .await
            .expect("decode payload");
        match saved {
            Ok(_) => {
                assert!(
                    !result.success,
                    "{}: migration must refuse a model that changed after planning",
                    user
                );
                assert_eq!(current.version, "1.0.1");
                assert_eq!(payload.parameters["marker"], "fresh-user-data");
            }
            Err(_) => {
                assert!(result.success, "{}: {:?}", user, result.error);
                assert_eq!(current.version, "1.1.0");
                assert_eq!(payload.parameters["marker"], "original");
            }
        }
    }
}

#[tokio::test]
async fn concurrent_migrations_for_distinct_users_both_complete() {
    let vault = common::TestVault::new().expect("Failed to create vault");
    let manager = MigrationManager::new(vault.store.clone());

    let model_a = vault
        .store
        .save("user-a", common::sample_draft("user-a", "1.0.0"))
        .await
        .expect("save user-a");
    let model_b = vault
        .store
        .save("user-b", common::sample_draft("user-b", "1.0.0"))
        .await
        .expect("save user-b");

    let plan_a = manager.create_migration_plan(&model_a, "1.1.0");
    let plan_b = manager.create_migration_plan(&model_b, "1.1.0");

    let (result_a, result_b) = tokio::join!(
        manager.execute_migration_plan(&plan_a),
        manager.execute_migration_plan(&plan_b)
    );

    let result_a = result_a.expect("user-a attempt");
    let result_b = result_b.expect("user-b attempt");
    assert!(result_a.success, "user-a: {:?}", result_a.error);
    assert!(result_b.success, "user-b: {:?}", result_b.error);

    let loaded_a = vault.store.load("user-a").await.expect("load user-a");
    let loaded_b = vault.store.load("user-b").await.expect("load user-b");
    assert_eq!(loaded_a.version, "1.1.0");
    assert_eq!(loaded_b.version, "1.1.0");
}
