use std::env;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use rust_decimal::Decimal;
use serde_json::Value;
use tempfile::TempDir;
use tollgate_cli::commands::{config, doctor, escalate, migrate, status};
use tollgate_core::audit::PiiHasher;
use tollgate_core::domain::approval::{ApprovalType, CartId};
use tollgate_core::domain::purchase::PurchaseContext;
use tollgate_core::domain::rule::{NewApprovalRule, RuleConditions};
use tollgate_core::domain::settings::{ApprovalSettingsUpdate, CompanyId};
use tollgate_db::{connect_with_settings, migrations};
use tollgate_workflows::{ApprovalService, ApprovalStores};

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("TOLLGATE_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["message"], "applied 1 pending migration(s)");
    });
}

#[test]
fn migrate_returns_config_failure_for_non_sqlite_url() {
    with_env(&[("TOLLGATE_DATABASE_URL", "postgres://localhost/tollgate")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn doctor_flags_unmigrated_database() {
    with_env(&[("TOLLGATE_DATABASE_URL", "sqlite::memory:")], || {
        let report = parse_payload(&doctor::run(true));

        assert_eq!(report["overall_status"], "fail");
        let checks = report["checks"].as_array().expect("checks array");
        let status_of = |name: &str| {
            checks
                .iter()
                .find(|check| check["name"] == name)
                .map(|check| check["status"].clone())
                .expect("check present")
        };
        assert_eq!(status_of("config_validation"), "pass");
        assert_eq!(status_of("database_connectivity"), "pass");
        assert_eq!(status_of("schema_migrations"), "fail");
    });
}

#[test]
fn doctor_passes_on_migrated_database() {
    let dir = TempDir::new().expect("temp dir");
    let url = file_url(dir.path());
    with_env(&[("TOLLGATE_DATABASE_URL", &url)], || {
        assert_eq!(migrate::run().exit_code, 0);

        let human = doctor::run(false);
        assert!(human.starts_with("doctor: all readiness checks passed"), "{human}");
        assert!(human.contains("- [ok] schema_migrations"));
    });
}

#[test]
fn config_reports_env_source_and_redacts_pepper() {
    with_env(
        &[
            ("TOLLGATE_APPROVALS_AGGREGATE_MAX_ATTEMPTS", "7"),
            ("TOLLGATE_APPROVALS_PII_HASH_PEPPER", "pepper-secret-value"),
        ],
        || {
            let output = config::run();

            assert!(output.contains(
                "- approvals.aggregate_max_attempts = 7 (source: env (TOLLGATE_APPROVALS_AGGREGATE_MAX_ATTEMPTS))"
            ));
            assert!(output.contains("- approvals.pii_hash_pepper = <redacted>"));
            assert!(output.contains("- database.url = sqlite://tollgate.db (source: default)"));
            assert!(!output.contains("pepper-secret-value"));
        },
    );
}

#[test]
fn escalate_reports_empty_sweep_on_fresh_database() {
    let dir = TempDir::new().expect("temp dir");
    let url = file_url(dir.path());
    with_env(&[("TOLLGATE_DATABASE_URL", &url)], || {
        assert_eq!(migrate::run().exit_code, 0);

        let result = escalate::run(Some(25));
        assert_eq!(result.exit_code, 0, "{}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "escalate");
        assert_eq!(payload["data"]["limit"], 25);
        assert_eq!(payload["data"]["examined"], 0);
        assert_eq!(payload["data"]["escalated"].as_array().map(Vec::len), Some(0));
    });
}

#[test]
fn status_reports_unknown_cart_as_not_found() {
    let dir = TempDir::new().expect("temp dir");
    let url = file_url(dir.path());
    with_env(&[("TOLLGATE_DATABASE_URL", &url)], || {
        assert_eq!(migrate::run().exit_code, 0);

        let result = status::run("cart-missing");
        assert_eq!(result.exit_code, 6);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["error_class"], "not_found");
    });
}

#[test]
fn status_shows_pending_gate_for_requested_cart() {
    let dir = TempDir::new().expect("temp dir");
    let url = file_url(dir.path());
    with_env(&[("TOLLGATE_DATABASE_URL", &url)], || {
        assert_eq!(migrate::run().exit_code, 0);
        request_admin_approval(&url, "cart-7");

        let result = status::run("cart-7");
        assert_eq!(result.exit_code, 0, "{}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["data"]["status"], "pending");
        assert_eq!(payload["data"]["checkout_allowed"], false);
        let approvals = payload["data"]["approvals"].as_array().expect("approvals");
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0]["approval_type"], "admin");
    });
}

fn request_admin_approval(url: &str, cart: &str) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(async {
        let pool = connect_with_settings(url, 1, 5).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let service = ApprovalService::new(ApprovalStores::sqlite(pool.clone()), PiiHasher::default());
        let company = CompanyId("comp-cli".to_string());
        service
            .update_settings(&company, &ApprovalSettingsUpdate::default())
            .await
            .expect("settings");
        service
            .create_rule(NewApprovalRule {
                company_id: company.clone(),
                rule_name: "always admin".to_string(),
                conditions: RuleConditions::default(),
                required_approval_type: ApprovalType::Admin,
                required_approvers_count: 1,
                priority: 1,
                is_active: true,
                effective_from: None,
                effective_until: None,
            })
            .await
            .expect("rule");
        service
            .evaluate_and_request_approvals(
                &company,
                &CartId(cart.to_string()),
                &PurchaseContext::new(Decimal::new(100, 0), 1),
            )
            .await
            .expect("evaluate");
        pool.close().await;
    });
}

fn file_url(dir: &Path) -> String {
    format!("sqlite://{}?mode=rwc", dir.join("tollgate.db").display())
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "TOLLGATE_DATABASE_URL",
        "TOLLGATE_DATABASE_MAX_CONNECTIONS",
        "TOLLGATE_DATABASE_TIMEOUT_SECS",
        "TOLLGATE_LOGGING_LEVEL",
        "TOLLGATE_LOGGING_FORMAT",
        "TOLLGATE_LOG_LEVEL",
        "TOLLGATE_LOG_FORMAT",
        "TOLLGATE_APPROVALS_AGGREGATE_MAX_ATTEMPTS",
        "TOLLGATE_APPROVALS_ESCALATION_SWEEP_BATCH_SIZE",
        "TOLLGATE_APPROVALS_PII_HASH_PEPPER",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
