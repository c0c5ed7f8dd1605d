use chrono::Utc;
use serde_json::json;
use tollgate_db::connect_with_config;
use tollgate_workflows::{ApprovalService, ApprovalStores};

use crate::commands::{build_runtime, load_config, CommandResult};

/// One escalation sweep, meant to be invoked periodically by an external scheduler.
pub fn run(limit: Option<u32>) -> CommandResult {
    let config = match load_config("escalate") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match build_runtime("escalate") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };
    let limit = limit.unwrap_or(config.approvals.escalation_sweep_batch_size).max(1);

    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        let service =
            ApprovalService::from_config(ApprovalStores::sqlite(pool.clone()), &config.approvals);
        let sweep = service
            .sweep_escalations(Utc::now(), limit)
            .await
            .map_err(|error| ("escalation", error.to_string(), 5u8))?;
        pool.close().await;
        Ok::<_, (&'static str, String, u8)>(sweep)
    });

    match result {
        Ok(sweep) => {
            let escalated: Vec<&str> = sweep.escalated.iter().map(|id| id.0.as_str()).collect();
            CommandResult::success_with_data(
                "escalate",
                format!(
                    "examined {} pending approval(s), escalated {}",
                    sweep.examined,
                    escalated.len()
                ),
                Some(json!({
                    "limit": limit,
                    "examined": sweep.examined,
                    "escalated": escalated,
                    "skipped_unconfigured": sweep.skipped_unconfigured,
                })),
            )
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("escalate", error_class, message, exit_code)
        }
    }
}
