use serde_json::{json, Value};
use tollgate_core::domain::approval::{Approval, ApprovalStatus, CartId};
use tollgate_core::errors::{ApplicationError, InterfaceError};
use tollgate_db::connect_with_config;
use tollgate_workflows::{ApprovalService, ApprovalStores};

use crate::commands::{build_runtime, load_config, CommandResult};

/// Reports the checkout gate of one cart and its live approvals.
pub fn run(cart_id: &str) -> CommandResult {
    let cart_id = cart_id.trim();
    if cart_id.is_empty() {
        return CommandResult::failure("status", "bad_request", "cart id must not be blank", 2);
    }

    let config = match load_config("status") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match build_runtime("status") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };
    let cart = CartId(cart_id.to_string());

    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        let service =
            ApprovalService::from_config(ApprovalStores::sqlite(pool.clone()), &config.approvals);

        let lookup = async {
            let status = service.get_aggregate_status(&cart).await?;
            let approvals = service.list_approvals_for_cart(&cart).await?;
            Ok::<_, ApplicationError>((status, approvals))
        }
        .await;
        pool.close().await;

        lookup.map_err(|error| {
            let interface = error.into_interface(format!("status:{cart_id}"));
            let exit_code = match interface {
                InterfaceError::NotFound { .. } => 6u8,
                InterfaceError::BadRequest { .. } => 2,
                _ => 5,
            };
            (interface.class(), interface.to_string(), exit_code)
        })
    });

    match result {
        Ok((status, approvals)) => CommandResult::success_with_data(
            "status",
            format!("cart `{cart_id}` is {}", status.as_str()),
            Some(json!({
                "cart_id": cart_id,
                "status": status.as_str(),
                "checkout_allowed": status == ApprovalStatus::Approved,
                "approvals": approvals.iter().map(approval_summary).collect::<Vec<Value>>(),
            })),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("status", error_class, message, exit_code)
        }
    }
}

fn approval_summary(approval: &Approval) -> Value {
    json!({
        "id": approval.id.0,
        "approval_type": approval.approval_type.as_str(),
        "status": approval.status.as_str(),
        "required_count": approval.required_count,
        "approvals_received": approval.approver_ids.len(),
        "escalated": approval.escalated,
        "created_at": approval.created_at.to_rfc3339(),
    })
}
