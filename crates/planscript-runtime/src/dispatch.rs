//! Tool dispatch funnel
//!
//! Every tool call from every path (apply, do, agent loop, parallel)
//! goes through `run_tool_action`: charge the budget, check policy,
//! clear the approval gate, validate, await the tool, emit the `tool`
//! event. ASK_USER and REPORT are operator-facing and handled here
//! rather than by the registry.

use serde_json::{Value as Json};
use tracing::debug;

use planscript_core::event::EventKind;
use planscript_core::plan::PlanAction;
use planscript_core::policy::PolicyViolation;
use planscript_tools::ToolCtx;

use crate::context::RunContext;
use crate::VmError;

/// Dispatch one named action with raw args through the full funnel.
/// Returns the tool output as JSON.
pub async fn run_tool_action(
    ctx: &RunContext,
    name: &str,
    args: &Json,
) -> Result<Json, VmError> {
    ctx.budget().borrow_mut().charge_tool_call()?;

    let policy = ctx.active_policy();
    policy.check_tool(name)?;

    // Validation happens before approval so the operator only ever sees
    // well-formed requests.
    let action = PlanAction::parse(name, args)?;
    let canonical_args = action.args_value();

    if policy.require_approval {
        ctx.emit(EventKind::ApprovalRequest {
            tool: name.to_string(),
            input: canonical_args.clone(),
        })?;
        let approved = ctx
            .operator
            .approve(name, &canonical_args.to_string())
            .await?;
        ctx.emit(EventKind::ApprovalResponse { approved })?;
        if !approved {
            return Err(VmError::Policy(PolicyViolation::ApprovalDenied(
                name.to_string(),
            )));
        }
    }

    debug!(tool = name, "dispatching tool");
    let output = match &action {
        PlanAction::Report { message, .. } => {
            println!("[ps] {}", message);
            Json::String(message.clone())
        }
        PlanAction::AskUser { question, choices } => {
            let answer = ctx.operator.ask(question, choices.as_deref()).await?;
            Json::String(answer)
        }
        _ => {
            let tool_ctx = ToolCtx::new(ctx.root.clone(), policy);
            ctx.registry.execute(&tool_ctx, name, args).await?
        }
    };

    ctx.emit(EventKind::Tool {
        name: name.to_string(),
        input: canonical_args,
        output: output.clone(),
    })?;
    Ok(output)
}

/// Split a plan-shaped JSON value into `(action, args)` for dispatch.
pub fn plan_parts(plan: &Json) -> Result<(String, Json), VmError> {
    let action = plan
        .get("action")
        .and_then(|v| v.as_str())
        .ok_or_else(|| VmError::Runtime("apply expects a plan with an 'action' field".to_string()))?;
    let args = plan.get("args").cloned().unwrap_or_else(|| Json::Object(Default::default()));
    Ok((action.to_string(), args))
}
