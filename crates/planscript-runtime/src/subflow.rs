//! Sub-workflow executor
//!
//! Loads and runs a child script with its own VM, logger and budget
//! tracker. The child either copies the parent policy verbatim
//! (default) or starts from the restrictive baseline. The parent's
//! event stream brackets the child with subworkflow_start/end; the end
//! event carries a result record and, on request, a quality contract.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value as Json};
use tracing::info;

use planscript_core::budget::BudgetConfig;
use planscript_core::event::EventKind;
use planscript_core::policy::Policy;
use planscript_core::sandbox::safe_resolve;
use planscript_memory::MemoryStore;

use crate::context::RunContext;
use crate::logger::RunLogger;
use crate::vm::Vm;
use crate::VmError;

/// Run a child script. Returns the result record that also rides the
/// subworkflow_end event.
pub async fn run_subworkflow(vm: &Vm, path: &str, opts: &Json) -> Result<Json, VmError> {
    let parent = vm.ctx();
    let script_path = safe_resolve(&parent.root, path)?;
    let source = std::fs::read_to_string(&script_path)
        .map_err(|e| VmError::Runtime(format!("reading {}: {}", path, e)))?;
    let stmts = planscript_lang::parse_script(&source)?;

    let child_run_id = new_child_run_id();
    let inherit_policy = opts
        .get("inherit_policy")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let policy = if inherit_policy {
        parent.active_policy()
    } else {
        Policy::restricted()
    };

    let mut budget = parent.budget().borrow().config().clone();
    if let Some(override_spec) = opts.get("budget_override") {
        budget = budget.merged(&BudgetConfig::from_options(override_spec));
    }
    if let Some(timeout_ms) = opts.get("timeout_ms").and_then(|v| v.as_u64()) {
        budget.max_time_ms = Some(match budget.max_time_ms {
            Some(existing) => existing.min(timeout_ms),
            None => timeout_ms,
        });
    }

    let inherit_memory = opts
        .get("inherit_memory")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let memory = if inherit_memory {
        parent.memory.clone()
    } else {
        Rc::new(RefCell::new(MemoryStore::new(&parent.root)))
    };

    parent.emit(EventKind::SubworkflowStart {
        child_run_id: child_run_id.clone(),
        options: opts.clone(),
    })?;

    let child_logger = RunLogger::create(&parent.root, child_run_id.clone())?;
    let child_ctx = Rc::new(RunContext::new(
        parent.root.clone(),
        child_logger,
        policy,
        budget,
        parent.registry.clone(),
        memory,
        parent.operator.clone(),
        parent.llm_defaults.clone(),
        parent.transport_override.clone(),
    ));
    child_ctx.set_context_format(parent.context_format());

    let child_vm = Vm::new(child_ctx.clone());
    if let Some(args) = opts.get("args").and_then(|v| v.as_object()) {
        for (name, value) in args {
            child_vm.define_global(name, crate::value::Value::from_json(value));
        }
    }

    info!(child_run_id = %child_run_id, script = path, "subworkflow started");
    let run_result = child_vm.run(&stmts).await;
    let snapshot = child_ctx.budget().borrow().snapshot();

    let want_contract = opts
        .get("return_contract")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let stage = opts.get("stage").cloned().unwrap_or(Json::Null);

    let mut record = json!({
        "ok": run_result.is_ok(),
        "childRunId": child_run_id,
        "logs": child_ctx.logger.dir().display().to_string(),
        "stage": stage,
        "budget": snapshot,
    });

    match &run_result {
        Ok(returned) => {
            let _ = child_ctx.logger.finalize(&child_ctx.summary(true, None));
            if want_contract {
                let contract = contract_from_return(returned.as_ref(), &child_ctx);
                record["contract"] = contract;
            }
            if let Some(returned) = returned {
                record["result"] = returned.clone();
            }
        }
        Err(e) => {
            let message = e.to_string();
            child_ctx.emit_error(&message);
            let _ = child_ctx
                .logger
                .finalize(&child_ctx.summary(false, Some(&message)));
            record["error"] = json!(message);
            if want_contract {
                record["contract"] = json!({
                    "ok": false,
                    "issues": [{"severity": "error", "message": message}],
                    "evidence": {},
                    "metrics": contract_metrics(&child_ctx),
                });
            }
        }
    }

    parent.emit(EventKind::SubworkflowEnd {
        child_run_id: record["childRunId"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        result: record.clone(),
    })?;
    Ok(record)
}

/// Use the child's returned object as the contract when it is shaped
/// like one; the default success contract otherwise.
fn contract_from_return(returned: Option<&Json>, child_ctx: &RunContext) -> Json {
    if let Some(value) = returned {
        if value.get("ok").and_then(|v| v.as_bool()).is_some() {
            let mut contract = value.clone();
            if let Some(map) = contract.as_object_mut() {
                map.entry("issues").or_insert_with(|| json!([]));
                map.entry("evidence").or_insert_with(|| json!({}));
                map.entry("metrics")
                    .or_insert_with(|| contract_metrics(child_ctx));
            }
            return contract;
        }
    }
    json!({
        "ok": true,
        "issues": [],
        "evidence": {},
        "metrics": contract_metrics(child_ctx),
    })
}

fn contract_metrics(child_ctx: &RunContext) -> Json {
    let snapshot = child_ctx.budget().borrow().snapshot();
    json!({
        "timeMs": snapshot.elapsed_ms,
        "steps": snapshot.steps,
        "llmCalls": snapshot.llm_calls,
    })
}

fn new_child_run_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect();
    format!("sub-{}-{}", Utc::now().timestamp_millis(), suffix)
}
