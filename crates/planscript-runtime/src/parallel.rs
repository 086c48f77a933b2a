//! Parallel batches
//!
//! `parallel(items, {max, fail_fast})` executes a batch of restricted
//! actions (READ_FILE and SEARCH only) in fixed-size waves. Results come
//! back in input order as `{ok, value}` / `{ok: false, error}` slots.
//! Tool events are emitted in input order after each wave so the event
//! stream stays deterministic regardless of I/O completion order.

use futures_util::future::join_all;
use serde_json::{json, Value as Json};

use planscript_core::event::EventKind;
use planscript_core::plan::PlanAction;
use planscript_tools::ToolCtx;

use crate::dispatch::plan_parts;
use crate::value::Value;
use crate::vm::Vm;
use crate::VmError;

const DEFAULT_MAX_WAVE: usize = 4;
/// Actions safe to run side by side.
const SAFE_ACTIONS: [&str; 2] = ["READ_FILE", "SEARCH"];

pub async fn run_parallel(vm: &Vm, items: &Value, opts: &Json) -> Result<Value, VmError> {
    let ctx = vm.ctx();
    let items = match items {
        Value::Array(items) => items.borrow().clone(),
        other => {
            return Err(VmError::Runtime(format!(
                "parallel expects an array of actions, got {}",
                other.type_name()
            )))
        }
    };
    let max = opts
        .get("max")
        .and_then(|v| v.as_u64())
        .map(|v| v.max(1) as usize)
        .unwrap_or(DEFAULT_MAX_WAVE);
    let fail_fast = opts
        .get("fail_fast")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    // The allowlist is checked up front: one unsafe action fails the
    // whole call before anything runs.
    let mut actions: Vec<(String, Json)> = Vec::with_capacity(items.len());
    for item in &items {
        let (name, args) = plan_parts(&item.to_json())?;
        if !SAFE_ACTIONS.contains(&name.as_str()) {
            return Err(VmError::Runtime(format!(
                "parallel allows only READ_FILE and SEARCH, got {}",
                name
            )));
        }
        actions.push((name, args));
    }

    let mut slots: Vec<Option<Json>> = vec![None; actions.len()];
    let mut aborted = false;

    for wave_start in (0..actions.len()).step_by(max) {
        if aborted {
            break;
        }
        let wave_end = (wave_start + max).min(actions.len());

        // Budget, policy and validation run sequentially before the wave
        // launches; only tool I/O overlaps.
        let mut launches = Vec::new();
        for index in wave_start..wave_end {
            let (name, args) = &actions[index];
            if let Err(e) = ctx.budget().borrow_mut().charge_tool_call() {
                return Err(VmError::Budget(e));
            }
            let policy = ctx.active_policy();
            if let Err(e) = policy.check_tool(name) {
                slots[index] = Some(json!({"ok": false, "error": e.to_string()}));
                continue;
            }
            let action = match PlanAction::parse(name, args) {
                Ok(action) => action,
                Err(e) => {
                    slots[index] = Some(json!({"ok": false, "error": e.to_string()}));
                    continue;
                }
            };
            let tool_ctx = ToolCtx::new(ctx.root.clone(), policy);
            let registry = ctx.registry.clone();
            let name = name.clone();
            let args = args.clone();
            launches.push((index, name, args, action, tool_ctx, registry));
        }

        let futures = launches.iter().map(|(_, name, args, _, tool_ctx, registry)| {
            let name = name.clone();
            let args = args.clone();
            async move { registry.execute(tool_ctx, &name, &args).await }
        });
        let outputs = join_all(futures).await;

        for ((index, name, _, action, _, _), output) in launches.iter().zip(outputs) {
            match output {
                Ok(value) => {
                    ctx.emit(EventKind::Tool {
                        name: name.clone(),
                        input: action.args_value(),
                        output: value.clone(),
                    })?;
                    slots[*index] = Some(json!({"ok": true, "value": value}));
                }
                Err(e) => {
                    slots[*index] = Some(json!({"ok": false, "error": e.to_string()}));
                }
            }
        }

        let wave_failed = slots[wave_start..wave_end]
            .iter()
            .any(|slot| matches!(slot, Some(v) if v["ok"] == false));
        if fail_fast && wave_failed {
            aborted = true;
        }
    }

    let results: Vec<Json> = slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| json!({"ok": false, "error": "skipped (fail_fast)"})))
        .collect();
    Ok(Value::from_json(&Json::Array(results)))
}
