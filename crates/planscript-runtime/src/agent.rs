//! Agent loop
//!
//! Alternates LLM -> Plan -> tool apply -> history update until a
//! REPORT with done (or a budget, loop, or policy veto). Tool errors are
//! caught into the conversation as `Action ERROR:` lines rather than
//! unwinding the loop; budget exceedance always unwinds.

use std::rc::Rc;

use serde_json::Value as Json;
use tracing::debug;

use planscript_core::event::EventKind;
use planscript_core::loopdetect::{LoopDetector, LoopDetectorConfig};
use planscript_core::plan::PlanAction;
use planscript_core::sandbox::safe_resolve;
use planscript_llm::ChatMessage;

use crate::builtins::{llm_call, LlmCall};
use crate::dispatch::run_tool_action;
use crate::value::{LlmClientValue, Value};
use crate::vm::Vm;
use crate::VmError;

/// Sliding history cap, in messages.
const MAX_HISTORY: usize = 20;
/// Result text folded into continuation prompts is cut at this length.
const MAX_RESULT_PREVIEW_CHARS: usize = 600;

const AGENT_SYSTEM_PROMPT: &str = "You are an autonomous workflow agent operating inside a \
sandboxed project directory.\n\
Respond to every message with exactly ONE JSON object:\n\
{\"action\": <ACTION>, \"args\": {...}, \"done\": <bool>, \"reason\": <string>}\n\
Actions: READ_FILE {path, maxBytes?}, SEARCH {query, globs?, maxResults?}, \
WRITE_FILE {path, content, mode?}, PATCH_FILE {path, patch}, RUN_CMD {cmd, args?, timeoutMs?}, \
ASK_USER {question, choices?}, REPORT {message, filesChanged?, nextSuggestions?}.\n\
Paths are relative to the project root. PATCH_FILE patches begin with the literal \
marker REPLACE: followed by a newline and the full new file content.\n\
Set done=true only when the task is complete, then REPORT what was done.";

const NO_ASK_SUFFIX: &str = "\nNever use ASK_USER. Decide autonomously and keep working.";

/// Run the agent loop; returns the last tool result.
pub async fn run_agent(
    vm: &Vm,
    client: Rc<LlmClientValue>,
    prompt: String,
    opts: Json,
) -> Result<Value, VmError> {
    let ctx = vm.ctx();
    let max_iterations = opts.get("max_iterations").and_then(|v| v.as_u64());
    let require_write = opts
        .get("require_write")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let stop_on_report = opts
        .get("stop_on_report")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let halt_on_loop = opts
        .get("haltOnLoop")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let memory_key = opts
        .get("memory_key")
        .and_then(|v| v.as_str())
        .map(ToString::to_string);

    // Detector overrides apply for the remainder of the run.
    if ["windowSize", "maxRepeats", "maxConsecutiveFailures"]
        .iter()
        .any(|key| opts.get(key).is_some())
    {
        let config = LoopDetectorConfig::from_options(&opts);
        *ctx.detector().borrow_mut() = LoopDetector::new(config);
    }

    let context_block = read_context_files(vm, &opts)?;

    let mut system = AGENT_SYSTEM_PROMPT.to_string();
    if client.no_ask {
        system.push_str(NO_ASK_SUFFIX);
    }

    let mut history: Vec<ChatMessage> = Vec::new();
    let mut current_prompt = prompt;
    let mut iteration = 0u64;
    let mut has_written = false;
    let mut last_result = Value::Null;

    loop {
        iteration += 1;
        if let Some(max) = max_iterations {
            if iteration > max {
                debug!(iteration, "agent loop hit max_iterations");
                break;
            }
        }

        let mut call_opts = opts.clone();
        if let Some(map) = call_opts.as_object_mut() {
            // The loop manages its own mock sequencing through the client.
            map.remove("mock_plan");
        }
        let mut call = LlmCall::with_client(current_prompt.clone(), call_opts, &client);
        call.system = Some(system.clone());
        call.history = history.clone();
        call.observe = false;
        if let Some(context) = &context_block {
            if let Some(map) = call.opts.as_object_mut() {
                map.insert("context".to_string(), Json::String(context.clone()));
            }
        }
        if let Some(key) = &memory_key {
            if let Some(map) = call.opts.as_object_mut() {
                map.insert("memory_key".to_string(), Json::String(key.clone()));
            }
        }
        let result = llm_call(vm, call).await?;
        let plan = result.plan;
        let action_name = plan.action.name().to_string();
        let action_args = plan.action.args_value();

        // Apply through the dispatch funnel; tool failures feed the
        // conversation, budget failures unwind.
        let applied = run_tool_action(ctx, &action_name, &action_args).await;
        let (output, action_error) = match applied {
            Ok(output) => (Some(output), None),
            Err(e @ VmError::Budget(_)) => return Err(e),
            Err(e) => (None, Some(e.to_string())),
        };
        let success = action_error.is_none();

        let warning =
            ctx.detector()
                .borrow_mut()
                .observe(&action_name, &action_args, success);
        if let Some(warning) = warning {
            ctx.emit(EventKind::LoopWarning {
                kind: warning.kind.as_str().to_string(),
                suggestion: warning.suggestion.clone(),
            })?;
            if halt_on_loop {
                return Err(VmError::LoopDetected(warning.kind.as_str().to_string()));
            }
        }

        if let Some(key) = &memory_key {
            let detail = match &action_error {
                Some(error) => format!("ERROR {}", preview(error)),
                None => preview(
                    &output
                        .as_ref()
                        .map(|o| o.to_string())
                        .unwrap_or_default(),
                ),
            };
            ctx.memory.borrow_mut().note_event(key, &action_name, &detail);
        }

        history.push(ChatMessage::assistant(plan.to_value().to_string()));
        let feedback = match &action_error {
            Some(error) => format!("Action ERROR: {}", error),
            None => format!(
                "Action result: {}",
                preview(&output.as_ref().map(|o| o.to_string()).unwrap_or_default())
            ),
        };
        history.push(ChatMessage::user(feedback));
        while history.len() > MAX_HISTORY {
            history.remove(0);
        }

        if success {
            if let Some(output) = &output {
                last_result = Value::from_json(output);
            }
            if matches!(
                plan.action,
                PlanAction::WriteFile { .. } | PlanAction::PatchFile { .. }
            ) {
                has_written = true;
            }
        }

        let done_ok = plan.done && success;
        if done_ok {
            let is_report = matches!(plan.action, PlanAction::Report { .. });
            if is_report && !stop_on_report {
                current_prompt = continuation(&action_name, &action_error, &output);
                continue;
            }
            if require_write && !has_written {
                current_prompt = "You reported done, but nothing has been written yet. \
                                  You must WRITE_FILE or PATCH_FILE before reporting done."
                    .to_string();
                continue;
            }
            break;
        }

        current_prompt = continuation(&action_name, &action_error, &output);
    }

    Ok(last_result)
}

fn continuation(action: &str, error: &Option<String>, output: &Option<Json>) -> String {
    match error {
        Some(error) => format!(
            "The last action {} failed: {}. Decide the next action.",
            action, error
        ),
        None => format!(
            "The last action {} returned: {}. Continue toward the goal; set done=true and \
             REPORT when finished.",
            action,
            preview(&output.as_ref().map(|o| o.to_string()).unwrap_or_default())
        ),
    }
}

fn preview(text: &str) -> String {
    let count = text.chars().count();
    if count <= MAX_RESULT_PREVIEW_CHARS {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(MAX_RESULT_PREVIEW_CHARS).collect();
    cut.push_str(&format!("... [{} chars total]", count));
    cut
}

/// Read `context_files` through the sandbox into one labeled block.
fn read_context_files(vm: &Vm, opts: &Json) -> Result<Option<String>, VmError> {
    let Some(files) = opts.get("context_files").and_then(|v| v.as_array()) else {
        return Ok(None);
    };
    let mut block = String::new();
    for file in files {
        let Some(path) = file.as_str() else { continue };
        let resolved = safe_resolve(&vm.ctx().root, path)?;
        let content = std::fs::read_to_string(&resolved)
            .map_err(|e| VmError::Runtime(format!("context file {}: {}", path, e)))?;
        block.push_str(&format!("FILE {}:\n{}\n", path, content));
    }
    if block.is_empty() {
        Ok(None)
    } else {
        Ok(Some(block))
    }
}
