//! Built-in operations
//!
//! Name-resolved built-ins the VM dispatches before falling back to
//! user-defined functions: logging, sequences, LLM calls, tool apply,
//! the agent loop, parallel batches, memory operations, context format
//! selection and sub-workflows.

use std::rc::Rc;
use std::sync::Arc;

use serde_json::{json, Value as Json};

use planscript_core::event::EventKind;
use planscript_core::plan::PlanAction;
use planscript_core::serialize::{compare_formats, encode_context, ContextFormat};
use planscript_llm::{ChatMessage, LlmAdapter, LlmRequest, LlmResult};
use planscript_memory::Checkpoint;

use crate::agent;
use crate::dispatch::{plan_parts, run_tool_action};
use crate::parallel;
use crate::subflow;
use crate::value::{LlmClientValue, Value};
use crate::vm::Vm;
use crate::VmError;

const BUILTIN_NAMES: [&str; 20] = [
    "log",
    "len",
    "range",
    "LLMClient",
    "plan",
    "apply",
    "do",
    "run_agent",
    "parallel",
    "decide",
    "judge",
    "summarize",
    "build_memory",
    "recall",
    "forget",
    "archive",
    "set_context_format",
    "compare_formats",
    "run",
    "call",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTIN_NAMES.contains(&name)
}

pub async fn call_builtin(vm: &Vm, name: &str, args: Vec<Value>) -> Result<Value, VmError> {
    match name {
        "log" => {
            let parts: Vec<String> = args.iter().map(|v| v.to_string()).collect();
            println!("[ps] {}", parts.join(" "));
            Ok(Value::Null)
        }
        "len" => {
            let length = match args.first() {
                Some(Value::Str(s)) => s.chars().count() as i64,
                Some(Value::Array(items)) => items.borrow().len() as i64,
                _ => 0,
            };
            Ok(Value::Int(length))
        }
        "range" => builtin_range(&args),
        "LLMClient" => builtin_llm_client(vm, &args),
        "plan" => {
            let prompt = arg_str(&args, 0, "plan")?;
            let opts = arg_json(&args, 1);
            let result = llm_call(vm, LlmCall::prompted(prompt, opts)).await?;
            Ok(Value::from_json(&result.plan.to_value()))
        }
        "apply" => {
            let (action, action_args) = apply_target(&args)?;
            let output = run_tool_action(vm.ctx(), &action, &action_args).await?;
            Ok(Value::from_json(&output))
        }
        "do" => {
            let prompt = arg_str(&args, 0, "do")?;
            let opts = arg_json(&args, 1);
            let result = llm_call(vm, LlmCall::prompted(prompt, opts)).await?;
            let output =
                run_tool_action(vm.ctx(), result.plan.action.name(), &result.plan.action.args_value())
                    .await?;
            Ok(Value::from_json(&output))
        }
        "run_agent" => {
            let client = client_from_value(vm, args.first())?;
            let prompt = arg_str(&args, 1, "run_agent")?;
            let opts = arg_json(&args, 2);
            agent::run_agent(vm, client, prompt, opts).await
        }
        "parallel" => {
            let items = args
                .first()
                .cloned()
                .ok_or_else(|| VmError::Runtime("parallel expects an array of actions".to_string()))?;
            let opts = arg_json(&args, 1);
            parallel::run_parallel(vm, &items, &opts).await
        }
        "decide" => builtin_decide(vm, &args).await,
        "judge" => builtin_judge(vm, &args).await,
        "summarize" => builtin_summarize(vm, &args).await,
        "build_memory" => {
            let name = arg_str(&args, 0, "build_memory")?;
            let opts = arg_json(&args, 1);
            let globs: Vec<String> = opts
                .get("globs")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(ToString::to_string))
                        .collect()
                })
                .unwrap_or_default();
            let mode = opts
                .get("mode")
                .and_then(|v| v.as_str())
                .unwrap_or("refresh")
                .to_string();
            let stats = vm
                .ctx()
                .memory
                .borrow_mut()
                .build_memory(&name, &globs, &mode)?;
            Ok(Value::from_json(&stats))
        }
        "recall" => {
            let name = arg_str(&args, 0, "recall")?;
            let query = arg_str(&args, 1, "recall")?;
            let opts = arg_json(&args, 2);
            let top_k = opts.get("top_k").and_then(|v| v.as_u64()).unwrap_or(5) as usize;
            let chunks = vm.ctx().memory.borrow_mut().recall(&name, &query, top_k);
            let items: Vec<Json> = chunks.iter().map(|c| c.to_value()).collect();
            Ok(Value::from_json(&Json::Array(items)))
        }
        "forget" => {
            let opts = arg_json(&args, 0);
            let key = required_key(&opts, "memory_key", "forget")?;
            let mode = opts
                .get("mode")
                .and_then(|v| v.as_str())
                .unwrap_or("compact")
                .to_string();
            let keep_n = opts
                .get("keep_n")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize);
            let out = vm.ctx().memory.borrow_mut().forget(&key, &mode, keep_n)?;
            Ok(Value::from_json(&out))
        }
        "archive" => {
            let opts = arg_json(&args, 0);
            let key = required_key(&opts, "memory_key", "archive")?;
            let to_ltm = opts.get("to_ltm").and_then(|v| v.as_str());
            let clear_stm = opts
                .get("clear_stm")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let out = vm
                .ctx()
                .memory
                .borrow_mut()
                .archive(&key, to_ltm, clear_stm)?;
            Ok(Value::from_json(&out))
        }
        "set_context_format" => {
            let raw = arg_str(&args, 0, "set_context_format")?;
            let format = ContextFormat::parse(&raw).ok_or_else(|| {
                VmError::Runtime(format!(
                    "unknown context format '{}'; expected json or toon",
                    raw
                ))
            })?;
            vm.ctx().set_context_format(format);
            Ok(Value::Null)
        }
        "compare_formats" => {
            let value = args.first().map(|v| v.to_json()).unwrap_or(Json::Null);
            let comparison = compare_formats(&value);
            let out = serde_json::to_value(&comparison)
                .map_err(|e| VmError::Runtime(e.to_string()))?;
            Ok(Value::from_json(&out))
        }
        "run" => {
            let path = arg_str(&args, 0, "run")?;
            let opts = arg_json(&args, 1);
            subflow::run_subworkflow(vm, &path, &opts).await?;
            Ok(Value::Null)
        }
        "call" => {
            let path = arg_str(&args, 0, "call")?;
            let opts = arg_json(&args, 1);
            let record = subflow::run_subworkflow(vm, &path, &opts).await?;
            Ok(Value::from_json(&record))
        }
        other => Err(VmError::Runtime(format!("unknown builtin '{}'", other))),
    }
}

/// A client value is callable: `client("prompt", opts?)` issues one LLM
/// request and returns the Plan.
pub async fn call_client(
    vm: &Vm,
    client: &LlmClientValue,
    args: Vec<Value>,
) -> Result<Value, VmError> {
    let prompt = arg_str(&args, 0, "LLM client call")?;
    let opts = arg_json(&args, 1);
    let result = llm_call(vm, LlmCall::with_client(prompt, opts, client)).await?;
    Ok(Value::from_json(&result.plan.to_value()))
}

// ---- LLM call plumbing ----

/// One LLM call as built-ins issue it.
pub(crate) struct LlmCall<'a> {
    pub user: String,
    pub opts: Json,
    pub client: Option<&'a LlmClientValue>,
    pub system: Option<String>,
    pub history: Vec<ChatMessage>,
    /// Feed the produced plan to the loop detector. The agent loop
    /// observes on its own, with the apply outcome.
    pub observe: bool,
}

impl<'a> LlmCall<'a> {
    pub fn prompted(user: String, opts: Json) -> Self {
        Self {
            user,
            opts,
            client: None,
            system: None,
            history: Vec::new(),
            observe: true,
        }
    }

    pub fn with_client(user: String, opts: Json, client: &'a LlmClientValue) -> Self {
        Self {
            user,
            opts,
            client: Some(client),
            system: None,
            history: Vec::new(),
            observe: true,
        }
    }
}

/// Issue one adapter call: config overlay, mock resolution, memory and
/// context injection, budget charge, `llm` event, optional loop
/// observation.
pub(crate) async fn llm_call(vm: &Vm, call: LlmCall<'_>) -> Result<LlmResult, VmError> {
    let ctx = vm.ctx();
    let base = match call.client {
        Some(client) => client.config.clone(),
        None => ctx.llm_defaults.clone(),
    };
    let config = base.overlaid(&call.opts);

    let mock_plan = call
        .opts
        .get("mock_plan")
        .cloned()
        .or_else(|| call.client.and_then(|c| c.next_mock()));

    let memory_key = call
        .opts
        .get("memory_key")
        .and_then(|v| v.as_str())
        .map(ToString::to_string);
    let memory_context = memory_key
        .as_deref()
        .and_then(|key| ctx.memory.borrow().context_block(key));

    let context = call.opts.get("context").map(|value| match value {
        // Pre-rendered context passes through untouched.
        Json::String(text) => text.clone(),
        other => encode_context(other, ctx.context_format()),
    });

    let request = LlmRequest {
        system: call.system,
        user: call.user.clone(),
        context,
        history: call.history,
        mock_plan,
        memory_context,
    };

    let adapter = match &ctx.transport_override {
        Some(transport) => LlmAdapter::with_transport(config.clone(), Arc::clone(transport)),
        None => LlmAdapter::new(config.clone()),
    };
    let result = adapter.call(&request).await?;

    ctx.budget()
        .borrow_mut()
        .charge_llm_call(result.usage.total_tokens, &config.model)?;
    ctx.emit(EventKind::Llm {
        input: json!({
            "user": call.user,
            "model": config.model,
            "memory_key": memory_key,
            "mocked": request.mock_plan.is_some(),
        }),
        plan: result.plan.to_value(),
        usage: result.usage.clone(),
        latency_ms: result.latency_ms,
        retries: result.retries,
    })?;

    if call.observe {
        let warning = ctx.detector().borrow_mut().observe(
            result.plan.action.name(),
            &result.plan.action.args_value(),
            true,
        );
        if let Some(warning) = warning {
            ctx.emit(EventKind::LoopWarning {
                kind: warning.kind.as_str().to_string(),
                suggestion: warning.suggestion,
            })?;
        }
    }

    Ok(result)
}

// ---- individual built-ins ----

fn builtin_range(args: &[Value]) -> Result<Value, VmError> {
    let ints: Vec<i64> = args
        .iter()
        .map(|v| match v {
            Value::Int(n) => Ok(*n),
            other => Err(VmError::Runtime(format!(
                "range expects integers, got {}",
                other.type_name()
            ))),
        })
        .collect::<Result<_, _>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => {
            return Err(VmError::Runtime(
                "range takes 1 to 3 integer arguments".to_string(),
            ))
        }
    };
    if step == 0 {
        return Err(VmError::Runtime("range step must not be zero".to_string()));
    }
    let mut items = Vec::new();
    let mut current = start;
    while (step > 0 && current < stop) || (step < 0 && current > stop) {
        items.push(Value::Int(current));
        current += step;
    }
    Ok(Value::array(items))
}

fn builtin_llm_client(vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    let cfg = arg_json(args, 0);
    let config = vm.ctx().llm_defaults.overlaid(&cfg);
    let mock_plan = cfg.get("mock_plan").cloned();
    let no_ask = cfg.get("no_ask").and_then(|v| v.as_bool()).unwrap_or(false);
    Ok(Value::LlmClient(Rc::new(LlmClientValue::new(
        config, mock_plan, no_ask,
    ))))
}

async fn builtin_decide(vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    let spec = arg_json(args, 0);
    let question = required_key(&spec, "question", "decide")?;
    let mut prompt = format!(
        "Decision needed: {}\nReturn one JSON plan whose args object carries the decision fields.",
        question
    );
    if let Some(schema) = spec.get("schema") {
        prompt.push_str(&format!("\nThe args object must match this schema: {}", schema));
    }
    let result = llm_call(vm, LlmCall::prompted(prompt, spec)).await?;
    Ok(Value::from_json(&result.plan.action.args_value()))
}

async fn builtin_judge(vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    let question = arg_str(args, 0, "judge")?;
    let opts = arg_json(args, 1);
    let prompt = format!(
        "{}\nAnswer with a REPORT plan whose args.message is exactly \"true\" or \"false\".",
        question
    );
    let result = llm_call(vm, LlmCall::prompted(prompt, opts)).await?;
    match &result.plan.action {
        PlanAction::Report { message, .. } => match message.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            other => Err(VmError::Runtime(format!(
                "judge expected REPORT message \"true\" or \"false\", got {:?}",
                other
            ))),
        },
        other => Err(VmError::Runtime(format!(
            "judge expected a REPORT plan, got {}",
            other.name()
        ))),
    }
}

async fn builtin_summarize(vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    let instruction = arg_str(args, 0, "summarize")?;
    let opts = arg_json(args, 1);
    let key = required_key(&opts, "memory_key", "summarize")?;

    let stm_snapshot = {
        let memory = vm.ctx().memory.borrow();
        memory
            .stm(&key)
            .map(|stm| serde_json::to_value(stm).unwrap_or(Json::Null))
            .unwrap_or(Json::Null)
    };
    let prompt = format!(
        "{}\nCurrent memory state:\n{}\nAnswer with a REPORT plan whose args.message is the new summary.",
        instruction, stm_snapshot
    );
    let result = llm_call(vm, LlmCall::prompted(prompt, opts)).await?;
    let message = match &result.plan.action {
        PlanAction::Report { message, .. } => message.clone(),
        other => {
            return Err(VmError::Runtime(format!(
                "summarize expected a REPORT plan, got {}",
                other.name()
            )))
        }
    };

    let mut memory = vm.ctx().memory.borrow_mut();
    memory.set_summary(&key, message.clone());
    let first_line = message.lines().next().unwrap_or_default().to_string();
    memory.set_checkpoint(&key, Checkpoint::new(first_line));
    Ok(Value::str(message))
}

// ---- argument helpers ----

fn arg_str(args: &[Value], index: usize, what: &str) -> Result<String, VmError> {
    match args.get(index) {
        Some(Value::Str(s)) => Ok(s.clone()),
        Some(other) => Err(VmError::Runtime(format!(
            "{} expects a string at argument {}, got {}",
            what,
            index + 1,
            other.type_name()
        ))),
        None => Err(VmError::Runtime(format!(
            "{} is missing argument {}",
            what,
            index + 1
        ))),
    }
}

fn arg_json(args: &[Value], index: usize) -> Json {
    args.get(index)
        .map(|v| v.to_json())
        .unwrap_or(Json::Object(Default::default()))
}

fn required_key(opts: &Json, key: &str, what: &str) -> Result<String, VmError> {
    opts.get(key)
        .and_then(|v| v.as_str())
        .map(ToString::to_string)
        .ok_or_else(|| VmError::Runtime(format!("{} requires a '{}' option", what, key)))
}

/// `apply(plan)` or `apply("ACTION", args)`.
fn apply_target(args: &[Value]) -> Result<(String, Json), VmError> {
    match args.first() {
        Some(Value::Str(action)) => {
            let action_args = arg_json(args, 1);
            Ok((action.clone(), action_args))
        }
        Some(plan @ Value::Object(_)) => plan_parts(&plan.to_json()),
        Some(other) => Err(VmError::Runtime(format!(
            "apply expects a plan object or an action name, got {}",
            other.type_name()
        ))),
        None => Err(VmError::Runtime("apply is missing its argument".to_string())),
    }
}

/// `run_agent` accepts a live client or a config object.
fn client_from_value(vm: &Vm, value: Option<&Value>) -> Result<Rc<LlmClientValue>, VmError> {
    match value {
        Some(Value::LlmClient(client)) => Ok(client.clone()),
        Some(cfg @ Value::Object(_)) => {
            let cfg = cfg.to_json();
            let config = vm.ctx().llm_defaults.overlaid(&cfg);
            let mock_plan = cfg.get("mock_plan").cloned();
            let no_ask = cfg.get("no_ask").and_then(|v| v.as_bool()).unwrap_or(false);
            Ok(Rc::new(LlmClientValue::new(config, mock_plan, no_ask)))
        }
        Some(other) => Err(VmError::Runtime(format!(
            "run_agent expects an LLM client or config object, got {}",
            other.type_name()
        ))),
        None => Err(VmError::Runtime(
            "run_agent is missing its client argument".to_string(),
        )),
    }
}
