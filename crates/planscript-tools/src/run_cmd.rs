//! RUN_CMD tool
//!
//! Spawns a subprocess with cwd at the project root. The command token
//! must be in the active policy's allowCommands; the wall-clock timeout
//! kills the process (default 60 s, hard cap 120 s).

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::time::timeout;

use planscript_core::plan::{PlanAction, MAX_CMD_TIMEOUT_MS};

use crate::{Tool, ToolCtx, ToolError};

const DEFAULT_TIMEOUT_MS: u64 = 60_000;

pub struct RunCmdTool;

#[async_trait]
impl Tool for RunCmdTool {
    fn name(&self) -> &'static str {
        "RUN_CMD"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "cmd": {
                    "type": "string",
                    "description": "Executable name; must be listed in the policy allowCommands."
                },
                "args": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Arguments passed verbatim; no shell interpretation."
                },
                "timeoutMs": {
                    "type": "integer",
                    "description": "Wall-clock kill timeout.",
                    "default": DEFAULT_TIMEOUT_MS,
                    "maximum": MAX_CMD_TIMEOUT_MS
                }
            },
            "required": ["cmd"]
        })
    }

    async fn run(&self, ctx: &ToolCtx, action: &PlanAction) -> Result<Value, ToolError> {
        let PlanAction::RunCmd {
            cmd,
            args,
            timeout_ms,
        } = action
        else {
            return Err(ToolError::Io("RUN_CMD received a foreign action".to_string()));
        };
        ctx.policy.check_command(cmd)?;

        let ms = timeout_ms
            .unwrap_or(DEFAULT_TIMEOUT_MS)
            .min(MAX_CMD_TIMEOUT_MS);

        let mut command = Command::new(cmd);
        command
            .args(args)
            .current_dir(&ctx.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ToolError::MissingCommand(cmd.clone())
            } else {
                ToolError::Io(format!("spawn '{}': {}", cmd, e))
            }
        })?;

        let output = match timeout(Duration::from_millis(ms), child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ToolError::Io(format!("wait '{}': {}", cmd, e))),
            // Dropping the future drops the child, which kills it.
            Err(_) => {
                return Err(ToolError::CommandTimeout {
                    cmd: cmd.clone(),
                    ms,
                })
            }
        };

        let code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(Value::String(format!(
            "exit={}\nSTDOUT:{}\nSTDERR:{}",
            code, stdout, stderr
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planscript_core::policy::Policy;
    use serde_json::json;

    fn allowing(commands: &[&str]) -> Policy {
        let mut policy = Policy::default();
        policy.allow_commands = commands.iter().map(|c| c.to_string()).collect();
        policy
    }

    fn run_cmd_action(args: Value) -> PlanAction {
        PlanAction::parse("RUN_CMD", &args).expect("valid args")
    }

    #[test]
    fn test_allowed_command_returns_exit_and_streams() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().expect("tempdir");
            let ctx = ToolCtx::new(dir.path(), allowing(&["echo"]));
            let out = RunCmdTool
                .run(&ctx, &run_cmd_action(json!({"cmd": "echo", "args": ["hi"]})))
                .await
                .expect("run");
            let text = out.as_str().expect("string output");
            assert!(text.starts_with("exit=0\nSTDOUT:hi\n"));
            assert!(text.contains("STDERR:"));
        });
    }

    #[test]
    fn test_disallowed_command_is_policy_violation() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().expect("tempdir");
            let ctx = ToolCtx::new(dir.path(), allowing(&["echo"]));
            let err = RunCmdTool
                .run(&ctx, &run_cmd_action(json!({"cmd": "rm", "args": ["-rf", "x"]})))
                .await
                .expect_err("must reject");
            assert!(err.to_string().starts_with("PolicyViolation:"));
        });
    }

    #[test]
    fn test_missing_command_has_specific_kind() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().expect("tempdir");
            let ctx = ToolCtx::new(dir.path(), allowing(&["definitely-not-a-binary"]));
            let err = RunCmdTool
                .run(&ctx, &run_cmd_action(json!({"cmd": "definitely-not-a-binary"})))
                .await
                .expect_err("must fail");
            assert!(matches!(err, ToolError::MissingCommand(_)));
        });
    }

    #[test]
    fn test_timeout_kills_the_process() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().expect("tempdir");
            let ctx = ToolCtx::new(dir.path(), allowing(&["sleep"]));
            let err = RunCmdTool
                .run(
                    &ctx,
                    &run_cmd_action(json!({"cmd": "sleep", "args": ["5"], "timeoutMs": 50})),
                )
                .await
                .expect_err("must time out");
            assert!(err.to_string().starts_with("Timeout:"));
        });
    }

    #[test]
    fn test_nonzero_exit_is_reported_not_an_error() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().expect("tempdir");
            let ctx = ToolCtx::new(dir.path(), allowing(&["false"]));
            let out = RunCmdTool
                .run(&ctx, &run_cmd_action(json!({"cmd": "false"})))
                .await
                .expect("run completes");
            assert!(out.as_str().expect("string").starts_with("exit=1\n"));
        });
    }
}
