use std::process::Stdio;
use std::time::Instant;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// What a successful run reports back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Execution {
    pub runtime_ms: i64,
    pub iter: Option<i64>,
    pub fopt: Option<f64>,
    pub result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunOutput {
    iter: Option<i64>,
    fopt: Option<f64>,
    result: Option<Value>,
}

/// Reads the last non-empty stdout line. A JSON object there supplies
/// `iter`/`fopt`/`result`; anything else becomes the raw result.
pub fn parse_output(stdout: &str) -> (Option<i64>, Option<f64>, Option<String>) {
    let Some(line) = stdout.lines().rev().map(str::trim).find(|l| !l.is_empty()) else {
        return (None, None, None);
    };
    match serde_json::from_str::<RunOutput>(line) {
        Ok(out) => {
            let result = out.result.map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            });
            (out.iter, out.fopt, result)
        }
        Err(_) => (None, None, Some(line.to_string())),
    }
}

/// Last `max` chars of `s`, trimmed.
fn tail(s: &str, max: usize) -> &str {
    let s = s.trim();
    match s.char_indices().rev().nth(max.saturating_sub(1)) {
        Some((i, _)) => &s[i..],
        None => s,
    }
}

/// Runs `command` under `sh -c` with the payload JSON on stdin.
///
/// A spawn error or a non-zero exit is returned as `Err` with a message fit
/// for the task's error field.
pub async fn run_payload(command: &str, payload: &Value) -> Result<Execution, String> {
    let started = Instant::now();
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("spawning `{command}`: {e}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        let input = payload.to_string();
        // the command may exit without reading its input
        let _ = stdin.write_all(input.as_bytes()).await;
        drop(stdin);
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("waiting for `{command}`: {e}"))?;
    let runtime_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "`{command}` exited with {}: {}",
            output.status,
            tail(&stderr, 500)
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let (iter, fopt, result) = parse_output(&stdout);
    Ok(Execution {
        runtime_ms,
        iter,
        fopt,
        result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_line_fills_fields() {
        let (iter, fopt, result) =
            parse_output("warming up\n{\"iter\": 40, \"fopt\": 0.25, \"result\": [1, 2]}\n\n");
        assert_eq!(iter, Some(40));
        assert_eq!(fopt, Some(0.25));
        assert_eq!(result.as_deref(), Some("[1,2]"));
    }

    #[test]
    fn plain_text_becomes_result() {
        assert_eq!(parse_output("done\n"), (None, None, Some("done".to_string())));
        assert_eq!(parse_output(""), (None, None, None));
    }

    #[tokio::test]
    async fn payload_is_piped_to_the_command() {
        let out = run_payload("cat", &json!({"result": "echoed"})).await.unwrap();
        assert_eq!(out.result.as_deref(), Some("echoed"));
        assert!(out.runtime_ms >= 0);
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let err = run_payload("echo nope >&2; exit 3", &json!(null))
            .await
            .unwrap_err();
        assert!(err.contains("nope"));
    }
}
