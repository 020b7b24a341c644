//! The stock worker binary.
//!
//! Speaks the pool protocol on stdin/stdout and evaluates scripts with a
//! small built-in command language. Embeddings that need a real scripting
//! runtime ship their own binary around [`evalpool::run_worker`] and point
//! a pool's `exec` at it.

use evalpool::{parse_worker_args, run_worker, EvalOutput, Evaluator};

const LOG_TARGET: &str = "evalpool::worker";

/// The built-in command language: one verb and its arguments per script.
///
/// | Verb | Behavior |
/// |---|---|
/// | `sum <n>...` | Integer sum of the arguments |
/// | `echo <text>` | The text, verbatim |
/// | `sleep <ms>` | Sleeps, then returns an empty result |
/// | `pid` | The worker's process id |
/// | `fail <msg>` | Reports an evaluation failure with code `FAIL` |
struct CommandEvaluator;

impl Evaluator for CommandEvaluator {
    fn eval(&mut self, script: &str) -> EvalOutput {
        let trimmed = script.trim();
        let mut words = trimmed.split_whitespace();
        let verb = match words.next() {
            Some(v) => v,
            None => return EvalOutput::ok(""),
        };
        match verb {
            "sum" => {
                let mut total: i64 = 0;
                for word in words {
                    match word.parse::<i64>() {
                        Ok(n) => total += n,
                        Err(_) => {
                            return EvalOutput::error(
                                "BADARG",
                                format!("expected integer, got \"{word}\""),
                                format!("sum: not an integer: \"{word}\""),
                            )
                        }
                    }
                }
                EvalOutput::ok(total.to_string())
            }
            "echo" => {
                let rest = trimmed
                    .strip_prefix("echo")
                    .map(str::trim_start)
                    .unwrap_or("");
                EvalOutput::ok(rest)
            }
            "sleep" => match words.next().and_then(|w| w.parse::<u64>().ok()) {
                Some(ms) => {
                    std::thread::sleep(std::time::Duration::from_millis(ms));
                    EvalOutput::ok("")
                }
                None => EvalOutput::error(
                    "BADARG",
                    "sleep needs a millisecond count",
                    "sleep: missing or invalid duration",
                ),
            },
            "pid" => EvalOutput::ok(std::process::id().to_string()),
            "fail" => {
                let message = trimmed
                    .strip_prefix("fail")
                    .map(str::trim_start)
                    .filter(|m| !m.is_empty())
                    .unwrap_or("requested failure");
                EvalOutput::error("FAIL", format!("fail command: {message}"), message)
            }
            other => EvalOutput::error(
                "UNDEF",
                format!("\"{other}\" is not a built-in command"),
                format!("unknown command \"{other}\""),
            ),
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = match parse_worker_args(std::env::args()) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("evalpool-worker: {e}");
            std::process::exit(2);
        }
    };

    let mut evaluator = CommandEvaluator;
    if let Err(e) = run_worker(&args, &mut evaluator) {
        tracing::error!(target: LOG_TARGET, error = %e, "worker terminating");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(script: &str) -> EvalOutput {
        CommandEvaluator.eval(script)
    }

    #[test]
    fn test_sum() {
        assert_eq!(eval("sum 1 2").result, "3");
        assert_eq!(eval("sum").result, "0");
        assert_eq!(eval("sum -4 10 1").result, "7");
    }

    #[test]
    fn test_sum_rejects_non_integers() {
        let out = eval("sum 1 two");
        assert_eq!(out.error_code.as_deref(), Some("BADARG"));
        assert_ne!(out.code, 0);
    }

    #[test]
    fn test_echo_preserves_spacing() {
        assert_eq!(eval("echo hello  world").result, "hello  world");
        assert_eq!(eval("echo").result, "");
    }

    #[test]
    fn test_pid_is_own_process() {
        assert_eq!(eval("pid").result, std::process::id().to_string());
    }

    #[test]
    fn test_fail_reports_error() {
        let out = eval("fail boom");
        assert_ne!(out.code, 0);
        assert_eq!(out.error_code.as_deref(), Some("FAIL"));
        assert_eq!(out.result, "boom");
    }

    #[test]
    fn test_unknown_command() {
        let out = eval("frobnicate 1");
        assert_eq!(out.error_code.as_deref(), Some("UNDEF"));
        assert!(out.result.contains("frobnicate"));
    }
}
