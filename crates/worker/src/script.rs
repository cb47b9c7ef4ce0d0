use browserpool_common::{is_browser_gone_error, TaskError};
use chromiumoxide::error::CdpError;
use serde_json::{json, Value};

/// In-page helper surface available to task scripts as `modules`.
///
/// URL utilities plus a request blocker that patches `fetch` and
/// `XMLHttpRequest` to refuse matching URLs.
const MODULES_PRELUDE: &str = r#"
    const context = window;
    const modules = {
        URL: {
            parse: (input, base) => new URL(input, base),
            resolve: (from, to) => new URL(to, from).href
        },
        blockRequests: (patterns) => {
            const blocked = (url) => patterns.some((p) => String(url).includes(p));
            const originalFetch = window.fetch;
            window.fetch = function (input, init) {
                const url = (typeof input === 'string') ? input : input.url;
                if (blocked(url)) {
                    return Promise.reject(new TypeError('Request blocked: ' + url));
                }
                return originalFetch.apply(this, arguments);
            };
            const originalOpen = XMLHttpRequest.prototype.open;
            XMLHttpRequest.prototype.open = function (method, url) {
                if (blocked(url)) {
                    throw new TypeError('Request blocked: ' + url);
                }
                return originalOpen.apply(this, arguments);
            };
        }
    };
"#;

/// Wrap user script text into a promise the driver can await.
///
/// The script runs inside the executor with `resolve`/`reject` in scope, so
/// it may settle explicitly with a value; falling off the end settles with
/// an empty object, throwing rejects.
pub fn wrap_script(script: &str) -> String {
    format!(
        "new Promise(async (resolve, reject) => {{\n{MODULES_PRELUDE}\n    try {{\n{script}\n        resolve({{}});\n    }} catch (e) {{\n        reject(e);\n    }}\n}})"
    )
}

/// Parse-only pre-flight check of the wrapped script.
///
/// Runs host-side in an embedded engine; the script is never executed here.
/// A failure short-circuits to SCRIPT_SYNTAX_ERROR without consuming a
/// session slot.
pub fn check_syntax(script: &str) -> Result<(), TaskError> {
    let wrapped = wrap_script(script);
    let mut context = boa_engine::Context::default();
    let source = boa_engine::Source::from_bytes(wrapped.as_bytes());

    boa_engine::Script::parse(source, None, &mut context)
        .map(|_| ())
        .map_err(|e| TaskError::ScriptSyntax(e.to_string()))
}

/// Non-object results are wrapped so the payload is always object-shaped.
/// Arrays and `null` count as object-shaped, same as `typeof` in the page
/// runtime, and pass through untouched.
pub fn coerce_result(value: Value) -> Value {
    match value {
        Value::Object(_) | Value::Array(_) | Value::Null => value,
        other => json!({ "response": other }),
    }
}

/// Classify a driver error from script evaluation into the task error
/// taxonomy. Returns the error plus a stack trace when the page runtime
/// provided one.
pub fn classify_cdp_error(error: &CdpError) -> (TaskError, Option<String>) {
    match error {
        CdpError::JavascriptException(details) => {
            let message = details
                .exception
                .as_ref()
                .and_then(|obj| obj.description.clone())
                .unwrap_or_else(|| details.text.clone());

            let stack = details.stack_trace.as_ref().map(|trace| {
                trace
                    .call_frames
                    .iter()
                    .map(|frame| {
                        format!(
                            "    at {} ({}:{}:{})",
                            frame.function_name, frame.url, frame.line_number, frame.column_number
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            });

            (TaskError::ScriptRuntime(message), stack)
        }
        other => {
            let message = other.to_string();
            let retryable = is_browser_gone_error(&message);
            (
                TaskError::Infrastructure { message, retryable },
                None,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_script_passes_preflight() {
        check_syntax("const a = 1 + 2;").unwrap();
        check_syntax("await context.fetch; resolve({ok: true});").unwrap();
        check_syntax("modules.blockRequests(['.png']);").unwrap();
    }

    #[test]
    fn broken_script_fails_preflight() {
        let err = check_syntax("const a = ;").unwrap_err();
        assert_eq!(err.kind(), "SCRIPT_SYNTAX_ERROR");

        let err = check_syntax("function {").unwrap_err();
        assert_eq!(err.kind(), "SCRIPT_SYNTAX_ERROR");
    }

    #[test]
    fn wrapped_script_exposes_resolve_and_modules() {
        let wrapped = wrap_script("resolve(42);");
        assert!(wrapped.starts_with("new Promise(async (resolve, reject)"));
        assert!(wrapped.contains("const modules"));
        assert!(wrapped.contains("resolve(42);"));
        // Implicit completion settles with an empty object.
        assert!(wrapped.contains("resolve({});"));
    }

    #[test]
    fn non_object_results_are_wrapped() {
        assert_eq!(coerce_result(json!(42)), json!({ "response": 42 }));
        assert_eq!(coerce_result(json!("hi")), json!({ "response": "hi" }));
        assert_eq!(coerce_result(json!(true)), json!({ "response": true }));
        assert_eq!(coerce_result(json!([1, 2])), json!([1, 2]));
        assert_eq!(coerce_result(json!({ "a": 1 })), json!({ "a": 1 }));
        assert_eq!(coerce_result(Value::Null), Value::Null);
    }

    #[test]
    fn infrastructure_errors_split_on_browser_gone() {
        let (err, stack) = classify_cdp_error(&CdpError::NotFound);
        assert_eq!(err.kind(), "INFRASTRUCTURE_ERROR");
        assert!(!err.is_retryable());
        assert!(stack.is_none());
    }
}
