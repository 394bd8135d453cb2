//! Builds the argv tail appended to a runtime's launch command, and the
//! POSIX single-quote escaping that makes it safe to interpolate into a
//! `shell -c "..."` string. Every `TaskArgument` value ultimately comes
//! from caller-supplied JSON (the `POST /execute` body or query string),
//! so nothing here may be handed to a shell unescaped.

use lotse_types::TaskArgument;

/// Mirrors `k8s_manager_service.py`'s argument convention: a `--flag`-named
/// argument becomes `--flag <value>`, anything else is passed positionally
/// as just `<value>`.
pub fn format_command_args(arguments: &[TaskArgument]) -> String {
    let mut tokens = Vec::with_capacity(arguments.len() * 2);
    for arg in arguments {
        if arg.name.starts_with("--") {
            tokens.push(quote(&arg.name));
        }
        tokens.push(quote(&value_to_string(&arg.value)));
    }
    tokens.join(" ")
}

/// Renders a JSON value the way Python's `str()` would render the native
/// object that value was parsed into, since that's the convention the
/// original argument-formatting code depends on.
fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Bool(b) => if *b { "True" } else { "False" }.to_owned(),
        serde_json::Value::Null => "None".to_owned(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// POSIX single-quote escaping: wrap in `'...'`, replacing any embedded
/// `'` with `'\''`. Safe against every shell metacharacter because nothing
/// inside single quotes is interpreted except another single quote.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'\''"#))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_and_positional_args() {
        let args = vec![
            TaskArgument { name: "--count".to_owned(), value: serde_json::json!(3) },
            TaskArgument { name: "input.txt".to_owned(), value: serde_json::json!("input.txt") },
        ];
        assert_eq!(format_command_args(&args), "'--count' '3' 'input.txt'");
    }

    #[test]
    fn quoting_neutralizes_injection() {
        let args = vec![TaskArgument {
            name: "--name".to_owned(),
            value: serde_json::json!("a'; rm -rf / #"),
        }];
        assert_eq!(format_command_args(&args), r#"'--name' 'a'\''; rm -rf / #'"#);
    }

    #[test]
    fn bool_and_null_render_pythonically() {
        let args = vec![
            TaskArgument { name: "--flag".to_owned(), value: serde_json::json!(true) },
            TaskArgument { name: "--opt".to_owned(), value: serde_json::Value::Null },
        ];
        assert_eq!(format_command_args(&args), "'--flag' 'True' '--opt' 'None'");
    }
}
