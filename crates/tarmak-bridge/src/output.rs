use std::io::IsTerminal;

use clap::ValueEnum;
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ReplyOutput<'a> {
    procedure: &'a str,
    reply: &'a Value,
}

/// Print the reply to one procedure call.
pub fn print_reply(procedure: &str, reply: &Value, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ReplyOutput { procedure, reply };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Pretty => {
            println!("{procedure}");
            for (key, value) in fields(reply) {
                println!("  {key}: {value}");
            }
        }
    }
}

/// Top-level fields of a reply, strings unquoted.
fn fields(reply: &Value) -> Vec<(String, String)> {
    match reply {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| {
                let shown = match value {
                    Value::String(text) if text.is_empty() => "<empty>".to_string(),
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                (key.clone(), shown)
            })
            .collect(),
        other => vec![("value".to_string(), other.to_string())],
    }
}
