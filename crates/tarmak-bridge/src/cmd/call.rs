use serde_json::Value;
use tarmak_rpc::catalog::{qualify, PROCEDURES};
use tarmak_rpc::RpcClient;

use crate::cmd::CallArgs;
use crate::exit::{rpc_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_reply, OutputFormat};

pub async fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let procedure = qualify(&args.procedure);
    if !PROCEDURES.contains(&procedure.as_str()) {
        return Err(CliError::new(
            USAGE,
            format!(
                "unknown procedure {procedure} (known: {})",
                PROCEDURES.join(", ")
            ),
        ));
    }
    let params = parse_params(args.json.as_deref())?;

    let client = RpcClient::with_retry(&args.socket, args.retry.policy()?);
    client
        .handshake()
        .await
        .map_err(|err| rpc_error("handshake failed", err))?;
    let reply = client
        .call_raw(&procedure, params)
        .await
        .map_err(|err| rpc_error("call failed", err))?;

    print_reply(&procedure, &reply, format);
    Ok(SUCCESS)
}

fn parse_params(json: Option<&str>) -> CliResult<Value> {
    let Some(json) = json else {
        return Ok(Value::Object(Default::default()));
    };
    match serde_json::from_str(json) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(CliError::new(USAGE, "--json must be a JSON object")),
        Err(err) => Err(CliError::new(
            USAGE,
            format!("--json is not valid JSON: {err}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn params_default_to_empty_object() {
        assert_eq!(parse_params(None).unwrap(), json!({}));
    }

    #[test]
    fn params_must_be_an_object() {
        assert_eq!(
            parse_params(Some(r#"{"hostname":"1.2.3.4"}"#)).unwrap(),
            json!({"hostname": "1.2.3.4"})
        );
        assert_eq!(parse_params(Some("[1]")).unwrap_err().code, USAGE);
        assert_eq!(parse_params(Some("{")).unwrap_err().code, USAGE);
    }
}
