use alertledger::logging::init_tracing;
use alertledger::timestamps::now_naive;
use alertledger::{dispatch, AdapterError, AdapterRequest, AdapterResponse, LedgerConfig};
use serde_json::{json, Value};
use std::env;
use std::io::{self, Read};

fn parse_bool_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|arg| arg == flag)
}

fn read_stdin_json() -> Result<Value, AdapterError> {
    let mut raw = String::new();
    io::stdin()
        .read_to_string(&mut raw)
        .map_err(|e| AdapterError::Protocol(format!("读取 stdin 失败: {e}")))?;
    if raw.trim().is_empty() {
        return Err(AdapterError::Protocol("empty stdin request".to_string()));
    }
    serde_json::from_str::<Value>(&raw)
        .map_err(|e| AdapterError::Protocol(format!("invalid JSON request: {e}")))
}

fn run() -> Result<Value, AdapterError> {
    let config = LedgerConfig::from_env()?;
    init_tracing(&config.log_level, config.log_format);
    let req = serde_json::from_value::<AdapterRequest>(read_stdin_json()?)
        .map_err(|e| AdapterError::Protocol(format!("request root invalid: {e}")))?;
    if let Some(path) = req.endpoint.path.as_deref() {
        tracing::info!(endpoint = path, "adapter request");
    }
    dispatch(req, &config, now_naive())
}

fn main() {
    let args = env::args().skip(1).collect::<Vec<_>>();
    let pretty = parse_bool_flag(&args, "--pretty");

    let result = run();
    if let Err(err) = &result {
        tracing::error!(category = err.category(), error = %err, "adapter request failed");
    }
    let resp = AdapterResponse::from_result(result);

    let out = if pretty {
        serde_json::to_string_pretty(&resp)
    } else {
        serde_json::to_string(&resp)
    }
    .unwrap_or_else(|e| {
        json!({
            "status": "error",
            "error": {
                "category": "ADAPTER_PROTOCOL_ERROR",
                "message": format!("serialize response failed: {e}"),
                "type": "SerializeError",
            }
        })
        .to_string()
    });

    print!("{out}");
}
