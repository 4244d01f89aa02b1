//! Parameter and result codecs shared by the category dispatchers.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use attestor_plugins::error::PluginError;

pub(crate) fn decode_params<P: DeserializeOwned>(
    method: &str,
    params: Value,
) -> Result<P, PluginError> {
    serde_json::from_value(params).map_err(|err| PluginError::Codec {
        message: format!("invalid parameters for {method}"),
        source: Some(err),
    })
}

pub(crate) fn encode_result<R: Serialize>(method: &str, result: &R) -> Result<Value, PluginError> {
    serde_json::to_value(result).map_err(|err| PluginError::Codec {
        message: format!("failed to serialise result of {method}"),
        source: Some(err),
    })
}
