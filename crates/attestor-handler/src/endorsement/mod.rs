//! The endorsement-provisioning capability category.
//!
//! Endorsement handlers decode scheme-specific provisioning payloads
//! (typically CoRIMs) into the trust anchors and reference values the
//! host stores for later appraisal. The payload stays an opaque byte
//! string here; decoding it is the plugin's business.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use attestor_plugins::channel::{RpcChannel, ServiceDispatcher};
use attestor_plugins::connection::RpcClient;
use attestor_plugins::contract::{
    METHOD_GET_ATTESTATION_SCHEME, METHOD_GET_NAME, METHOD_GET_SUPPORTED_MEDIA_TYPES,
    METHOD_GET_VERSION, MediaTypeMap, Pluggable, dispatch_base,
};
use attestor_plugins::error::PluginError;

use crate::wire::{decode_params, encode_result};

/// Protocol name of the endorsement-provisioning category.
pub const ENDORSEMENT_SERVICE: &str = "endorsement-handler";

const METHOD_DECODE: &str = "decode";

/// What role a decoded endorsement plays during appraisal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndorsementKind {
    /// A golden measurement evidence is compared against.
    ReferenceValue,
    /// Key material evidence signatures are verified with.
    TrustAnchor,
}

/// One decoded endorsement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endorsement {
    /// Attestation scheme the endorsement belongs to.
    pub scheme: String,
    /// Role of this endorsement.
    pub kind: EndorsementKind,
    /// Scheme-specific subtype discriminator.
    pub sub_type: String,
    /// Scheme-specific attributes as opaque JSON.
    pub attributes: Value,
}

/// Everything decoded from one provisioning payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EndorsementBundle {
    /// Decoded reference values.
    pub reference_values: Vec<Endorsement>,
    /// Decoded trust anchors.
    pub trust_anchors: Vec<Endorsement>,
    /// Metadata about the payload's signer, when the payload was signed.
    pub signer_info: BTreeMap<String, String>,
}

/// Scheme-specific endorsement decoding, implemented by plugins.
pub trait EndorsementHandler: Pluggable {
    /// Decodes one provisioning payload of the given media type.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload cannot be decoded as this
    /// scheme's provisioning format.
    fn decode(&self, media_type: &str, data: &[u8]) -> Result<EndorsementBundle, PluginError>;
}

#[derive(Serialize, Deserialize)]
struct DecodeParams {
    media_type: String,
    data: Vec<u8>,
}

/// Host-side stub speaking the endorsement protocol over RPC.
#[derive(Debug, Clone)]
struct EndorsementClient {
    client: RpcClient,
}

impl Pluggable for EndorsementClient {
    fn name(&self) -> String {
        self.client.call_or_default(METHOD_GET_NAME)
    }

    fn attestation_scheme(&self) -> String {
        self.client.call_or_default(METHOD_GET_ATTESTATION_SCHEME)
    }

    fn supported_media_types(&self) -> MediaTypeMap {
        self.client.call_or_default(METHOD_GET_SUPPORTED_MEDIA_TYPES)
    }

    fn version(&self) -> String {
        self.client.call_or_default(METHOD_GET_VERSION)
    }
}

impl EndorsementHandler for EndorsementClient {
    fn decode(&self, media_type: &str, data: &[u8]) -> Result<EndorsementBundle, PluginError> {
        let params = DecodeParams {
            media_type: media_type.to_owned(),
            data: data.to_vec(),
        };
        self.client.call(METHOD_DECODE, &params)
    }
}

/// Plugin-side dispatcher routing wire methods to a local handler.
struct EndorsementDispatcher {
    inner: Arc<dyn EndorsementHandler>,
}

impl ServiceDispatcher for EndorsementDispatcher {
    fn dispatch(&self, method: &str, params: Value) -> Result<Value, String> {
        if let Some(result) = dispatch_base(self.inner.as_ref(), method) {
            return Ok(result);
        }
        if method == METHOD_DECODE {
            let decoded = decode_params::<DecodeParams>(method, params)
                .and_then(|args| self.inner.decode(&args.media_type, &args.data))
                .and_then(|bundle| encode_result(method, &bundle));
            return decoded.map_err(|err| err.to_string());
        }
        Err(format!("unknown method {method:?}"))
    }
}

/// Channel binding the endorsement category for loaders and plugin
/// servers.
#[must_use]
pub fn endorsement_channel() -> RpcChannel<Arc<dyn EndorsementHandler>> {
    fn wrap_client(client: RpcClient) -> Arc<dyn EndorsementHandler> {
        Arc::new(EndorsementClient { client })
    }
    fn wrap_server(inner: Arc<dyn EndorsementHandler>) -> Box<dyn ServiceDispatcher> {
        Box::new(EndorsementDispatcher { inner })
    }
    RpcChannel::new(wrap_client, wrap_server)
}
