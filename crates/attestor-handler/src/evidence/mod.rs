//! The evidence-handling capability category.
//!
//! Evidence handlers work with scheme-specific attestation tokens:
//! extracting claims, validating token integrity against trust anchors,
//! and appraising an evidence context into an attestation result. Claim
//! sets and endorsements cross the boundary as opaque JSON and strings;
//! their scheme-specific structure is the plugin's business.

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

/// Protocol name of the evidence-handling category.
pub const EVIDENCE_SERVICE: &str = "evidence-handler";

const METHOD_EXTRACT_CLAIMS: &str = "extract_claims";
const METHOD_VALIDATE_EVIDENCE_INTEGRITY: &str = "validate_evidence_integrity";
const METHOD_APPRAISE_EVIDENCE: &str = "appraise_evidence";

/// An attestation token as submitted by a challenger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceToken {
    /// Tenant the token was submitted under.
    pub tenant_id: i64,
    /// Media type the challenger declared for the token data.
    pub media_type: String,
    /// Raw token bytes.
    pub data: Vec<u8>,
}

/// Claims extracted from a token, with the identifiers of the stored
/// endorsements relevant to its appraisal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceContext {
    /// Tenant the evidence was submitted under.
    pub tenant_id: i64,
    /// Identifiers of the trust anchors matched to this evidence.
    pub trust_anchor_ids: Vec<String>,
    /// Identifiers of the reference values matched to this evidence.
    pub reference_ids: Vec<String>,
    /// The extracted claim set.
    pub evidence: Value,
}

/// Overall trustworthiness verdict of an appraisal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustTier {
    /// No verdict could be reached.
    #[default]
    None,
    /// The evidence is affirmed against its reference values.
    Affirming,
    /// The evidence raised non-fatal concerns.
    Warning,
    /// The evidence contradicts its reference values.
    Contraindicated,
}

/// The outcome of appraising one evidence context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppraisalResult {
    /// Overall verdict.
    pub status: TrustTier,
    /// The claim set the verdict was computed over.
    pub processed_evidence: Value,
}

/// Scheme-specific evidence handling, implemented by plugins.
pub trait EvidenceHandler: Pluggable {
    /// Parses the attestation token and returns the claims extracted
    /// from it.
    ///
    /// # Errors
    ///
    /// Returns an error when the token cannot be parsed as this scheme's
    /// evidence format.
    fn extract_claims(
        &self,
        token: &EvidenceToken,
        trust_anchors: &[String],
    ) -> Result<Value, PluginError>;

    /// Verifies the structural integrity and validity of the token,
    /// typically by checking its signature against the trust anchors.
    ///
    /// # Errors
    ///
    /// Returns an error describing what failed when the token is not
    /// valid.
    fn validate_evidence_integrity(
        &self,
        token: &EvidenceToken,
        trust_anchors: &[String],
        endorsements: &[String],
    ) -> Result<(), PluginError>;

    /// Evaluates the evidence context against the endorsements and
    /// returns an attestation result.
    ///
    /// # Errors
    ///
    /// Returns an error when appraisal cannot be carried out; a negative
    /// verdict is a successful appraisal, not an error.
    fn appraise_evidence(
        &self,
        context: &EvidenceContext,
        endorsements: &[String],
    ) -> Result<AppraisalResult, PluginError>;
}

#[derive(Serialize, Deserialize)]
struct ExtractClaimsParams {
    token: EvidenceToken,
    trust_anchors: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct ValidateParams {
    token: EvidenceToken,
    trust_anchors: Vec<String>,
    endorsements: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct AppraiseParams {
    context: EvidenceContext,
    endorsements: Vec<String>,
}

/// Host-side stub speaking the evidence protocol over RPC.
#[derive(Debug, Clone)]
struct EvidenceClient {
    client: RpcClient,
}

impl Pluggable for EvidenceClient {
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

impl EvidenceHandler for EvidenceClient {
    fn extract_claims(
        &self,
        token: &EvidenceToken,
        trust_anchors: &[String],
    ) -> Result<Value, PluginError> {
        let params = ExtractClaimsParams {
            token: token.clone(),
            trust_anchors: trust_anchors.to_vec(),
        };
        self.client.call(METHOD_EXTRACT_CLAIMS, &params)
    }

    fn validate_evidence_integrity(
        &self,
        token: &EvidenceToken,
        trust_anchors: &[String],
        endorsements: &[String],
    ) -> Result<(), PluginError> {
        let params = ValidateParams {
            token: token.clone(),
            trust_anchors: trust_anchors.to_vec(),
            endorsements: endorsements.to_vec(),
        };
        self.client
            .call::<_, Value>(METHOD_VALIDATE_EVIDENCE_INTEGRITY, &params)
            .map(|_| ())
    }

    fn appraise_evidence(
        &self,
        context: &EvidenceContext,
        endorsements: &[String],
    ) -> Result<AppraisalResult, PluginError> {
        let params = AppraiseParams {
            context: context.clone(),
            endorsements: endorsements.to_vec(),
        };
        self.client.call(METHOD_APPRAISE_EVIDENCE, &params)
    }
}

/// Plugin-side dispatcher routing wire methods to a local handler.
struct EvidenceDispatcher {
    inner: Arc<dyn EvidenceHandler>,
}

impl EvidenceDispatcher {
    fn dispatch_typed(&self, method: &str, params: Value) -> Result<Value, PluginError> {
        match method {
            METHOD_EXTRACT_CLAIMS => {
                let args: ExtractClaimsParams = decode_params(method, params)?;
                self.inner.extract_claims(&args.token, &args.trust_anchors)
            }
            METHOD_VALIDATE_EVIDENCE_INTEGRITY => {
                let args: ValidateParams = decode_params(method, params)?;
                self.inner
                    .validate_evidence_integrity(&args.token, &args.trust_anchors, &args.endorsements)
                    .map(|()| Value::Null)
            }
            METHOD_APPRAISE_EVIDENCE => {
                let args: AppraiseParams = decode_params(method, params)?;
                let result = self
                    .inner
                    .appraise_evidence(&args.context, &args.endorsements)?;
                encode_result(method, &result)
            }
            other => Err(PluginError::Config {
                message: format!("unknown method {other:?}"),
            }),
        }
    }
}

impl ServiceDispatcher for EvidenceDispatcher {
    fn dispatch(&self, method: &str, params: Value) -> Result<Value, String> {
        if let Some(result) = dispatch_base(self.inner.as_ref(), method) {
            return Ok(result);
        }
        self.dispatch_typed(method, params)
            .map_err(|err| err.to_string())
    }
}

/// Channel binding the evidence category for loaders and plugin servers.
#[must_use]
pub fn evidence_channel() -> RpcChannel<Arc<dyn EvidenceHandler>> {
    fn wrap_client(client: RpcClient) -> Arc<dyn EvidenceHandler> {
        Arc::new(EvidenceClient { client })
    }
    fn wrap_server(inner: Arc<dyn EvidenceHandler>) -> Box<dyn ServiceDispatcher> {
        Box::new(EvidenceDispatcher { inner })
    }
    RpcChannel::new(wrap_client, wrap_server)
}
