//! Concrete capability categories for attestation scheme plugins.
//!
//! The core framework in `attestor-plugins` is category-agnostic; this
//! crate defines the two categories scheme plugins actually implement.
//! The evidence category parses, validates, and appraises attestation
//! tokens; the endorsement category decodes provisioning payloads into
//! trust anchors and reference values. For each category there is the
//! trait, an RPC client stub, a server-side dispatcher, and a channel
//! constructor for registration with a loader or a plugin server.
//!
//! Scheme-specific internals stay behind opaque JSON and byte payloads;
//! this crate only fixes the shapes crossing the process boundary.

pub mod endorsement;
pub mod evidence;
mod wire;

pub use endorsement::{
    ENDORSEMENT_SERVICE, Endorsement, EndorsementBundle, EndorsementHandler, EndorsementKind,
    endorsement_channel,
};
pub use evidence::{
    AppraisalResult, EVIDENCE_SERVICE, EvidenceContext, EvidenceHandler, EvidenceToken, TrustTier,
    evidence_channel,
};
