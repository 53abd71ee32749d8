pub mod blind;
pub mod import;
pub mod provenance;
pub mod session;
pub mod store;
pub mod trust;

pub use blind::{blind_packet, write_blind_packet, write_packet_snapshot, PacketSnapshot};
pub use import::{
    evaluate_import, import_review, parse_import_payload, ImportOutcome, ImportPayload,
    ProvenanceRoots,
};
pub use provenance::{assess_provenance, BatchProvenance, ProvenanceStatus, BLIND_PROVENANCE_KIND};
pub use session::{
    load_session, start_session, submit_command, submit_session, Session, SessionError, SessionOptions,
    SessionStatus, SubmitOutcome,
};
pub use store::{ApplyCounts, AssessmentStore, StoredAssessment};
pub use trust::{
    classify, AssessmentPolicy, ImportFlags, ImportMode, TrustMode, TrustViolation,
    ATTESTED_EXTERNAL_ATTEST_EXAMPLE,
};
