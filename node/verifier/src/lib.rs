pub mod checks;
pub mod verifier;

pub use checks::{compare_outcomes, verify_generation, CheckConfig, COMMON_FAILURE_MARKERS, DEFAULT_MARKERS};
pub use verifier::{VerifierConfig, VerifierNode, VerifyOutcome};
