pub mod address;
pub mod config;
pub mod decision;
pub mod milter;
pub mod policy;
pub mod session;

pub use address::{parse_recipient, ParsedAddress, Recipient};
pub use config::Config;
pub use decision::{DecisionEngine, DecisionResult, Verdict};
pub use milter::Milter;
pub use policy::{PolicyEngine, PolicyStore};
pub use session::Session;
