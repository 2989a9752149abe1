pub mod artifacts;
pub mod checkpoint;
pub mod conductor_config;
pub mod errors;
pub mod gates;
pub mod healing;
pub mod memory;
pub mod orchestrator;
pub mod phase;
pub mod project;
pub mod remediation;
pub mod roles;
pub mod session;
pub mod supervisor;
pub mod util;
