pub mod evidence;
pub mod monitor;
pub mod report;
pub mod seed;
pub mod supervisor;

pub use evidence::EvidenceFiles;
pub use monitor::{CycleOutcome, CycleReport, HealthAction, Monitor, MonitorConfig, Phase};
pub use supervisor::{ScriptSupervisor, Supervisor};
