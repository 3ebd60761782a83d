pub mod cache;
pub mod descriptor;
pub mod driver;
pub mod history;
pub mod module;
pub mod modules;
pub mod observability;
pub mod program;
pub mod validation;

pub use descriptor::{Descriptor, StepSpec};
pub use driver::{ExecutionDriver, RunReport, StepOutcome};
pub use history::HistoryStore;
pub use module::{Module, ModuleRegistry};
pub use program::Program;
