pub mod models;
pub mod registry;

pub use models::{validate_persona_name, PersonaRecord, GROUP_WILDCARD, PRIMARY_PERSONA};
pub use registry::{NameMatch, PersonaRegistry};
