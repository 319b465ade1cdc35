//! Built-in tool functions:
//! - Typology: French problem classification and reply templates
//! - Clock: current date and time
//! - Policy search: retrieval over the policy/FAQ corpus

pub mod clock;
pub mod policy_search;
pub mod typology;

pub use clock::CurrentTimeTool;
pub use policy_search::PolicySearchTool;
pub use typology::{
    classify, formulate, message_formulator_toolkit, Classification, ClassifyProblemTool,
    FormulateMessageTool, FormulatedMessage, ProblemTypology,
};
