pub mod handler;
pub mod registry;
pub mod stage;

pub use handler::{StageHandler, UiaOutcome};
pub use registry::StageSet;
pub use stage::{
    AuthResponse, STAGE_CRM, STAGE_DUMMY, STAGE_PASSWORD, STAGE_SSO, STAGE_WELCOME_MESSAGE, Stage,
    TYPE_LOGIN_TOKEN,
};
