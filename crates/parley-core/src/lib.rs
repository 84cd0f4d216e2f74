pub mod conversations;
pub mod error;
pub mod sessions;

pub use conversations::Conversations;
pub use error::ChatError;
pub use sessions::{AuthOutcome, RegisterOutcome, SessionManager};
