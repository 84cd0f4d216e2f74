pub mod connection;
pub mod context;
pub mod framing;
pub mod listener;
pub mod registry;
pub mod router;

pub use context::Context;
pub use registry::{DevicePolicy, Registry};
pub use router::Router;
