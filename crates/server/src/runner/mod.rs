//! Runner connections: wire protocol, session state machine and its driver

pub mod handler;
pub mod machine;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod status;
