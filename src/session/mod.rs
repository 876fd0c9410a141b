//! Device sessions and their supervisor.

pub mod device;
pub mod supervisor;

pub use device::{DeviceSession, SessionContext, SessionOptions, SessionStats};
pub use supervisor::SessionSupervisor;
