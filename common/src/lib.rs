//! Types shared by the camera node and the tools that drive it.

pub mod config;
pub mod protocol;
