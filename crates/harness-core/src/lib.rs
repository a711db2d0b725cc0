pub mod client;
pub mod config;
pub mod credentials;
pub mod ramp;
pub mod reference;
pub mod scenarios;
pub mod stats;
pub mod user;

pub use client::*;
pub use config::*;
pub use credentials::*;
pub use ramp::*;
pub use reference::*;
pub use stats::*;
pub use user::*;
