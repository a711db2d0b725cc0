//! Task sets for each [`UserClass`](crate::user::UserClass).
//!
//! Task bodies build one request (or a short sequence) and fire it. Status
//! codes are left to the stats collector; only transport errors are returned.

pub mod creator;
pub mod donor;
pub mod public;
