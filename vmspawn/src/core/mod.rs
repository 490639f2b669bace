//! Core identity and state types shared by every table.

mod ids;
mod status;

pub use ids::{Endpoint, InstanceId};
pub use status::InstanceState;
