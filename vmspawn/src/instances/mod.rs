//! Instance table: identities, parentage, lifecycle state and exit codes.

mod table;

pub use table::{AllocateError, InstanceRecord, InstanceTable};
