//! Domain types shared across the scheduler

mod priority;
mod status;

pub use priority::Priority;
pub use status::{RequestStatus, StatusRecord};
