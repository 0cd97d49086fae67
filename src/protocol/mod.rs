//! Protocol message definitions

pub mod notification;

pub use notification::{MAX_STATUS_LEN, StatusReport, state_payload};
