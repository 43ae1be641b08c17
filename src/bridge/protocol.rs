//! Wire protocol types for bridge communication.
//!
//! ## Module Structure
//!
//! - `request_id` - RequestId type for correlating requests with replies
//! - `message` - Outbound request/batch builders and inbound frame parsing

mod message;
mod request_id;

pub(crate) use message::{Inbound, Reply, build_batch, build_request, parse_frame};
pub use request_id::RequestId;
