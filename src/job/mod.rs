mod payload;
mod record;
mod status;

pub use payload::{JobPayload, RESERVED_NAMES, parse_link};
pub use record::{JobRecord, JobSnapshot};
pub use status::{JobStatus, Transition};
