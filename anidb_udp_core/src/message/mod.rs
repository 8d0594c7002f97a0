//! Request and response message handling
//!
//! This module covers both directions of the wire format: encoding request
//! parameter maps and parsing tagged responses.

mod params;
mod response;

pub use params::Params;
pub use response::Response;

pub(crate) use response::{parse_response, split_tag};
