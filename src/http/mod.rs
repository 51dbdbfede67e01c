pub mod error;
pub mod forward;
pub mod handler;
pub mod request_id;
