pub mod context;
mod handler;

pub use context::{BoxBody, BoxError};
pub use handler::handle_request;
