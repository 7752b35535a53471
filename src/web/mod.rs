pub mod handlers;
pub mod routes;

pub use handlers::{AdminState, ApiError};
pub use routes::create_router;
