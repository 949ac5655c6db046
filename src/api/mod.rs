pub mod handlers;
pub mod openapi;
pub mod responses;
pub mod routes;

pub use handlers::{ApiError, AppState};
pub use openapi::ApiDoc;
pub use responses::*;
pub use routes::create_router;
