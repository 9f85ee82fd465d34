pub mod fs;
pub mod handlers;
pub mod middleware;
pub mod repair;
pub mod routes;
pub mod torrents;

pub use routes::create_router;
