mod handlers;
mod routes;
mod static_files;

pub use routes::create_router;
