pub mod health_handlers;
pub mod store_handlers;
pub mod upload_handlers;
