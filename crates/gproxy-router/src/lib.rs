pub mod admin;
pub mod proxy;

pub use admin::admin_router;
pub use proxy::proxy_router;
