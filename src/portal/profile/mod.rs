//! 用户资料与新用户引导

pub mod models;
pub mod service;

pub use models::Profile;
pub use service::ProfileService;
