//! 村务新闻模块

pub mod models;
pub mod service;

pub use models::{NewsItem, NewsRecord};
pub use service::NewsBoard;
