//! 照片墙模块

pub mod models;
pub mod service;

pub use models::{GalleryEdit, GalleryItem, GalleryRecord};
pub use service::Gallery;
