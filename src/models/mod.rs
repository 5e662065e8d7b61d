pub mod common;
pub mod notification;
pub mod receipt;
pub mod subscription;
