pub mod notification_listener;
pub mod transport;
