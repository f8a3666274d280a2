pub mod http;
pub mod observer;
pub mod signaling;
pub mod stream;
