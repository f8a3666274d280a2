pub mod admission;
pub mod decode;
pub mod events;
pub mod metrics;
pub mod orientation;
pub mod session;
pub mod settings;
pub mod sink;
pub mod stream;
