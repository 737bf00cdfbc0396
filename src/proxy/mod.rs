pub mod gateway;
pub mod handler;
pub mod session;
pub mod stream;
pub mod upstream;
