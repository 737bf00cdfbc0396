pub mod invocation;
pub mod service;
