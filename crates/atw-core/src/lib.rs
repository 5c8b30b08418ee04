pub mod id;
pub mod ports;
pub mod thread_contracts;
