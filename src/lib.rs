pub mod bus;
pub mod device;
pub mod mqtt;
pub mod persistence;
pub mod registry;
pub mod session;
