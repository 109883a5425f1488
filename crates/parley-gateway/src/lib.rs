pub mod auth;
pub mod bus;
pub mod connection;
pub mod filter;
pub mod session;

#[cfg(test)]
pub(crate) mod fixtures;
