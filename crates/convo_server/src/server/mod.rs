#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod delivery;
pub mod directory;
pub mod health;
pub mod hub;
pub mod persist;
pub mod query;
pub mod session;
pub mod store;
pub mod tracker;

#[cfg(test)]
mod query_tests;
#[cfg(test)]
mod session_tests;
#[cfg(test)]
mod tracker_tests;
