#[macro_use]
extern crate tracing;

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod digest;
pub mod drivers;
pub mod errors;
pub mod janitor;
pub mod manifest;
pub mod models;
pub mod peering;
pub mod replication;
pub mod runtime;
