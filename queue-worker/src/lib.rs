pub mod config;
pub mod error;
pub mod webhook;
pub mod worker;
