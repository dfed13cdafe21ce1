//! Data model shared by the k3rs service proxy.

pub mod config;
pub mod endpoint;
pub mod names;
pub mod service;
