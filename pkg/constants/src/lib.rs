//! Centralized constants for the k3rs service proxy.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod network;
pub mod paths;
pub mod proxy;
