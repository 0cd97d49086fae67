//! Core business logic module

pub mod connector;
pub mod credentials;
pub mod error;
pub mod event;
pub mod framing;
pub mod gate;
pub mod reassembly;
pub mod service;
pub mod session;
pub mod state;
pub mod timer;
pub mod types;
