//! IPC bridge for controller-supervisor communication.
//!
//! This module provides the wire protocol, codec and transport shared by the
//! supervisor's server and the controller's client.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Request/Response, Event)
//! - **codec**: Newline-delimited JSON codec for AsyncRead/AsyncWrite
//! - **transport**: Per-user local socket addressed by channel name

pub mod codec;
pub mod protocol;
pub mod transport;
