//! The minimal wire contract for the chat-service gateway and REST API
//! (spec §1, §6): enough of the shape of the upstream JSON protocol for the
//! ingestion engine to dispatch on, without attempting to model the entire
//! surface of a production chat platform's API.

pub mod gateway;
pub mod model;
pub mod rest;

pub use gateway::{DispatchEvent, GatewayOpcode, GatewayPayload};
pub use rest::{Bucket, Route};
