//! Shared protocol definitions for the `PetChat` wire format.

pub mod codec;
pub mod message;
pub mod stomp;
