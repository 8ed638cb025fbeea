pub mod engine;
pub mod handshake;
pub mod message;
