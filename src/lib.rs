pub mod api;
pub mod broadcast;
pub mod codec;
pub mod config;
pub mod decision;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod tailer;
