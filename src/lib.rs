pub mod channel;
pub mod config;
pub mod consts;
pub mod engine;
pub mod events;
pub mod feed;
pub mod guard;
pub mod parser;
pub mod render;
pub mod store;
pub mod vote;
