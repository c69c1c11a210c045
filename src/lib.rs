pub mod api;
pub mod chat_list;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod membership;
pub mod models;
pub mod realtime;
pub mod state;
pub mod thread;
pub mod typing;
