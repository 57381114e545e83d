pub mod client;

pub use client::OrionLdClient;
