pub mod config;
pub mod coordinator;
pub mod entity;
pub mod error;
pub mod fetch;
pub mod gtfs_static;
pub mod infra;
pub mod loader;
pub mod mapper;
pub mod model;
pub mod output;
pub mod parser;
pub mod poi;
pub mod registry;
pub mod report;
pub mod retry;
pub mod services;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
