pub mod broker_api;
