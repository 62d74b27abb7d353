pub mod config;
pub mod context;
pub mod dedup;
pub mod election;
pub mod errors;
pub mod http;
pub mod membership_client;
pub mod multicast;
pub mod protos;
pub mod recovery;
pub mod storage;
pub mod tree;
