pub mod cache;
pub mod cli;
pub mod clients;
pub mod detect;
pub mod extract;
pub mod ingest;
pub mod llm;
pub mod matcher;
pub mod npi;
pub mod reader;
pub mod resolve;
pub mod schema;
pub mod search;
pub mod server;
pub mod storage;
pub mod store;
pub mod validate;
