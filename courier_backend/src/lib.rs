pub mod config;
pub mod database;
pub mod dispatcher;
pub mod history;
pub mod identity;
pub mod ingest;
pub mod ledger;
pub mod listener;
pub mod llm_client;
pub mod queue;
pub mod recipient;
pub mod runtime;
pub mod send_log;
pub mod supervisor;
pub mod template;
pub mod transport;
