pub mod accounts;
pub mod approval;
pub mod catalog;
pub mod config;
pub mod conversation;
pub mod error;
pub mod http;
pub mod ledger;
pub mod notify;
pub mod reconciler;
pub mod registry;
pub mod settings;
pub mod store;
pub mod types;
