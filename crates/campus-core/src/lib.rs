// Core of the campus live-sync client: wire protocol, the competition state
// machine, the push channel, and session state.

pub mod competition;
pub mod config;
pub mod connection;
pub mod db;
pub mod protocol;
pub mod session;
