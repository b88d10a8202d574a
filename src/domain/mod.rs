//! Entities, state machines and the ports the core talks through.

pub mod attempt;
pub mod events;
pub mod ledger;
pub mod ports;
pub mod processor;
pub mod webhook;
