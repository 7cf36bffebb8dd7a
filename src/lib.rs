//! Mirrors one UPS served by a NUT `upsd` daemon into a hierarchical state
//! store and reduces its status to a single alerting severity.

pub mod adapter;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod mailer;
pub mod mapper;
pub mod session;
pub mod status;
pub mod store;
pub mod ups;

#[cfg(test)]
mod testing;
