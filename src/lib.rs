//! Sync core of a canteen ordering client: a local store of menus and
//! layered order actions, a reconciliation engine for user edits, portal
//! plugins run as dependency-ordered task sessions, and the classifier
//! that settles in-flight actions against the server-confirmed state.

pub mod classify;
pub mod config;
pub mod db;
pub mod model;
pub mod notify;
pub mod plugin;
pub mod present;
pub mod reconcile;
pub mod sync;
