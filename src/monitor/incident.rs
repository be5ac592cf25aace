//! Read side of the incident lifecycle.
//!
//! Incidents are opened and resolved inside [`Store::apply_check`]; this is
//! what callers use to look at them afterwards.

use chrono::Utc;
use std::sync::Arc;

use super::uptime::{calculate_uptime, UptimeReport};
use crate::db::{DbError, Incident, Store};

#[derive(Clone)]
pub struct IncidentManager {
    store: Arc<Store>,
}

impl IncidentManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// The unresolved incident, if the monitor is in an outage.
    pub fn current(&self, monitor_id: i64) -> Result<Option<Incident>, DbError> {
        self.store.get_open_incident(monitor_id)
    }

    /// Full incident history, newest first.
    pub fn history(&self, monitor_id: i64) -> Result<Vec<Incident>, DbError> {
        self.store.get_incidents(monitor_id)
    }

    /// Rolling uptime over the last `window_hours`.
    pub fn uptime(&self, monitor_id: i64, window_hours: u32) -> Result<UptimeReport, DbError> {
        calculate_uptime(&self.store, monitor_id, window_hours, Utc::now())
    }
}
