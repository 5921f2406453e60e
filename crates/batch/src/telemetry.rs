//! Chain telemetry for dashboards.

use std::sync::{Arc, Mutex};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use policybatch_core::BrokerError;

pub const LAUNCH_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainStatus {
    Success,
    Failed,
}

/// One telemetry row written at generation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainReport {
    pub chain_name: String,
    pub queue: String,
    pub nb_jobs: i64,
    pub nb_records: i64,
    pub first_launch_date: String,
    pub duration_in_sec: u64,
    pub status: ChainStatus,
}

impl ChainReport {
    /// Generation selected nothing.
    pub fn empty(chain_name: &str, queue: &str, started: NaiveDateTime) -> Self {
        Self::synthetic(chain_name, queue, 0, started, ChainStatus::Success)
    }

    /// Generation crashed.
    pub fn failed(chain_name: &str, queue: &str, started: NaiveDateTime) -> Self {
        Self::synthetic(chain_name, queue, -1, started, ChainStatus::Failed)
    }

    fn synthetic(
        chain_name: &str,
        queue: &str,
        nb_jobs: i64,
        started: NaiveDateTime,
        status: ChainStatus,
    ) -> Self {
        Self {
            chain_name: chain_name.to_string(),
            queue: queue.to_string(),
            nb_jobs,
            nb_records: 0,
            first_launch_date: started.format(LAUNCH_DATE_FORMAT).to_string(),
            duration_in_sec: 0,
            status,
        }
    }

    /// Storage key suffix: chain, queue and launch date concatenated.
    pub fn key_suffix(&self) -> String {
        format!("{}{}{}", self.chain_name, self.queue, self.first_launch_date)
    }
}

/// Side channel receiving [`ChainReport`]s.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, report: &ChainReport) -> Result<(), BrokerError>;
}

impl<T> TelemetrySink for Arc<T>
where
    T: TelemetrySink + ?Sized,
{
    fn record(&self, report: &ChainReport) -> Result<(), BrokerError> {
        (**self).record(report)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTelemetry {
    reports: Mutex<Vec<ChainReport>>,
}

impl InMemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ChainReport> {
        self.reports.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl TelemetrySink for InMemoryTelemetry {
    fn record(&self, report: &ChainReport) -> Result<(), BrokerError> {
        self.reports
            .lock()
            .map_err(|_| BrokerError::Connection("telemetry lock poisoned".to_string()))?
            .push(report.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    #[test]
    fn failed_report_layout() {
        let started = NaiveDate::from_ymd_opt(2024, 5, 2)
            .unwrap()
            .and_hms_opt(6, 30, 0)
            .unwrap();
        let report = ChainReport::failed("nightly", "contract.renew", started);

        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({
                "chain_name": "nightly",
                "queue": "contract.renew",
                "nb_jobs": -1,
                "nb_records": 0,
                "first_launch_date": "2024-05-02T06:30:00",
                "duration_in_sec": 0,
                "status": "failed",
            })
        );
        assert_eq!(report.key_suffix(), "nightlycontract.renew2024-05-02T06:30:00");
    }
}
