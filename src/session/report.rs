//! Status reports. Only fields whose value changed since the last
//! successful send go on the wire; the state is always included.

use serde_json::{json, Map, Value};

use super::state::SessionState;
use crate::Driver;

/// Collect a full report. `download_percent` replaces the job percent while
/// a download is running.
pub async fn collect(driver: Option<&dyn Driver>, state: SessionState, download_percent: Option<f64>) -> Map<String, Value> {
    let mut report = Map::new();
    report.insert("state".to_owned(), json!(state));

    let Some(driver) = driver else {
        return report;
    };

    let percent = match download_percent {
        Some(percent) => percent,
        None => driver.get_percent().await,
    };
    let temperatures = driver.get_temperatures().await;

    report.insert("percent".to_owned(), json!(percent));
    report.insert("temps".to_owned(), json!(temperatures.actual));
    report.insert("target_temps".to_owned(), json!(temperatures.target));
    report.insert("coords".to_owned(), json!(driver.get_position().await));
    report.insert("line_number".to_owned(), json!(driver.get_line_number().await));
    report.insert("job_id".to_owned(), json!(driver.get_job_id().await));
    report.insert("material_names".to_owned(), json!(driver.get_materials().await));

    for (key, value) in driver.extension_fields().await {
        report.entry(key).or_insert(value);
    }
    report
}

/// Percent of a collected report, 0 when absent.
pub fn percent_of(report: &Map<String, Value>) -> f64 {
    report.get("percent").and_then(Value::as_f64).unwrap_or(0.0)
}

/// Remembers what was last sent.
#[derive(Clone, Debug, Default)]
pub struct ReportDiffer {
    last_sent: Map<String, Value>,
}

impl ReportDiffer {
    /// Fields of `full` that differ from the last sent values, plus the
    /// state.
    pub fn diff(&self, full: &Map<String, Value>) -> Map<String, Value> {
        full.iter()
            .filter(|(key, value)| key.as_str() == "state" || self.last_sent.get(key.as_str()) != Some(value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Record `sent` as delivered.
    pub fn commit(&mut self, sent: &Map<String, Value>) {
        for (key, value) in sent {
            self.last_sent.insert(key.clone(), value.clone());
        }
    }

    /// Forget what was sent; the next report is complete.
    pub fn reset(&mut self) {
        self.last_sent.clear();
    }
}
