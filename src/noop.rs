//! `noop` implements a simulated printer: it accepts every command, and
//! pretends to print each job for a fixed amount of time.

use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{Driver, JobPayload, Temperatures};

const ROOM: f64 = 21.0;
const HOTEND: f64 = 210.0;
const BED: f64 = 60.0;

#[derive(Default)]
struct Job {
    id: Option<String>,
    filename: Option<String>,
    started: Option<Instant>,
    paused_at: Option<Instant>,
    paused_for: Duration,
}

impl Job {
    fn elapsed(&self) -> Duration {
        let Some(started) = self.started else {
            return Duration::ZERO;
        };
        let until = self.paused_at.unwrap_or_else(Instant::now);
        until.saturating_duration_since(started).saturating_sub(self.paused_for)
    }
}

/// Simulated printer. Always operational; the bed is always clear.
pub struct Noop {
    job_time: Duration,
    job: Mutex<Job>,
    closed: Mutex<bool>,
}

impl Noop {
    /// A simulated printer whose jobs take `job_time`.
    pub fn new(job_time: Duration) -> Self {
        Self {
            job_time,
            job: Mutex::new(Job::default()),
            closed: Mutex::new(false),
        }
    }

    fn percent(&self, job: &Job) -> f64 {
        if job.started.is_none() {
            return 0.0;
        }
        let total = self.job_time.as_secs_f64().max(f64::EPSILON);
        (job.elapsed().as_secs_f64() / total * 100.0).min(100.0)
    }

    fn printing(&self, job: &Job) -> bool {
        job.started.is_some() && job.elapsed() < self.job_time
    }
}

#[async_trait]
impl Driver for Noop {
    async fn is_operational(&self) -> bool {
        !*self.closed.lock()
    }

    async fn is_printing(&self) -> bool {
        self.printing(&self.job.lock())
    }

    async fn is_paused(&self) -> bool {
        let job = self.job.lock();
        self.printing(&job) && job.paused_at.is_some()
    }

    async fn get_percent(&self) -> f64 {
        self.percent(&self.job.lock())
    }

    async fn get_temperatures(&self) -> Temperatures {
        let heating = self.printing(&self.job.lock());
        let (actual, target) = if heating {
            (vec![BED, HOTEND], vec![BED, HOTEND])
        } else {
            (vec![ROOM, ROOM], vec![0.0, 0.0])
        };
        Temperatures { actual, target }
    }

    async fn get_position(&self) -> Option<Vec<f64>> {
        Some(vec![0.0, 0.0, 0.0])
    }

    async fn get_job_id(&self) -> Option<String> {
        let job = self.job.lock();
        job.id.clone().or_else(|| job.filename.clone())
    }

    async fn pause(&mut self) -> Result<()> {
        let mut job = self.job.lock();
        if !self.printing(&job) || job.paused_at.is_some() {
            bail!("nothing to pause");
        }
        job.paused_at = Some(Instant::now());
        Ok(())
    }

    async fn unpause(&mut self) -> Result<()> {
        let mut job = self.job.lock();
        let Some(paused_at) = job.paused_at.take() else {
            bail!("job is not paused");
        };
        job.paused_for += paused_at.elapsed();
        Ok(())
    }

    async fn cancel(&mut self) -> Result<()> {
        let mut job = self.job.lock();
        if !self.printing(&job) {
            bail!("nothing to cancel");
        }
        tracing::info!(job_id = ?job.id, "simulated job cancelled");
        *job = Job::default();
        Ok(())
    }

    async fn load_job(&mut self, payload: JobPayload) -> Result<()> {
        if self.printing(&self.job.lock()) {
            bail!("printer already printing");
        }
        let size = payload.size().await?;
        let mut job = self.job.lock();
        let filename = job.filename.take();
        *job = Job {
            id: Some(uuid::Uuid::new_v4().to_string()),
            filename,
            started: Some(Instant::now()),
            ..Job::default()
        };
        tracing::info!(job_id = ?job.id, size, "simulated job started");
        Ok(())
    }

    async fn send_unbuffered(&mut self, text: &str) -> Result<()> {
        tracing::info!(lines = text.lines().count(), "simulated commands sent");
        Ok(())
    }

    async fn set_filename(&mut self, name: &str) {
        self.job.lock().filename = Some(name.to_owned());
    }

    async fn close(&mut self) {
        *self.closed.lock() = true;
    }
}
