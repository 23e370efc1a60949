//! Clock and resource probe backed by the host system.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::{Components, System};

use crate::caps::{Clock, ResourceProbe, ResourceSnapshot};

/// Wall-clock plus process-relative monotonic time.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// sysinfo-backed resource probe. Refreshes on every snapshot; callers poll
/// it only before heavy operations, so the refresh cost is acceptable.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn snapshot(&self) -> ResourceSnapshot {
        let mut system = self.system.lock().expect("probe poisoned");
        system.refresh_memory();
        system.refresh_cpu_usage();

        let components = Components::new_with_refreshed_list();
        let thermal = components
            .iter()
            .filter_map(|c| c.temperature())
            .fold(None::<f32>, |acc, t| Some(acc.map_or(t, |a| a.max(t))));

        ResourceSnapshot {
            available_memory_bytes: system.available_memory(),
            cpu_percent: system.global_cpu_usage(),
            thermal_celsius: thermal,
        }
    }
}
