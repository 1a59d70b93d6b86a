/// Telemetry events sent from file workers to the coordinator for progress tracking
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// A worker slot was granted and the file is being processed
    FileStarted,
    /// All rows of a file were appended to staging
    FileCompleted { rows_staged: u64 },
    /// The file failed; its slot is about to be released
    FileFailed,
}

/// Statistics aggregated from telemetry events
#[derive(Debug, Default, Clone)]
pub struct ProgressStats {
    pub files_completed: usize,
    pub files_failed: usize,
    pub rows_staged: u64,
    pub in_flight: usize,
    /// Highest number of files observed in flight at once
    pub peak_in_flight: usize,
}

impl ProgressStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a telemetry event
    pub fn update(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::FileStarted => {
                self.in_flight += 1;
                self.peak_in_flight = self.peak_in_flight.max(self.in_flight);
            }
            TelemetryEvent::FileCompleted { rows_staged } => {
                self.files_completed += 1;
                self.rows_staged += rows_staged;
                self.in_flight = self.in_flight.saturating_sub(1);
            }
            TelemetryEvent::FileFailed => {
                self.files_failed += 1;
                self.in_flight = self.in_flight.saturating_sub(1);
            }
        }
    }

    /// Files that have finished either way
    pub fn files_done(&self) -> usize {
        self.files_completed + self.files_failed
    }
}
