use time::format_description::well_known::Iso8601;

/// Source of the timestamps stamped on rows by this pipeline.
pub trait TimeSource {
    // Return an ISO timestamp
    fn current_time(&self) -> String;
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn current_time(&self) -> String {
        let time = time::OffsetDateTime::now_utc();

        time.format(&Iso8601::DEFAULT)
            .unwrap_or_else(|_| time.unix_timestamp().to_string())
    }
}

/// Always returns the same timestamp.
#[derive(Clone)]
pub struct FixedTime {
    pub time: String,
}

impl TimeSource for FixedTime {
    fn current_time(&self) -> String {
        self.time.clone()
    }
}
