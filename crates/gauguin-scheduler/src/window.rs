use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use gauguin_config::DailyPollConfig;
use rand::Rng;

/// Daily publication window `[start_hour, end_hour)` in a fixed timezone.
#[derive(Debug, Clone, Copy)]
pub struct PollWindow {
    tz: Tz,
    start_hour: u32,
    end_hour: u32,
}

impl PollWindow {
    pub fn new(tz: Tz, start_hour: u32, end_hour: u32) -> Self {
        Self {
            tz,
            start_hour,
            end_hour,
        }
    }

    pub fn from_config(config: &DailyPollConfig) -> Result<Self> {
        Ok(Self::new(config.tz()?, config.start_hour, config.end_hour))
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.tz).date_naive()
    }

    /// Calendar date of a Telegram `date` field (unix seconds).
    pub fn date_of_unix(&self, unix_secs: i64) -> Option<NaiveDate> {
        DateTime::from_timestamp(unix_secs, 0).map(|instant| self.local_date(instant))
    }

    fn resolve_local(&self, naive: NaiveDateTime) -> Result<DateTime<Utc>> {
        // A wall-clock time inside a DST gap maps to the first instant after it.
        self.tz
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| {
                self.tz
                    .from_local_datetime(&(naive + Duration::hours(1)))
                    .earliest()
            })
            .map(|local| local.with_timezone(&Utc))
            .ok_or_else(|| anyhow!("Cannot resolve local time {} in {}", naive, self.tz))
    }

    pub fn bounds(&self, date: NaiveDate) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let start = date
            .and_hms_opt(self.start_hour, 0, 0)
            .ok_or_else(|| anyhow!("Invalid start hour '{}'", self.start_hour))?;
        let end = if self.end_hour >= 24 {
            date.succ_opt()
                .and_then(|next| next.and_hms_opt(0, 0, 0))
                .ok_or_else(|| anyhow!("Unable to compute day after {}", date))?
        } else {
            date.and_hms_opt(self.end_hour, 0, 0)
                .ok_or_else(|| anyhow!("Invalid end hour '{}'", self.end_hour))?
        };
        Ok((self.resolve_local(start)?, self.resolve_local(end)?))
    }

    pub fn end_of(&self, date: NaiveDate) -> Result<DateTime<Utc>> {
        Ok(self.bounds(date)?.1)
    }

    /// Uniformly random whole-second instant in the window of `date`.
    pub fn random_instant<R: Rng + ?Sized>(
        &self,
        date: NaiveDate,
        rng: &mut R,
    ) -> Result<DateTime<Utc>> {
        let (start, end) = self.bounds(date)?;
        let span = (end - start).num_seconds();
        if span <= 0 {
            return Ok(start);
        }
        Ok(start + Duration::seconds(rng.gen_range(0..span)))
    }
}
