//! Per-recipient-domain send caps, sender warm-up and quiet hours.
//!
//! Every send attempt asks [`DomainThrottle::check`] first. An allowed check
//! consumes one slot in the hourly and daily window of the recipient's domain
//! class and one slot of the global warm-up budget, all under a single lock,
//! so concurrent senders cannot overshoot a cap.

use crate::configuration::{QuietHoursSettings, ThrottleSettings, WarmupSettings};
use chrono::{DateTime, Duration, DurationRound, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// Bucket for every domain that is not listed in a configured class.
pub const OTHER_CLASS: &str = "other";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    QuietHours,
    HourlyLimit(String),
    DailyLimit(String),
    Warmup,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::QuietHours => write!(f, "quiet hours"),
            DenyReason::HourlyLimit(class) => write!(f, "hourly limit for {}", class),
            DenyReason::DailyLimit(class) => write!(f, "daily limit for {}", class),
            DenyReason::Warmup => write!(f, "warm-up cap"),
        }
    }
}

/// A refused send and how long until the same check could pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denied {
    pub reason: DenyReason,
    pub retry_after: Duration,
}

#[derive(Debug, Clone)]
struct ClassLimits {
    hourly: Option<u32>,
    daily: Option<u32>,
}

#[derive(Debug, Default, Clone)]
struct Window {
    start: Option<DateTime<Utc>>,
    count: u32,
}

impl Window {
    fn count_at(&self, start: DateTime<Utc>) -> u32 {
        match self.start {
            Some(current) if current == start => self.count,
            _ => 0,
        }
    }

    fn bump(&mut self, start: DateTime<Utc>) {
        self.count = self.count_at(start) + 1;
        self.start = Some(start);
    }
}

#[derive(Debug, Default)]
struct Counters {
    hourly: HashMap<String, Window>,
    daily: HashMap<String, Window>,
    warmup: Window,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassUsage {
    pub class: String,
    pub sent_this_hour: u32,
    pub hourly_limit: Option<u32>,
    pub sent_today: u32,
    pub daily_limit: Option<u32>,
}

#[derive(Debug)]
pub struct DomainThrottle {
    domain_to_class: HashMap<String, String>,
    limits: HashMap<String, ClassLimits>,
    warmup: Option<Warmup>,
    quiet_hours: Option<QuietHours>,
    counters: Mutex<Counters>,
}

impl DomainThrottle {
    /// `now` anchors the warm-up ramp when no explicit start is configured.
    pub fn new(settings: &ThrottleSettings, now: DateTime<Utc>) -> Result<Self, String> {
        let mut domain_to_class = HashMap::new();
        let mut limits = HashMap::new();
        for class in &settings.domain_classes {
            for domain in &class.domains {
                domain_to_class.insert(domain.to_lowercase(), class.name.clone());
            }
            limits.insert(
                class.name.clone(),
                ClassLimits {
                    hourly: Some(class.hourly_limit),
                    daily: Some(class.daily_limit),
                },
            );
        }
        limits.insert(
            OTHER_CLASS.to_string(),
            ClassLimits {
                hourly: settings.default_hourly_limit,
                daily: settings.default_daily_limit,
            },
        );
        let warmup = match settings.warmup.enabled {
            true => Some(Warmup::new(&settings.warmup, now)),
            false => None,
        };
        let quiet_hours = match settings.quiet_hours.enabled {
            true => Some(QuietHours::new(&settings.quiet_hours)?),
            false => None,
        };
        Ok(Self {
            domain_to_class,
            limits,
            warmup,
            quiet_hours,
            counters: Mutex::new(Counters::default()),
        })
    }

    pub fn class_of(&self, domain: &str) -> &str {
        self.domain_to_class
            .get(&domain.to_lowercase())
            .map(String::as_str)
            .unwrap_or(OTHER_CLASS)
    }

    /// Reserves a send to `domain` at `now`, or says how long to wait.
    pub fn check(&self, domain: &str, now: DateTime<Utc>) -> Result<(), Denied> {
        if let Some(quiet_hours) = &self.quiet_hours {
            if let Some(retry_after) = quiet_hours.remaining(now) {
                return Err(Denied {
                    reason: DenyReason::QuietHours,
                    retry_after,
                });
            }
        }

        let class = self.class_of(domain).to_string();
        let limits = self.limits.get(&class).cloned().unwrap_or(ClassLimits {
            hourly: None,
            daily: None,
        });
        let hour_start = truncate(now, Duration::hours(1));
        let day_start = truncate(now, Duration::days(1));

        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let sent_this_hour = counters
            .hourly
            .get(&class)
            .map_or(0, |w| w.count_at(hour_start));
        if limits.hourly.map_or(false, |limit| sent_this_hour >= limit) {
            return Err(Denied {
                reason: DenyReason::HourlyLimit(class),
                retry_after: hour_start + Duration::hours(1) - now,
            });
        }
        let sent_today = counters
            .daily
            .get(&class)
            .map_or(0, |w| w.count_at(day_start));
        if limits.daily.map_or(false, |limit| sent_today >= limit) {
            return Err(Denied {
                reason: DenyReason::DailyLimit(class),
                retry_after: day_start + Duration::days(1) - now,
            });
        }
        let warmup_period = match &self.warmup {
            Some(warmup) => {
                let (period_start, cap) = warmup.period(now);
                if counters.warmup.count_at(period_start) >= cap {
                    return Err(Denied {
                        reason: DenyReason::Warmup,
                        retry_after: period_start + warmup.period - now,
                    });
                }
                Some(period_start)
            }
            None => None,
        };

        counters.hourly.entry(class.clone()).or_default().bump(hour_start);
        counters.daily.entry(class).or_default().bump(day_start);
        if let Some(period_start) = warmup_period {
            counters.warmup.bump(period_start);
        }
        Ok(())
    }

    /// The global cap currently in force, if warm-up is enabled.
    pub fn warmup_cap(&self, now: DateTime<Utc>) -> Option<u32> {
        self.warmup.as_ref().map(|w| w.period(now).1)
    }

    pub fn usage(&self, now: DateTime<Utc>) -> Vec<ClassUsage> {
        let hour_start = truncate(now, Duration::hours(1));
        let day_start = truncate(now, Duration::days(1));
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let mut usage: Vec<ClassUsage> = self
            .limits
            .iter()
            .map(|(class, limits)| ClassUsage {
                class: class.clone(),
                sent_this_hour: counters.hourly.get(class).map_or(0, |w| w.count_at(hour_start)),
                hourly_limit: limits.hourly,
                sent_today: counters.daily.get(class).map_or(0, |w| w.count_at(day_start)),
                daily_limit: limits.daily,
            })
            .collect();
        usage.sort_by(|a, b| a.class.cmp(&b.class));
        usage
    }
}

fn truncate(now: DateTime<Utc>, to: Duration) -> DateTime<Utc> {
    now.duration_trunc(to).unwrap_or(now)
}

/// Linear ramp: `initial + increment * periods elapsed`, capped at `max`.
#[derive(Debug)]
struct Warmup {
    started_at: DateTime<Utc>,
    period: Duration,
    initial: u32,
    increment: u32,
    max: u32,
}

impl Warmup {
    fn new(settings: &WarmupSettings, now: DateTime<Utc>) -> Self {
        Self {
            started_at: settings.started_at.unwrap_or(now),
            period: Duration::hours(settings.period_hours.max(1)),
            initial: settings.initial,
            increment: settings.increment,
            max: settings.max,
        }
    }

    /// Start of the period containing `now` and its cap.
    fn period(&self, now: DateTime<Utc>) -> (DateTime<Utc>, u32) {
        let elapsed = (now - self.started_at).num_seconds().max(0);
        let periods = elapsed / self.period.num_seconds();
        let start = self.started_at + Duration::seconds(periods * self.period.num_seconds());
        let ramp = u64::from(self.initial) + u64::from(self.increment) * periods as u64;
        let cap = ramp.min(u64::from(self.max)) as u32;
        (start, cap)
    }
}

#[derive(Debug)]
struct QuietHours {
    start_hour: u32,
    end_hour: u32,
    timezone: Tz,
}

impl QuietHours {
    fn new(settings: &QuietHoursSettings) -> Result<Self, String> {
        let timezone = settings
            .timezone
            .parse::<Tz>()
            .map_err(|e| format!("Invalid quiet hours timezone: {}", e))?;
        Ok(Self {
            start_hour: settings.start_hour,
            end_hour: settings.end_hour,
            timezone,
        })
    }

    fn contains(&self, hour: u32) -> bool {
        if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else if self.start_hour > self.end_hour {
            // wraps midnight
            hour >= self.start_hour || hour < self.end_hour
        } else {
            false
        }
    }

    /// Time left until the window closes, if `now` falls inside it.
    fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let local = now.with_timezone(&self.timezone);
        if !self.contains(local.hour()) {
            return None;
        }
        let mut end_date = local.date_naive();
        if local.hour() >= self.end_hour {
            end_date = end_date.succ_opt()?;
        }
        let end = end_date
            .and_hms_opt(self.end_hour, 0, 0)
            .and_then(|naive| self.timezone.from_local_datetime(&naive).earliest())
            .map(|end| end.with_timezone(&Utc))
            // the end hour fell into a DST gap
            .unwrap_or_else(|| now + Duration::hours(1));
        Some(end - now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::DomainClassSettings;
    use claim::{assert_err, assert_ok};
    use quickcheck_macros::quickcheck;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap()
    }

    fn settings(hourly: u32, daily: u32) -> ThrottleSettings {
        ThrottleSettings {
            domain_classes: vec![DomainClassSettings {
                name: "gmail".into(),
                domains: vec!["gmail.com".into(), "googlemail.com".into()],
                daily_limit: daily,
                hourly_limit: hourly,
            }],
            ..ThrottleSettings::default()
        }
    }

    #[test]
    fn unknown_domains_fall_into_the_unlimited_other_class() {
        let throttle = DomainThrottle::new(&settings(1, 1), base()).unwrap();
        assert_eq!(throttle.class_of("GoogleMail.com"), "gmail");
        assert_eq!(throttle.class_of("example.org"), OTHER_CLASS);
        for _ in 0..100 {
            assert_ok!(throttle.check("example.org", base()));
        }
    }

    #[test]
    fn hourly_cap_resets_on_the_next_hour() {
        let throttle = DomainThrottle::new(&settings(2, 100), base()).unwrap();
        let now = base() + Duration::minutes(10);
        assert_ok!(throttle.check("gmail.com", now));
        assert_ok!(throttle.check("googlemail.com", now));
        let denied = throttle.check("gmail.com", now).unwrap_err();
        assert_eq!(denied.reason, DenyReason::HourlyLimit("gmail".into()));
        assert_eq!(denied.retry_after, Duration::minutes(50));
        assert_ok!(throttle.check("gmail.com", base() + Duration::hours(1)));
    }

    #[test]
    fn daily_cap_applies_across_hours() {
        let throttle = DomainThrottle::new(&settings(10, 2), base()).unwrap();
        assert_ok!(throttle.check("gmail.com", base()));
        assert_ok!(throttle.check("gmail.com", base() + Duration::hours(1)));
        let denied = throttle.check("gmail.com", base() + Duration::hours(2)).unwrap_err();
        assert_eq!(denied.reason, DenyReason::DailyLimit("gmail".into()));
    }

    #[test]
    fn warmup_ramps_the_global_cap() {
        let mut settings = settings(1_000, 1_000);
        settings.warmup = WarmupSettings {
            enabled: true,
            initial: 2,
            increment: 3,
            max: 6,
            period_hours: 24,
            started_at: Some(base()),
        };
        let throttle = DomainThrottle::new(&settings, base()).unwrap();

        assert_ok!(throttle.check("gmail.com", base()));
        assert_ok!(throttle.check("example.org", base()));
        assert_eq!(throttle.check("example.org", base()).unwrap_err().reason, DenyReason::Warmup);

        assert_eq!(throttle.warmup_cap(base() + Duration::days(1)), Some(5));
        assert_eq!(throttle.warmup_cap(base() + Duration::days(30)), Some(6));
    }

    #[test]
    fn quiet_hours_deny_until_the_window_ends() {
        let mut settings = settings(100, 100);
        settings.quiet_hours = QuietHoursSettings {
            enabled: true,
            start_hour: 22,
            end_hour: 8,
            timezone: "Europe/Berlin".into(),
        };
        let throttle = DomainThrottle::new(&settings, base()).unwrap();

        // 21:30 UTC is 22:30 in Berlin in March (CET)
        let late = Utc.with_ymd_and_hms(2024, 3, 4, 21, 30, 0).unwrap();
        let denied = throttle.check("gmail.com", late).unwrap_err();
        assert_eq!(denied.reason, DenyReason::QuietHours);
        assert_eq!(denied.retry_after, Duration::minutes(9 * 60 + 30));

        assert_ok!(throttle.check("gmail.com", Utc.with_ymd_and_hms(2024, 3, 5, 7, 0, 0).unwrap()));
    }

    #[test]
    fn invalid_timezone_is_rejected() {
        let mut settings = ThrottleSettings::default();
        settings.quiet_hours.enabled = true;
        settings.quiet_hours.timezone = "Nowhere/Land".into();
        assert_err!(DomainThrottle::new(&settings, base()));
    }

    #[quickcheck]
    fn never_more_than_the_hourly_limit_in_one_hour(limit: u8, offsets: Vec<u16>) -> bool {
        let limit = u32::from(limit % 20) + 1;
        let throttle = DomainThrottle::new(&settings(limit, u32::MAX), base()).unwrap();
        let mut offsets: Vec<i64> = offsets.into_iter().map(|o| i64::from(o % 7200)).collect();
        offsets.sort_unstable();

        let mut sent_per_hour: HashMap<i64, u32> = HashMap::new();
        for offset in offsets {
            let now = base() + Duration::seconds(offset);
            if throttle.check("gmail.com", now).is_ok() {
                *sent_per_hour.entry(offset / 3600).or_default() += 1;
            }
        }
        sent_per_hour.values().all(|sent| *sent <= limit)
    }

    #[quickcheck]
    fn nothing_is_allowed_inside_quiet_hours(minutes: Vec<u16>) -> bool {
        let mut settings = ThrottleSettings::default();
        settings.quiet_hours.enabled = true;
        let throttle = DomainThrottle::new(&settings, base()).unwrap();
        minutes.into_iter().all(|m| {
            let now = base() + Duration::minutes(i64::from(m % 2880));
            let hour = now.hour();
            let inside = hour >= 22 || hour < 8;
            !(inside && throttle.check("example.org", now).is_ok())
        })
    }
}
