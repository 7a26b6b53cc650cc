//! Exchange-calendar-aware trading-hours checks.
//!
//! Equities trade during NYSE regular hours (09:30-16:00 America/New_York) on
//! non-holiday sessions; crypto symbols trade around the clock. The holiday
//! schedule and early-close sessions (13:00 ET) are computed in-code from the
//! published NYSE rules, including Good Friday via the Gregorian computus.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::America::New_York;
use chrono_tz::Tz;
use tracing::debug;

use crate::domain::entities::symbol::WatchSymbol;

fn rth_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 30, 0).expect("valid time")
}

fn rth_close() -> NaiveTime {
    NaiveTime::from_hms_opt(16, 0, 0).expect("valid time")
}

fn early_close_time() -> NaiveTime {
    NaiveTime::from_hms_opt(13, 0, 0).expect("valid time")
}

fn pre_market_open() -> NaiveTime {
    NaiveTime::from_hms_opt(4, 0, 0).expect("valid time")
}

fn after_hours_close() -> NaiveTime {
    NaiveTime::from_hms_opt(20, 0, 0).expect("valid time")
}

/// Check whether a symbol is tradable at a given instant.
#[derive(Debug, Clone)]
pub struct MarketCalendar {
    allow_pre_market: bool,
    allow_after_hours: bool,
}

impl MarketCalendar {
    pub fn new(allow_pre_market: bool, allow_after_hours: bool) -> Self {
        Self {
            allow_pre_market,
            allow_after_hours,
        }
    }

    /// Whether new entries may be placed for this symbol right now.
    pub fn is_tradable_now(&self, symbol: &WatchSymbol, now: DateTime<Utc>) -> bool {
        if symbol.is_crypto() {
            return true;
        }

        let eastern = now.with_timezone(&New_York);
        let date = eastern.date_naive();
        if !is_trading_day(date) {
            debug!(symbol = %symbol, date = %date, "market closed, not a trading day");
            return false;
        }

        let open = if self.allow_pre_market {
            pre_market_open()
        } else {
            rth_open()
        };
        let close = if self.allow_after_hours {
            after_hours_close()
        } else {
            session_close_time(date)
        };

        let t = eastern.time();
        t >= open && t <= close
    }

    /// Next regular-session close at or after `now`. `None` for crypto,
    /// which has no session boundary. Extended-hours flags do not move the
    /// close; the end-of-day cancel sweep keys off the regular session.
    pub fn next_close(&self, symbol: &WatchSymbol, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if symbol.is_crypto() {
            return None;
        }

        let eastern = now.with_timezone(&New_York);
        let start = eastern.date_naive();
        for offset in 0..10 {
            let date = start + Duration::days(offset);
            if !is_trading_day(date) {
                continue;
            }
            let close = at_eastern(date, session_close_time(date))?;
            if close > now {
                return Some(close);
            }
        }
        None
    }

    /// Whole minutes until the next session close, rounded up so that the
    /// value first equals N exactly N minutes before the bell.
    pub fn minutes_until_close(&self, symbol: &WatchSymbol, now: DateTime<Utc>) -> Option<i64> {
        let close = self.next_close(symbol, now)?;
        let seconds = (close - now).num_seconds();
        Some((seconds + 59) / 60)
    }

    /// Session date (exchange timezone) for snapshot bookkeeping.
    pub fn session_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&New_York).date_naive()
    }
}

/// Resolve a local Eastern wall time to UTC. The session boundaries never
/// land inside a DST transition, so `earliest` is exact.
fn at_eastern(date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    use chrono::TimeZone;
    let tz: Tz = New_York;
    tz.from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

fn is_trading_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !is_holiday(date)
}

fn session_close_time(date: NaiveDate) -> NaiveTime {
    if is_early_close(date) {
        early_close_time()
    } else {
        rth_close()
    }
}

/// NYSE full-closure holidays, observed dates.
fn is_holiday(date: NaiveDate) -> bool {
    let year = date.year();
    if holidays_for_year(year).contains(&date) {
        return true;
    }
    // New Year's Day of the following year observed on Dec 31.
    NaiveDate::from_ymd_opt(year + 1, 1, 1)
        .map(|new_year| observed(new_year) == date)
        .unwrap_or(false)
}

fn holidays_for_year(year: i32) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(10);
    if let Some(d) = NaiveDate::from_ymd_opt(year, 1, 1) {
        days.push(observed(d));
    }
    days.push(nth_weekday(year, 1, Weekday::Mon, 3)); // Martin Luther King Jr. Day
    days.push(nth_weekday(year, 2, Weekday::Mon, 3)); // Washington's Birthday
    days.push(easter_sunday(year) - Duration::days(2)); // Good Friday
    days.push(last_weekday(year, 5, Weekday::Mon)); // Memorial Day
    if let Some(d) = NaiveDate::from_ymd_opt(year, 6, 19) {
        days.push(observed(d)); // Juneteenth
    }
    if let Some(d) = NaiveDate::from_ymd_opt(year, 7, 4) {
        days.push(observed(d)); // Independence Day
    }
    days.push(nth_weekday(year, 9, Weekday::Mon, 1)); // Labor Day
    days.push(nth_weekday(year, 11, Weekday::Thu, 4)); // Thanksgiving
    if let Some(d) = NaiveDate::from_ymd_opt(year, 12, 25) {
        days.push(observed(d)); // Christmas
    }
    days
}

/// Weekend holidays shift: Saturday observes Friday, Sunday observes Monday.
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

/// 13:00 ET close: day after Thanksgiving, and July 3 / December 24 when the
/// eve falls Monday through Thursday (a Friday eve is either a full session
/// or an observed holiday).
fn is_early_close(date: NaiveDate) -> bool {
    let year = date.year();
    if date == nth_weekday(year, 11, Weekday::Thu, 4) + Duration::days(1) {
        return true;
    }
    let eve_of = |month: u32, day: u32| {
        NaiveDate::from_ymd_opt(year, month, day)
            .map(|d| {
                date == d
                    && matches!(
                        d.weekday(),
                        Weekday::Mon | Weekday::Tue | Weekday::Wed | Weekday::Thu
                    )
            })
            .unwrap_or(false)
    };
    eve_of(7, 3) || eve_of(12, 24)
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u32) -> NaiveDate {
    let mut date = NaiveDate::from_ymd_opt(year, month, 1)
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(year, 1, 1).expect("valid date"));
    let mut count = 0;
    loop {
        if date.weekday() == weekday {
            count += 1;
            if count == n {
                return date;
            }
        }
        date += Duration::days(1);
    }
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> NaiveDate {
    let next_month = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    let mut date = next_month.expect("valid date") - Duration::days(1);
    while date.weekday() != weekday {
        date -= Duration::days(1);
    }
    date
}

/// Anonymous Gregorian computus.
fn easter_sunday(year: i32) -> NaiveDate {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = ((h + l - 7 * m + 114) % 31) + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32).expect("computus yields a valid date")
}
