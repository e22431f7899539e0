//! MJD+BCD time decode, JST/UTC conversion, and TOT-anchored PCR interpolation.
//!
//! ARIB B10 encodes EIT/SDT/TOT timestamps as 16-bit Modified Julian Day plus 24-bit BCD
//! time-of-day, always in JST (UTC+9). Grounded on
//! `other_examples/467c20a5_toshipp-tstools__src-psi-eit.rs.rs`'s `parse_datetime`/
//! `parse_hms`/`jd_to_gregorian` (the Fliegel–Van Flandern algorithm) and
//! `original_source/LibISDB/EPG/EventInfo.hpp`'s `EPGTimeToUTCTime`/`UTCTimeToEPGTime`
//! free functions, which this module's [`to_utc`]/[`to_jst`] generalize.

use chrono::{DateTime, Duration, FixedOffset, TimeZone};

/// JST is a fixed UTC+9 offset; ARIB streams never carry DST.
pub fn jst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).expect("9h is a valid fixed offset")
}

/// PCR runs at 90 kHz; interpolation is bounded to this many ticks (spec section 6,
/// Scenario F: a 20s gap is out of bounds, a 5s gap is not).
const PCR_HZ: i64 = 90_000;
const MAX_INTERPOLATION_SECS: i64 = 15;

/// Decodes a 16-bit Modified Julian Day into a Gregorian `(year, month, day)`, via the
/// Fliegel–Van Flandern algorithm.
fn mjd_to_gregorian(mjd: u16) -> (i32, u32, u32) {
    let jd = mjd as u32 + 2_400_001; // +1 folds in the MJD/JD epoch and noon/midnight offset
    let (y, m, d) = jd_to_gregorian(jd);
    (y as i32, m, d)
}

fn jd_to_gregorian(jd: u32) -> (u32, u32, u32) {
    const Y: u32 = 4716;
    const J: u32 = 1401;
    const M: u32 = 2;
    const N: u32 = 12;
    const R: u32 = 4;
    const P: u32 = 1461;
    const V: u32 = 3;
    const U: u32 = 5;
    const S: u32 = 153;
    const W: u32 = 2;
    const B: u32 = 274_277;
    const C: u32 = 38;

    let f = jd + J + (4 * jd + B) / 146_097 * 3 / 4 - C;
    let e = R * f + V;
    let g = (e % P) / R;
    let h = U * g + W;
    let day = (h % S) / U + 1;
    let month = (h / S + M) % N + 1;
    let year = e / P - Y + (N + M - month) / N;
    (year, month, day)
}

/// Decodes a 24-bit BCD `h:m:s` value (as packed by [`crate::table`]'s `*_raw` fields) into
/// `(hour, minute, second)`. Returns `None` if any digit pair is not valid BCD (`0xFF`
/// sentinel bytes per the source's "unspecified" convention, or any invalid nibble).
fn bcd_hms(raw: u32) -> Option<(u32, u32, u32)> {
    let bytes = [(raw >> 16) as u8, (raw >> 8) as u8, raw as u8];
    let mut out = [0u32; 3];
    for (i, &b) in bytes.iter().enumerate() {
        let hi = b >> 4;
        let lo = b & 0x0F;
        if hi > 9 || lo > 9 {
            return None;
        }
        out[i] = hi as u32 * 10 + lo as u32;
    }
    Some((out[0], out[1], out[2]))
}

/// Decodes a `(mjd, bcd_hms)` pair — as stored in [`crate::table::EitEventEntry::start_time_raw`]
/// and [`crate::table::Tot::jst_time_raw`] — into a JST `DateTime`. Returns `None` if the
/// time-of-day portion is all-`0xFF` (ARIB's "time unspecified" sentinel) or not valid BCD.
pub fn decode_jst(raw: (u16, u32)) -> Option<DateTime<FixedOffset>> {
    let (mjd, bcd) = raw;
    let (h, m, s) = bcd_hms(bcd)?;
    let (year, month, day) = mjd_to_gregorian(mjd);
    jst()
        .with_ymd_and_hms(year, month, day, h, m, s)
        .single()
}

/// Decodes a 24-bit BCD duration (as in [`crate::table::EitEventEntry::duration_raw`]) into
/// a [`Duration`]. Returns `None` for the all-`0xFF` "unspecified duration" sentinel.
pub fn decode_duration(raw: u32) -> Option<Duration> {
    let (h, m, s) = bcd_hms(raw)?;
    Some(Duration::hours(h as i64) + Duration::minutes(m as i64) + Duration::seconds(s as i64))
}

/// Converts a JST `DateTime` to UTC (a fixed 9-hour subtraction, per
/// `EventInfo.hpp`'s `EPGTimeToUTCTime`).
pub fn to_utc(jst_time: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    jst_time.with_timezone(&FixedOffset::east_opt(0).expect("0 is a valid fixed offset"))
}

/// Converts a UTC `DateTime` to JST (a fixed 9-hour addition, per `UTCTimeToEPGTime`).
pub fn to_jst(utc_time: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    utc_time.with_timezone(&jst())
}

/// A captured `{wall time, PCR value}` pair from the most recent TOT section, used to
/// interpolate current wall time between TOT arrivals (spec section 4, "TOT anchor").
#[derive(Debug, Clone, Copy)]
pub struct TotAnchor {
    wall_time: DateTime<FixedOffset>,
    pcr: u64,
}

/// Result of [`TotAnchor::interpolate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpolatedTime {
    /// The estimated current wall time.
    pub time: DateTime<FixedOffset>,
    /// Whether `time` was extrapolated from the anchor (`true`) or is the anchor itself
    /// unmodified (`current_pcr == anchor pcr`, `false`).
    pub interpolated: bool,
}

impl TotAnchor {
    /// Captures a new anchor at `wall_time` (the TOT-decoded JST time) paired with the PCR
    /// value observed on the preferred PCR PID at the same moment.
    pub fn new(wall_time: DateTime<FixedOffset>, pcr: u64) -> Self {
        Self { wall_time, pcr }
    }

    /// The anchor's captured wall time.
    pub fn wall_time(&self) -> DateTime<FixedOffset> {
        self.wall_time
    }

    /// Estimates current wall time from `current_pcr` (33-bit base + 9-bit extension
    /// combined as `base * 300 + extension`, i.e. a 27 MHz tick count — see
    /// [`crate::packet::PcrTimestamp`]). PCR wraps roughly every 26.5 hours at 27 MHz; a
    /// wrapped delta is treated as an advance, never as going backwards, since TOT/PCR
    /// pairs are always captured close together in practice.
    ///
    /// When the elapsed PCR delta implies more than 15 seconds of extrapolation (spec
    /// section 6, Scenario F / `LibISDB::AnalyzerFilter::GetInterpolatedTOTTime`), the
    /// anchor is considered too stale to extrapolate from and this falls back to the
    /// anchor's own captured wall time with `interpolated` set to `false`, rather than
    /// returning nothing — the caller still gets the last known time, just unadjusted.
    pub fn interpolate(&self, current_pcr: u64) -> InterpolatedTime {
        const PCR_27MHZ_WRAP: u64 = 1u64 << 42; // 33-bit base * 300 wraps at 2^42 ticks worth
        let delta_27mhz = current_pcr.wrapping_sub(self.pcr) & (PCR_27MHZ_WRAP - 1);
        let delta_ticks_90k = delta_27mhz / 300;
        let delta_secs = delta_ticks_90k as i64 / PCR_HZ;
        let delta_nanos =
            ((delta_ticks_90k as i64 % PCR_HZ) * 1_000_000_000 / PCR_HZ) as i64;

        if delta_secs > MAX_INTERPOLATION_SECS {
            return InterpolatedTime {
                time: self.wall_time,
                interpolated: false,
            };
        }

        let time = self.wall_time
            + Duration::seconds(delta_secs)
            + Duration::nanoseconds(delta_nanos);
        InterpolatedTime {
            time,
            interpolated: delta_ticks_90k != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mjd_decodes_known_reference_date() {
        // MJD 58849 = 2020-01-01 (a commonly cited ARIB EPG test vector).
        let (y, m, d) = mjd_to_gregorian(58849);
        assert_eq!((y, m, d), (2020, 1, 1));
    }

    #[test]
    fn decode_jst_combines_mjd_and_bcd_time() {
        let raw_bcd = 0x235959u32; // 23:59:59 packed as 3 BCD bytes
        let dt = decode_jst((58849, raw_bcd)).unwrap();
        assert_eq!(dt.timezone(), jst());
        assert_eq!((dt.year(), dt.month(), dt.day()), (2020, 1, 1));
        assert_eq!((dt.hour(), dt.minute(), dt.second()), (23, 59, 59));
    }

    use chrono::Datelike;
    use chrono::Timelike;

    #[test]
    fn unspecified_time_sentinel_decodes_to_none() {
        assert_eq!(bcd_hms(0xFFFFFF), None);
        assert_eq!(decode_jst((58849, 0xFFFFFF)), None);
    }

    #[test]
    fn duration_decodes_hms_bcd() {
        let d = decode_duration(0x013000).unwrap(); // 01:30:00
        assert_eq!(d, Duration::hours(1) + Duration::minutes(30));
    }

    #[test]
    fn to_utc_and_back_round_trips_through_jst() {
        let jst_time = jst().with_ymd_and_hms(2020, 1, 1, 12, 0, 0).unwrap();
        let utc_time = to_utc(jst_time);
        assert_eq!(utc_time.hour(), 3);
        assert_eq!(to_jst(utc_time), jst_time);
    }

    #[test]
    fn interpolation_within_bound_advances_by_pcr_delta() {
        let anchor = TotAnchor::new(jst().with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(), 1_000_000);
        let five_seconds_later_pcr = 1_000_000 + 5 * 90_000 * 300;
        let result = anchor.interpolate(five_seconds_later_pcr);
        assert!(result.interpolated);
        assert_eq!(result.time, anchor.wall_time() + Duration::seconds(5));
    }

    #[test]
    fn interpolation_beyond_fifteen_seconds_falls_back_to_anchor_time() {
        // Spec section 8 Scenario F: a PCR delta beyond the 15s bound still returns the
        // anchor's own time, just unadjusted and not marked interpolated — not nothing.
        let anchor = TotAnchor::new(jst().with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(), 0);
        let twenty_seconds_later_pcr = 20 * 90_000 * 300;
        let result = anchor.interpolate(twenty_seconds_later_pcr);
        assert!(!result.interpolated);
        assert_eq!(result.time, anchor.wall_time());
    }

    #[test]
    fn interpolation_at_anchor_pcr_is_not_marked_interpolated() {
        let anchor = TotAnchor::new(jst().with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(), 42);
        let result = anchor.interpolate(42);
        assert!(!result.interpolated);
        assert_eq!(result.time, anchor.wall_time());
    }
}
