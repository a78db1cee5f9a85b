//! Encoder progress parsing
//!
//! ffmpeg reports the input duration once (`Duration: HH:MM:SS.ss`) and then
//! the current position on every status line (`time=HH:MM:SS.ss`). Progress is
//! `ceil(elapsed / total * 100)`, clamped to 100.

/// A progress sample from the encoder
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressTick {
    /// Seconds of media processed so far
    pub elapsed_secs: f64,
    /// Percent complete, when the total duration is known
    pub percent: Option<u8>,
}

/// Parse an `HH:MM:SS.ss` timestamp into seconds.
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let mut parts = value.trim().split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || hours < 0.0 || minutes < 0.0 || seconds < 0.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Format seconds as `HH:MM:SS` (whole seconds, rounded down).
pub fn format_timestamp(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.floor() as u64
    } else {
        0
    };
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// Percent complete, rounded up and clamped to 100.
pub fn percent_complete(elapsed_secs: f64, total_secs: f64) -> u8 {
    if total_secs <= 0.0 || !total_secs.is_finite() {
        return 0;
    }
    let percent = (elapsed_secs.max(0.0) * 100.0 / total_secs).ceil();
    percent.min(100.0) as u8
}

/// Value following `key` up to the next whitespace or comma
fn token_after<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start();
    let end = rest
        .find(|c: char| c.is_whitespace() || c == ',')
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Stateful parser fed one stderr line at a time
#[derive(Debug, Default)]
pub struct ProgressParser {
    total_secs: Option<f64>,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total input duration, once seen
    pub fn total_secs(&self) -> Option<f64> {
        self.total_secs
    }

    /// Feed a stderr line. Returns a tick when the line carries a position.
    pub fn feed(&mut self, line: &str) -> Option<ProgressTick> {
        if self.total_secs.is_none() {
            if let Some(value) = token_after(line, "Duration:") {
                // live inputs report "N/A"
                self.total_secs = parse_timestamp(value).filter(|d| *d > 0.0);
                return None;
            }
        }

        let elapsed_secs = parse_timestamp(token_after(line, "time=")?)?;
        Some(ProgressTick {
            elapsed_secs,
            percent: self.total_secs.map(|t| percent_complete(elapsed_secs, t)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("00:01:40.00"), Some(100.0));
        assert_eq!(parse_timestamp("01:00:00.50"), Some(3600.5));
        assert_eq!(parse_timestamp("N/A"), None);
        assert_eq!(parse_timestamp("12:00"), None);
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0.0), "00:00:00");
        assert_eq!(format_timestamp(3725.9), "01:02:05");
        assert_eq!(format_timestamp(-3.0), "00:00:00");
    }

    #[test]
    fn test_duration_then_time() {
        let mut parser = ProgressParser::new();
        assert!(parser
            .feed("  Duration: 00:01:40.00, start: 0.000000, bitrate: 1205 kb/s")
            .is_none());
        assert_eq!(parser.total_secs(), Some(100.0));

        let tick = parser
            .feed("frame=  240 fps= 60 q=28.0 size=    1024kB time=00:00:10.00 bitrate= 838.9kbits/s speed=2.5x")
            .unwrap();
        assert_eq!(tick.elapsed_secs, 10.0);
        assert_eq!(tick.percent, Some(10));

        let tick = parser.feed("frame= 2400 time=00:00:10.01 bitrate=1.0").unwrap();
        assert_eq!(tick.percent, Some(11));
    }

    #[test]
    fn test_unknown_duration_reports_elapsed_only() {
        let mut parser = ProgressParser::new();
        parser.feed("  Duration: N/A, start: 0.000000, bitrate: N/A");
        let tick = parser.feed("frame=  10 time=00:00:04.00 bitrate=N/A").unwrap();
        assert_eq!(tick.elapsed_secs, 4.0);
        assert_eq!(tick.percent, None);
    }

    #[test]
    fn test_ignores_unrelated_lines() {
        let mut parser = ProgressParser::new();
        assert!(parser.feed("Stream #0:0: Video: h264").is_none());
        assert!(parser.feed("time=N/A").is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_percent_is_bounded_and_monotonic(
            total in 1.0f64..100_000.0,
            a in 0.0f64..200_000.0,
            b in 0.0f64..200_000.0,
        ) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let p_lo = percent_complete(lo, total);
            let p_hi = percent_complete(hi, total);
            prop_assert!(p_hi <= 100);
            prop_assert!(p_lo <= p_hi);
            if hi >= total {
                prop_assert_eq!(p_hi, 100);
            }
        }
    }
}
