//! Engine progress markers.
//!
//! ffmpeg is run with `-progress pipe:2 -nostats`, which prints
//! `out_time_us=<micros>` and `out_time=HH:MM:SS.micros` in each block; the
//! interactive stats line prints `time=HH:MM:SS.cs`. sox with `-S` prints
//! `In:12.50% 00:00:01.25 [00:00:08.75] Out:...` lines instead.

use std::time::Duration;

/// Extract the media time from an engine output line: an `out_time_us=`
/// microsecond count, a `time=HH:MM:SS.frac` token, or the elapsed clock of a
/// sox `In:` status line. Returns `None` for lines without one, `N/A` values,
/// and negative timestamps ffmpeg prints before the first packet.
pub fn parse_time_marker(line: &str) -> Option<Duration> {
    if let Some(micros) = line.trim().strip_prefix("out_time_us=") {
        return micros.parse().ok().map(Duration::from_micros);
    }
    if let Some(pos) = line.find("time=") {
        let token = line[pos + "time=".len()..].split_whitespace().next()?;
        return parse_clock(token);
    }
    let rest = line.trim_start().strip_prefix("In:")?;
    let clock = rest.split_whitespace().nth(1)?;
    parse_clock(clock)
}

fn parse_clock(token: &str) -> Option<Duration> {
    let mut parts = token.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let sec_token = parts.next()?;
    let (whole, frac) = sec_token.split_once('.').unwrap_or((sec_token, ""));
    if parts.next().is_some() {
        return None;
    }
    let seconds: u64 = whole.parse().ok()?;
    if minutes >= 60 || seconds >= 60 {
        return None;
    }
    let nanos = frac_to_nanos(frac)?;
    Some(Duration::new(hours * 3600 + minutes * 60 + seconds, nanos))
}

/// `"53"` -> 530_000_000. At most nanosecond precision is kept.
fn frac_to_nanos(frac: &str) -> Option<u32> {
    if frac.is_empty() {
        return Some(0);
    }
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let digits: String = frac.chars().chain(std::iter::repeat('0')).take(9).collect();
    digits.parse().ok()
}

/// Keys of the `key=value` blocks ffmpeg writes with `-progress`.
const PROGRESS_KEYS: &[&str] = &[
    "frame",
    "fps",
    "bitrate",
    "total_size",
    "out_time_us",
    "out_time_ms",
    "out_time",
    "dup_frames",
    "drop_frames",
    "speed",
    "progress",
];

/// True for machine-readable progress output that carries no diagnostic
/// value: ffmpeg `-progress` pairs and sox `In:` status lines.
pub fn is_progress_line(line: &str) -> bool {
    let line = line.trim();
    if line.starts_with("In:") {
        return true;
    }
    match line.split_once('=') {
        Some((key, _)) => PROGRESS_KEYS.contains(&key) || key.starts_with("stream_"),
        None => false,
    }
}

/// Coalesces a stream of media-time observations into reports at least
/// `step` apart.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    step: Duration,
    reported: Duration,
    latest: Option<Duration>,
}

impl ProgressThrottle {
    pub fn new(step: Duration) -> Self {
        Self {
            step,
            reported: Duration::ZERO,
            latest: None,
        }
    }

    /// Record a marker; returns the value to report when media time has
    /// advanced by at least one step since the last report.
    pub fn observe(&mut self, time: Duration) -> Option<Duration> {
        if self.latest.map_or(true, |l| time > l) {
            self.latest = Some(time);
        }
        if time >= self.reported + self.step && time > self.reported {
            self.reported = time;
            return Some(time);
        }
        None
    }

    /// Final report once the engine has finished, if anything is unreported.
    pub fn finish(&mut self) -> Option<Duration> {
        let latest = self.latest?;
        if latest > self.reported {
            self.reported = latest;
            return Some(latest);
        }
        None
    }

    /// Largest media time seen so far.
    pub fn latest(&self) -> Option<Duration> {
        self.latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_progress_lines() {
        assert!(is_progress_line("out_time=00:00:01.000000"));
        assert!(is_progress_line("progress=continue"));
        assert!(is_progress_line("stream_0_0_q=-1.0"));
        assert!(is_progress_line("In:12.50% 00:00:01.25 [00:00:08.75] Out:55.1k"));
        assert!(!is_progress_line("[Parsed_aecho_1 @ 0x55] Invalid argument"));
        assert!(!is_progress_line("size=     512kB time=00:01:02.50 bitrate= 67.1kbits/s"));
    }

    #[test]
    fn parses_stats_line() {
        let line = "size=     512kB time=00:01:02.50 bitrate= 67.1kbits/s speed=41.2x";
        assert_eq!(parse_time_marker(line), Some(Duration::from_millis(62_500)));
    }

    #[test]
    fn parses_progress_block_line() {
        assert_eq!(
            parse_time_marker("out_time=01:00:00.250000"),
            Some(Duration::from_millis(3_600_250))
        );
    }

    #[test]
    fn parses_sox_status_line() {
        let line = "In:45.30% 00:00:04.53 [00:00:05.47] Out:200k  [ -====|====- ]        Clip:0";
        assert_eq!(parse_time_marker(line), Some(Duration::from_millis(4_530)));
        assert_eq!(parse_time_marker("Input File     : 'voice.wav'"), None);
    }

    #[test]
    fn parses_microsecond_key() {
        assert_eq!(parse_time_marker("out_time_us=5250000"), Some(Duration::from_millis(5_250)));
        assert_eq!(parse_time_marker("out_time_us=N/A"), None);
        assert_eq!(parse_time_marker("out_time_us=-9223372036854775807"), None);
    }

    #[test]
    fn ignores_millisecond_key() {
        // Despite its name ffmpeg writes microseconds here; out_time_us covers it.
        assert_eq!(parse_time_marker("out_time_ms=5000000"), None);
    }

    #[test]
    fn rejects_na_and_negative() {
        assert_eq!(parse_time_marker("out_time=N/A"), None);
        assert_eq!(parse_time_marker("time=-577014:32:22.77"), None);
        assert_eq!(parse_time_marker("no marker here"), None);
    }

    #[test]
    fn throttle_reports_every_step() {
        let mut t = ProgressThrottle::new(Duration::from_secs(30));
        assert_eq!(t.observe(Duration::from_secs(10)), None);
        assert_eq!(t.observe(Duration::from_secs(29)), None);
        assert_eq!(t.observe(Duration::from_secs(31)), Some(Duration::from_secs(31)));
        assert_eq!(t.observe(Duration::from_secs(45)), None);
        assert_eq!(t.observe(Duration::from_secs(61)), Some(Duration::from_secs(61)));
        assert_eq!(t.finish(), None);
    }

    #[test]
    fn throttle_finish_flushes_tail() {
        let mut t = ProgressThrottle::new(Duration::from_secs(30));
        t.observe(Duration::from_secs(12));
        assert_eq!(t.finish(), Some(Duration::from_secs(12)));
        assert_eq!(t.latest(), Some(Duration::from_secs(12)));
    }

    #[test]
    fn throttle_ignores_going_backwards() {
        let mut t = ProgressThrottle::new(Duration::from_secs(1));
        t.observe(Duration::from_secs(5));
        assert_eq!(t.observe(Duration::from_secs(3)), None);
        assert_eq!(t.latest(), Some(Duration::from_secs(5)));
    }
}
