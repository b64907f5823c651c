use std::{error::Error, fmt::Display, num::ParseFloatError, ops::Range, str::FromStr};

use serde::{Deserialize, Serialize};

/// A retention time interval in minutes, inclusive at both ends
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, time: f64) -> bool {
        self.start <= time && time <= self.end
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: f64::INFINITY,
        }
    }
}

#[derive(Debug)]
pub enum TimeRangeParseError {
    MalformedStart(ParseFloatError),
    MalformedEnd(ParseFloatError),
}

impl Display for TimeRangeParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeRangeParseError::MalformedStart(e) => {
                write!(f, "Failed to parse time range start {e}")
            }
            TimeRangeParseError::MalformedEnd(e) => {
                write!(f, "Failed to parse time range end {e}")
            }
        }
    }
}

impl Error for TimeRangeParseError {}

impl FromStr for TimeRange {
    type Err = TimeRangeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = if s.contains(' ') {
            s.split(' ')
        } else if s.contains(':') {
            s.split(':')
        } else if s.contains('-') {
            s.split('-')
        } else {
            s.split(' ')
        };
        let start_t = match tokens.next().map(str::trim).unwrap_or_default() {
            "" => 0.0,
            start_s => start_s
                .parse()
                .map_err(TimeRangeParseError::MalformedStart)?,
        };
        let end_t = match tokens.next().map(str::trim).unwrap_or_default() {
            "" => f64::INFINITY,
            end_s => end_s.parse().map_err(TimeRangeParseError::MalformedEnd)?,
        };
        Ok(TimeRange {
            start: start_t,
            end: end_t,
        })
    }
}

impl From<Range<f64>> for TimeRange {
    fn from(value: Range<f64>) -> Self {
        Self::new(value.start, value.end)
    }
}

impl From<(f64, f64)> for TimeRange {
    fn from(value: (f64, f64)) -> Self {
        Self::new(value.0, value.1)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_time_fromstr() -> Result<(), TimeRangeParseError> {
        let t: TimeRange = "52.0-".parse()?;
        assert_eq!(t.start, 52.0);
        assert_eq!(t.end, f64::INFINITY);

        let t: TimeRange = "-52.0".parse()?;
        assert_eq!(t.start, 0.0);
        assert_eq!(t.end, 52.0);

        let t: TimeRange = "29.0:29.3".parse()?;
        assert_eq!(t.start, 29.0);
        assert_eq!(t.end, 29.3);

        let t: TimeRange = "-".parse()?;
        assert_eq!(t, TimeRange::default());

        let t: TimeRange = "12.5".parse()?;
        assert_eq!(t.start, 12.5);
        assert_eq!(t.end, f64::INFINITY);
        Ok(())
    }

    #[test]
    fn test_time_fromstr_malformed() {
        assert!(matches!(
            "a-".parse::<TimeRange>(),
            Err(TimeRangeParseError::MalformedStart(_))
        ));
        assert!(matches!(
            "-b".parse::<TimeRange>(),
            Err(TimeRangeParseError::MalformedEnd(_))
        ));
        // the start is checked first
        assert!(matches!(
            "a-b".parse::<TimeRange>(),
            Err(TimeRangeParseError::MalformedStart(_))
        ));
    }

    #[test]
    fn test_contains() {
        let t = TimeRange::new(29.0, 29.3);
        assert!(t.contains(29.0));
        assert!(t.contains(29.3));
        assert!(!t.contains(29.31));
        assert!(TimeRange::default().contains(1e6));
    }
}
