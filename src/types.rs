// =============================================================================
// Shared types used across the chartfeed engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Candle bucket widths served by the feed.
///
/// The set is fixed process-wide: every tracked symbol gets one buffer per
/// interval listed in [`Interval::ALL`]. Intervals are not configurable per
/// symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "1M")]
    OneMonth,
}

impl Interval {
    /// The full fixed interval set, smallest bucket first.
    pub const ALL: [Interval; 4] = [
        Interval::OneMinute,
        Interval::FiveMinutes,
        Interval::OneDay,
        Interval::OneMonth,
    ];

    /// Wire string used by both the REST and stream endpoints.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::OneDay => "1d",
            Self::OneMonth => "1M",
        }
    }

    /// Parse a wire string. Case-sensitive: "1m" is one minute, "1M" is one
    /// month.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Self::OneMinute),
            "5m" => Some(Self::FiveMinutes),
            "1d" => Some(Self::OneDay),
            "1M" => Some(Self::OneMonth),
            _ => None,
        }
    }

    /// Default snapshot depth (candle count) requested when seeding a buffer
    /// for this interval. Smaller buckets request deeper history by count so
    /// that every interval covers a comparable wall-clock lookback.
    pub fn snapshot_limit(self) -> u32 {
        match self {
            Self::OneMinute => 3000,
            Self::FiveMinutes => 1000,
            Self::OneDay => 1440,
            Self::OneMonth => 30,
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Chart representation requested by a consumer.
///
/// Candlestick and Bar share the raw OHLC rows; Line and Area are close-price
/// points; HeikinAshi is derived on demand from the raw series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Candlestick,
    Bar,
    Line,
    Area,
    #[serde(rename = "heikinashi")]
    HeikinAshi,
}

impl ChartKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "candlestick" => Some(Self::Candlestick),
            "bar" => Some(Self::Bar),
            "line" => Some(Self::Line),
            "area" => Some(Self::Area),
            "heikinashi" => Some(Self::HeikinAshi),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Candlestick => "candlestick",
            Self::Bar => "bar",
            Self::Line => "line",
            Self::Area => "area",
            Self::HeikinAshi => "heikinashi",
        }
    }
}

impl Default for ChartKind {
    fn default() -> Self {
        Self::Candlestick
    }
}

impl std::fmt::Display for ChartKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_wire_roundtrip() {
        for interval in Interval::ALL {
            assert_eq!(Interval::parse(interval.as_str()), Some(interval));
        }
    }

    #[test]
    fn interval_parse_is_case_sensitive() {
        assert_eq!(Interval::parse("1m"), Some(Interval::OneMinute));
        assert_eq!(Interval::parse("1M"), Some(Interval::OneMonth));
        assert_eq!(Interval::parse("1D"), None);
        assert_eq!(Interval::parse("15m"), None);
    }

    #[test]
    fn snapshot_limits_deepen_for_smaller_buckets() {
        assert_eq!(Interval::OneMinute.snapshot_limit(), 3000);
        assert_eq!(Interval::FiveMinutes.snapshot_limit(), 1000);
        assert_eq!(Interval::OneDay.snapshot_limit(), 1440);
        assert_eq!(Interval::OneMonth.snapshot_limit(), 30);
    }

    #[test]
    fn chart_kind_parse() {
        assert_eq!(ChartKind::parse("heikinashi"), Some(ChartKind::HeikinAshi));
        assert_eq!(ChartKind::parse("line"), Some(ChartKind::Line));
        assert_eq!(ChartKind::parse("renko"), None);
        assert_eq!(ChartKind::default(), ChartKind::Candlestick);
    }
}
