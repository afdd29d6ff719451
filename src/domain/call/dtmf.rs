//! DTMF tone validation and sequencing options

use crate::config::CallConfig;
use crate::domain::shared::error::ClientError;
use crate::domain::shared::result::Result;
use std::time::Duration;

/// DTMF tone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtmfTone {
    Zero,
    One,
    Two,
    Three,
    Four,
    Five,
    Six,
    Seven,
    Eight,
    Nine,
    Star,
    Pound,
    A,
    B,
    C,
    D,
}

impl DtmfTone {
    pub fn to_char(&self) -> char {
        match self {
            DtmfTone::Zero => '0',
            DtmfTone::One => '1',
            DtmfTone::Two => '2',
            DtmfTone::Three => '3',
            DtmfTone::Four => '4',
            DtmfTone::Five => '5',
            DtmfTone::Six => '6',
            DtmfTone::Seven => '7',
            DtmfTone::Eight => '8',
            DtmfTone::Nine => '9',
            DtmfTone::Star => '*',
            DtmfTone::Pound => '#',
            DtmfTone::A => 'A',
            DtmfTone::B => 'B',
            DtmfTone::C => 'C',
            DtmfTone::D => 'D',
        }
    }

    /// Parse a single tone. Letter tones are case-insensitive.
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            '0' => Some(DtmfTone::Zero),
            '1' => Some(DtmfTone::One),
            '2' => Some(DtmfTone::Two),
            '3' => Some(DtmfTone::Three),
            '4' => Some(DtmfTone::Four),
            '5' => Some(DtmfTone::Five),
            '6' => Some(DtmfTone::Six),
            '7' => Some(DtmfTone::Seven),
            '8' => Some(DtmfTone::Eight),
            '9' => Some(DtmfTone::Nine),
            '*' => Some(DtmfTone::Star),
            '#' => Some(DtmfTone::Pound),
            'A' => Some(DtmfTone::A),
            'B' => Some(DtmfTone::B),
            'C' => Some(DtmfTone::C),
            'D' => Some(DtmfTone::D),
            _ => None,
        }
    }
}

/// Validate a whole sequence up front; one bad character rejects the
/// lot before anything is sent.
pub fn parse_sequence(tones: &str) -> Result<Vec<DtmfTone>> {
    if tones.is_empty() {
        return Err(ClientError::Configuration(
            "DTMF sequence must not be empty".to_string(),
        ));
    }

    tones
        .chars()
        .map(|c| {
            DtmfTone::from_char(c).ok_or_else(|| {
                ClientError::Configuration(format!("Invalid DTMF tone: '{}'", c))
            })
        })
        .collect()
}

/// Per-sequence timing options.
#[derive(Debug, Clone, Copy)]
pub struct DtmfOptions {
    pub tone_duration: Duration,
    pub inter_tone_gap: Duration,
}

impl DtmfOptions {
    pub fn from_config(config: &CallConfig) -> Self {
        Self {
            tone_duration: Duration::from_millis(config.dtmf_tone_duration_ms),
            inter_tone_gap: Duration::from_millis(config.dtmf_inter_tone_gap_ms),
        }
    }
}

impl Default for DtmfOptions {
    fn default() -> Self {
        Self::from_config(&CallConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_sequence() {
        let tones = parse_sequence("1A*#").unwrap();
        let chars: String = tones.iter().map(|t| t.to_char()).collect();
        assert_eq!(chars, "1A*#");
    }

    #[test]
    fn test_letter_tones_are_case_insensitive() {
        let tones = parse_sequence("abcd").unwrap();
        let chars: String = tones.iter().map(|t| t.to_char()).collect();
        assert_eq!(chars, "ABCD");
    }

    #[test]
    fn test_invalid_tone_rejected() {
        assert!(parse_sequence("12E4").is_err());
        assert!(parse_sequence("1 2").is_err());
        assert!(parse_sequence("").is_err());
    }

    #[test]
    fn test_default_options() {
        let options = DtmfOptions::default();
        assert_eq!(options.tone_duration, Duration::from_millis(100));
        assert_eq!(options.inter_tone_gap, Duration::from_millis(70));
    }
}
