//! CTP (China Financial Futures wire protocol) direction / offset mapping.
//!
//! Hardcoded and exhaustive, matching the CTP API character constants
//! bit-for-bit. Unknown values never proceed silently.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Offset {
    Open,
    Close,
    CloseToday,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CtpMappingError {
    #[error("unknown CTP direction char: {0:?}")]
    UnknownDirection(char),
    #[error("unknown CTP offset flag char: {0:?}")]
    UnknownOffsetFlag(char),
}

pub const CTP_DIRECTION_BUY: char = '0';
pub const CTP_DIRECTION_SELL: char = '1';

pub const CTP_OFFSET_OPEN: char = '0';
pub const CTP_OFFSET_CLOSE: char = '1';
pub const CTP_OFFSET_CLOSETODAY: char = '3';

pub fn side_to_ctp(side: Side) -> char {
    match side {
        Side::Buy => CTP_DIRECTION_BUY,
        Side::Sell => CTP_DIRECTION_SELL,
    }
}

pub fn ctp_to_side(direction: char) -> Result<Side, CtpMappingError> {
    match direction {
        CTP_DIRECTION_BUY => Ok(Side::Buy),
        CTP_DIRECTION_SELL => Ok(Side::Sell),
        other => Err(CtpMappingError::UnknownDirection(other)),
    }
}

pub fn offset_to_ctp(offset: Offset) -> char {
    match offset {
        Offset::Open => CTP_OFFSET_OPEN,
        Offset::Close => CTP_OFFSET_CLOSE,
        Offset::CloseToday => CTP_OFFSET_CLOSETODAY,
    }
}

pub fn ctp_to_offset(flag: char) -> Result<Offset, CtpMappingError> {
    match flag {
        CTP_OFFSET_OPEN => Ok(Offset::Open),
        CTP_OFFSET_CLOSE => Ok(Offset::Close),
        CTP_OFFSET_CLOSETODAY => Ok(Offset::CloseToday),
        other => Err(CtpMappingError::UnknownOffsetFlag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_round_trips() {
        for side in [Side::Buy, Side::Sell] {
            assert_eq!(ctp_to_side(side_to_ctp(side)).unwrap(), side);
        }
    }

    #[test]
    fn offset_round_trips() {
        for offset in [Offset::Open, Offset::Close, Offset::CloseToday] {
            assert_eq!(ctp_to_offset(offset_to_ctp(offset)).unwrap(), offset);
        }
    }

    #[test]
    fn exact_wire_chars() {
        assert_eq!(side_to_ctp(Side::Buy), '0');
        assert_eq!(side_to_ctp(Side::Sell), '1');
        assert_eq!(offset_to_ctp(Offset::Open), '0');
        assert_eq!(offset_to_ctp(Offset::Close), '1');
        assert_eq!(offset_to_ctp(Offset::CloseToday), '3');
    }

    #[test]
    fn unknown_direction_errors() {
        assert_eq!(
            ctp_to_side('9'),
            Err(CtpMappingError::UnknownDirection('9'))
        );
    }

    #[test]
    fn unknown_offset_errors() {
        assert_eq!(
            ctp_to_offset('7'),
            Err(CtpMappingError::UnknownOffsetFlag('7'))
        );
    }
}
