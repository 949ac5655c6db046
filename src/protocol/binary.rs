use bytes::Buf;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::ops::Range;

use crate::errors::DecodeError;
use crate::models::instrument::normalize_token;
use crate::models::Tick;

/// Token field: null-padded ASCII
pub const TOKEN_RANGE: Range<usize> = 2..27;

/// Offsets of the little-endian i32 price fields (price × 100)
pub const LTP_OFFSET: usize = 43;
pub const OPEN_OFFSET: usize = 59;
pub const LOW_OFFSET: usize = 91;
pub const HIGH_OFFSET: usize = 99;
pub const CLOSE_OFFSET: usize = 107;

/// Shortest frame that still carries token + last traded price
pub const MIN_FRAME_LEN: usize = LTP_OFFSET + 4;

/// Shortest frame that also carries open/high/low/close
pub const OHLC_FRAME_LEN: usize = CLOSE_OFFSET + 4;

/// Fixed-point scale of every price field (two fractional digits)
const PRICE_SCALE: u32 = 2;

/// Decode one upstream frame, stamping it with the current time
pub fn decode(frame: &[u8]) -> Result<Tick, DecodeError> {
    decode_at(frame, Utc::now())
}

/// Decode one upstream frame with an explicit observation time
///
/// Frames between [`MIN_FRAME_LEN`] and [`OHLC_FRAME_LEN`] bytes decode with
/// OHLC left as `None`. Every read is bounds-checked, so a truncated or
/// garbled frame yields an error rather than a panic.
pub fn decode_at(frame: &[u8], observed_at: DateTime<Utc>) -> Result<Tick, DecodeError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(DecodeError::FrameTooShort {
            len: frame.len(),
            required: MIN_FRAME_LEN,
        });
    }

    let token = read_token(frame)?;
    let last_traded_price = read_price(frame, LTP_OFFSET)?;

    let (open, high, low, close) = if frame.len() >= OHLC_FRAME_LEN {
        (
            Some(read_price(frame, OPEN_OFFSET)?),
            Some(read_price(frame, HIGH_OFFSET)?),
            Some(read_price(frame, LOW_OFFSET)?),
            Some(read_price(frame, CLOSE_OFFSET)?),
        )
    } else {
        (None, None, None, None)
    };

    Ok(Tick {
        token,
        last_traded_price,
        open,
        high,
        low,
        close,
        observed_at,
    })
}

/// Token bytes up to the first null, normalized like a subscription key
fn read_token(frame: &[u8]) -> Result<String, DecodeError> {
    let raw = frame.get(TOKEN_RANGE).ok_or(DecodeError::OutOfRange {
        offset: TOKEN_RANGE.start,
        len: frame.len(),
    })?;

    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let text = std::str::from_utf8(&raw[..end])
        .map_err(|e| DecodeError::InvalidToken(e.to_string()))?;

    normalize_token(text).map_err(|e| DecodeError::InvalidToken(e.to_string()))
}

fn read_i32_le(frame: &[u8], offset: usize) -> Result<i32, DecodeError> {
    let mut field = frame
        .get(offset..offset + 4)
        .ok_or(DecodeError::OutOfRange {
            offset,
            len: frame.len(),
        })?;
    Ok(field.get_i32_le())
}

fn read_price(frame: &[u8], offset: usize) -> Result<Decimal, DecodeError> {
    let raw = read_i32_le(frame, offset)?;
    Ok(Decimal::new(i64::from(raw), PRICE_SCALE))
}

/// Build a frame in the upstream layout
///
/// Counterpart of [`decode`] for the mock feed and tests. With `ohlc`
/// (`[open, high, low, close]`) the frame is full length, otherwise it is
/// the minimum length. Tokens longer than the token field are truncated.
pub fn encode_frame(token: &str, ltp: i32, ohlc: Option<[i32; 4]>) -> Vec<u8> {
    let len = if ohlc.is_some() { OHLC_FRAME_LEN } else { MIN_FRAME_LEN };
    let mut buf = vec![0u8; len];

    // Mode + exchange bytes the decoder ignores
    buf[0] = 2;
    buf[1] = 1;
    let token = &token.as_bytes()[..token.len().min(TOKEN_RANGE.len())];
    buf[TOKEN_RANGE.start..TOKEN_RANGE.start + token.len()].copy_from_slice(token);
    buf[LTP_OFFSET..LTP_OFFSET + 4].copy_from_slice(&ltp.to_le_bytes());

    if let Some([open, high, low, close]) = ohlc {
        buf[OPEN_OFFSET..OPEN_OFFSET + 4].copy_from_slice(&open.to_le_bytes());
        buf[HIGH_OFFSET..HIGH_OFFSET + 4].copy_from_slice(&high.to_le_bytes());
        buf[LOW_OFFSET..LOW_OFFSET + 4].copy_from_slice(&low.to_le_bytes());
        buf[CLOSE_OFFSET..CLOSE_OFFSET + 4].copy_from_slice(&close.to_le_bytes());
    }

    buf
}
