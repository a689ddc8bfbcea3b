//! TechWing message formats.
//!
//! Mirae and YAC handlers speak dialects of the same protocol, so the parsers
//! and builders here are public and parameterized where the dialects differ.
//!
//! | message | direction | example |
//! |---|---|---|
//! | site population | handler | `FULLSITES 00000005` |
//! | test kind | handler | `TESTKIND 04` |
//! | bin command | plugin | `BINON:AAAAAA21;` |
//! | bin echo | handler | `ECHO:AAAAAA21;` |

use ph_core::FuncError;
use thiserror::Error;

/// Positive answer to setup commands.
pub const SETTING_OK: &str = "SettingOK";
/// Positive answer to operating commands.
pub const DONE: &str = "done";
/// Bin code for a slot without a device.
pub const EMPTY_SLOT: &str = "A";

/// Longest population reply, commas included.
const FULLSITES_MAX_LEN: usize = 81;
/// Longest population reply without commas: the keyword plus 64 digits.
const FULLSITES_MAX_COMPACT_LEN: usize = 74;
const FULLSITES_DIGITS: usize = 64;

/// Service request bytes.
pub mod srq {
    pub const JAM: u8 = 0x3d;
    pub const TEST_START: u8 = 0x41;
    pub const LOT_START: u8 = 0x46;
    pub const DEVICE_READY: u8 = 0x47;
    pub const LOT_END: u8 = 0x48;
}

/// A handler message that could not be used.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("site population not received from handler: {0:?}, expected \"FULLSITES x\"")]
    BadPopulation(String),

    #[error("invalid test kind answer {0:?}")]
    BadTestKind(String),

    #[error("could not bin to bin index {bin}, {available} handler bins configured")]
    BadBin { bin: i64, available: usize },

    #[error("{command} returned {answer:?}, expected {expected:?}")]
    Refused {
        command: String,
        answer: String,
        expected: &'static str,
    },
}

impl From<WireError> for FuncError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::BadBin { .. } => FuncError::Binning,
            _ => FuncError::Answer,
        }
    }
}

/// Log `err` and turn it into the plugin result.
pub fn reject(err: WireError) -> FuncError {
    tracing::error!("{}", err);
    err.into()
}

/// Parse a `FULLSITES` reply into one pending flag per configured site.
///
/// The hex value may be split by commas and is read as four 64 bit words, the
/// least significant bit being site 0. Devices reported beyond the configured
/// sites are logged and ignored.
pub fn parse_fullsites(answer: &str, sites: usize) -> Result<Vec<bool>, WireError> {
    let bad = || WireError::BadPopulation(answer.to_string());
    let upper = answer.trim().to_ascii_uppercase();
    if upper.len() > FULLSITES_MAX_LEN {
        return Err(bad());
    }
    let compact: String = upper.chars().filter(|c| *c != ',').collect();
    if compact.len() > FULLSITES_MAX_COMPACT_LEN {
        return Err(bad());
    }
    let digits = compact
        .strip_prefix("FULLSITES")
        .and_then(|rest| rest.split_whitespace().next())
        .ok_or_else(bad)?;
    if digits.len() > FULLSITES_DIGITS || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(bad());
    }

    let padded = format!("{:0>width$}", digits, width = FULLSITES_DIGITS);
    let mut words = [0u64; 4];
    for (i, word) in words.iter_mut().rev().enumerate() {
        *word = u64::from_str_radix(&padded[i * 16..(i + 1) * 16], 16).map_err(|_| bad())?;
    }

    let bit = |site: usize| site < 256 && words[site / 64] & (1u64 << (site % 64)) != 0;
    let pending: Vec<bool> = (0..sites).map(bit).collect();
    if (sites..256).any(bit) {
        tracing::error!(
            sites,
            "the handler presents more devices than configured, \
             the driver configuration must be changed to support more sites"
        );
    }
    Ok(pending)
}

/// Handler state reported by `TESTKIND?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestKind {
    Normal,
    PrimeLotStart,
    FirstRetest,
    SecondRetest,
    /// All tests of the lot or retest ran, sorting is not finished.
    RetestDone,
    /// Lot finished including sorting.
    LotEnd,
}

pub fn parse_test_kind(answer: &str) -> Result<TestKind, WireError> {
    let code = answer
        .trim()
        .strip_prefix("TESTKIND")
        .map(str::trim)
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| WireError::BadTestKind(answer.to_string()))?;
    match code {
        0 => Ok(TestKind::Normal),
        2 => Ok(TestKind::PrimeLotStart),
        4 => Ok(TestKind::FirstRetest),
        5 => Ok(TestKind::SecondRetest),
        8 => Ok(TestKind::RetestDone),
        10 => Ok(TestKind::LotEnd),
        _ => Err(WireError::BadTestKind(answer.to_string())),
    }
}

/// Handler bin code of SmarTest bin index `bin`.
///
/// With `bin_ids` configured the index selects one of them. Otherwise the
/// handler counts bins from 1 and the code is `bin + 1` in hex.
pub fn bin_code(bin: i64, bin_ids: &[String]) -> Result<String, WireError> {
    let bad = || WireError::BadBin {
        bin,
        available: bin_ids.len(),
    };
    if bin_ids.is_empty() {
        if bin < 0 {
            return Err(bad());
        }
        return Ok(format!("{:x}", bin + 1));
    }
    usize::try_from(bin)
        .ok()
        .and_then(|i| bin_ids.get(i))
        .cloned()
        .ok_or_else(bad)
}

/// Build a bin command over `slots` slots, highest slot first.
///
/// Slots are grouped by eight, the last one ends the command. `occupied`
/// decides which sites get their bin code, all others get `empty`
/// ([`EMPTY_SLOT`] for TechWing and Mirae). Returns `None` when no slot holds
/// a device.
pub fn binon_message(
    prefix: &str,
    slots: usize,
    empty: &str,
    occupied: &[bool],
    bins: &[i64],
    bin_ids: &[String],
) -> Result<Option<String>, WireError> {
    let mut msg = String::from(prefix);
    let mut any = false;
    for slot in (0..slots).rev() {
        if occupied.get(slot).copied().unwrap_or(false) {
            let bin = bins.get(slot).copied().unwrap_or(-1);
            msg.push_str(&bin_code(bin, bin_ids)?);
            any = true;
        } else {
            msg.push_str(empty);
        }
        if slot == 0 {
            msg.push(';');
        } else if slot % 8 == 0 {
            msg.push(',');
        }
    }
    Ok(any.then_some(msg))
}

/// Compare the first `count` hex digits after `separator` in the sent bin
/// command and the handler's echo, ignoring case.
pub fn echo_matches(sent: &str, echo: &str, separator: char, count: usize) -> bool {
    let digits = |msg: &str| -> Vec<char> {
        msg.split_once(separator)
            .map(|(_, rest)| {
                rest.chars()
                    .filter(char::is_ascii_hexdigit)
                    .map(|c| c.to_ascii_lowercase())
                    .collect()
            })
            .unwrap_or_default()
    };
    let (sent, echo) = (digits(sent), digits(echo));
    sent.len() >= count && echo.len() >= count && sent[..count] == echo[..count]
}

/// Site selection bit field in hex, site 0 in the least significant bit.
pub fn site_mask_hex(active: &[bool]) -> String {
    let nibbles = active.len().div_ceil(4).max(1);
    let hex: String = (0..nibbles)
        .rev()
        .map(|n| {
            let value = (0..4)
                .filter(|bit| active.get(n * 4 + bit).copied().unwrap_or(false))
                .fold(0u32, |acc, bit| acc | (1 << bit));
            char::from_digit(value, 16)
                .unwrap_or('0')
                .to_ascii_uppercase()
        })
        .collect();
    let trimmed = hex.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Check that `answer` starts with `expected`, ignoring case.
pub fn expect_reply(command: &str, answer: &str, expected: &'static str) -> Result<(), WireError> {
    let matches = answer
        .get(..expected.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(expected));
    if matches {
        Ok(())
    } else {
        Err(WireError::Refused {
            command: command.to_string(),
            answer: answer.to_string(),
            expected,
        })
    }
}
