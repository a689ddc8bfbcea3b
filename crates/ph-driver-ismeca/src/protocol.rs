//! Ismeca framing and message contents.

use ph_core::FuncError;
use thiserror::Error;

pub const STX: char = '\u{02}';
pub const ETX: char = '\u{03}';
pub const ENQ: char = '\u{05}';
pub const ACK: char = '\u{06}';

/// Highest bin the handler sorts into.
pub const MAX_BIN: i64 = 31;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IsmecaError {
    #[error("expected {expected:?} from handler, received {received:?}")]
    Handshake { expected: char, received: String },

    #[error("reply {0:?} is not framed by STX and ETX")]
    Unframed(String),

    #[error("invalid site list {0:?} in CE reply")]
    BadSiteList(String),

    #[error(
        "the handler seems to present more devices than configured ({0:?}), \
         the driver configuration must be changed to support more sites"
    )]
    TooManySites(String),

    #[error("could not bin to bin index {bin}: {reason}")]
    BadBin { bin: i64, reason: String },
}

impl From<IsmecaError> for FuncError {
    fn from(err: IsmecaError) -> Self {
        match err {
            IsmecaError::Handshake { .. } | IsmecaError::Unframed(_) => FuncError::Waiting,
            IsmecaError::BadSiteList(_) => FuncError::Answer,
            IsmecaError::TooManySites(_) => FuncError::Fatal,
            IsmecaError::BadBin { .. } => FuncError::Binning,
        }
    }
}

/// `command` between STX and ETX.
pub fn framed(command: &str) -> String {
    format!("{STX}{command}{ETX}")
}

/// Payload of an STX/ETX framed reply.
pub fn unframe(reply: &str) -> Result<&str, IsmecaError> {
    reply
        .strip_prefix(STX)
        .and_then(|rest| rest.strip_suffix(ETX))
        .ok_or_else(|| IsmecaError::Unframed(reply.to_string()))
}

/// Check that a handshake reply starts with `expected`.
pub fn expect_control(reply: &str, expected: char) -> Result<(), IsmecaError> {
    if reply.starts_with(expected) {
        Ok(())
    } else {
        Err(IsmecaError::Handshake {
            expected,
            received: reply.to_string(),
        })
    }
}

/// Answer to the `CA` error request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaResponse {
    /// No error pending.
    Clear,
    /// Test site empty, no more product available.
    NoMoreProduct,
    /// The device cannot be put into the requested bin.
    CannotBin,
    Other(String),
}

impl CaResponse {
    pub fn parse(payload: &str) -> Self {
        match payload.chars().next() {
            None => CaResponse::Clear,
            Some('K') => CaResponse::NoMoreProduct,
            Some('J') => CaResponse::CannotBin,
            Some(_) => CaResponse::Other(payload.to_string()),
        }
    }
}

/// Parse the `CE` site list ("1,3") into pending flags. Site numbers are
/// 1-based.
pub fn parse_sites(payload: &str, sites: usize) -> Result<Vec<bool>, IsmecaError> {
    let mut pending = vec![false; sites];
    if payload.is_empty() {
        return Err(IsmecaError::BadSiteList(payload.to_string()));
    }
    let listed: Vec<&str> = payload.split(',').filter(|s| !s.is_empty()).collect();
    if listed.len() > sites {
        return Err(IsmecaError::TooManySites(payload.to_string()));
    }
    for item in listed {
        let site: usize = item
            .trim()
            .parse()
            .map_err(|_| IsmecaError::BadSiteList(payload.to_string()))?;
        match site.checked_sub(1).and_then(|i| pending.get_mut(i)) {
            Some(flag) => *flag = true,
            None if site == 0 => return Err(IsmecaError::BadSiteList(payload.to_string())),
            None => return Err(IsmecaError::TooManySites(payload.to_string())),
        }
    }
    Ok(pending)
}

/// Handler bin of SmarTest bin index `bin`. Configured handler bin ids must
/// name a bin between 0 and 31.
pub fn bin_number(bin: i64, bin_ids: &[String]) -> Result<i64, IsmecaError> {
    let number = if bin_ids.is_empty() {
        bin
    } else {
        let id = usize::try_from(bin)
            .ok()
            .and_then(|i| bin_ids.get(i))
            .ok_or_else(|| IsmecaError::BadBin {
                bin,
                reason: format!("{} handler bins configured", bin_ids.len()),
            })?;
        id.trim().parse().map_err(|_| IsmecaError::BadBin {
            bin,
            reason: format!("handler bin id {:?} is not a number", id),
        })?
    };
    if (0..=MAX_BIN).contains(&number) {
        Ok(number)
    } else {
        Err(IsmecaError::BadBin {
            bin,
            reason: format!("handler bin {} outside 0..={}", number, MAX_BIN),
        })
    }
}

/// Body of a `BA` command: `site,0,bin` per entry, separated by `;`.
/// Returns `None` when there is nothing to bin.
pub fn ba_command(entries: &[(&str, i64)]) -> Option<String> {
    if entries.is_empty() {
        return None;
    }
    let body: Vec<String> = entries
        .iter()
        .map(|(site, bin)| format!("{},0,{}", site, bin))
        .collect();
    Some(format!("BA{}", body.join(";")))
}
