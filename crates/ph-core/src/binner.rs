//! SmarTest bin to handler bin mapping.
//!
//! Every SmarTest bin (a hard bin number or a soft bin code) owns a sorter:
//! the list of handler bin indices it may go to. Successive devices of the
//! same SmarTest bin are distributed round robin over that list. The retest
//! bin is the hard bin number `-1`.

use crate::config::{BinMappingMode, HandlerConfig};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Longest soft bin code accepted in `softbin_to_handler_bin_map`.
pub const MAX_SOFTBIN_CODE_LEN: usize = 7;

/// Key of a sorter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BinKey {
    Number(i64),
    Code(String),
}

impl BinKey {
    /// The SmarTest retest bin.
    pub const RETEST: BinKey = BinKey::Number(-1);
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BinError {
    /// A SmarTest bin was entered more often than there are handler bins.
    #[error("too many handler bins entered for SmarTest bin {0:?} ({1} handler bins)")]
    SorterFull(BinKey, usize),

    #[error("{0}")]
    Config(String),
}

#[derive(Debug, Clone, Default)]
struct Sorter {
    bins: Vec<i64>,
    next_use: usize,
}

/// Round robin map from SmarTest bins to handler bin indices.
#[derive(Debug, Clone, Default)]
pub struct BinMap {
    sorters: HashMap<BinKey, Sorter>,
    handler_bins: usize,
}

impl BinMap {
    pub fn new(handler_bins: usize) -> Self {
        Self {
            sorters: HashMap::new(),
            handler_bins,
        }
    }

    /// Add `handler_bin` to the sorter of `key`.
    pub fn enter(&mut self, key: BinKey, handler_bin: i64) -> Result<(), BinError> {
        let limit = self.handler_bins;
        let sorter = self.sorters.entry(key.clone()).or_default();
        if sorter.bins.len() >= limit {
            return Err(BinError::SorterFull(key, limit));
        }
        sorter.bins.push(handler_bin);
        Ok(())
    }

    /// Next handler bin for `key`, or `None` if `key` is unknown.
    pub fn map(&mut self, key: &BinKey) -> Option<i64> {
        let sorter = self.sorters.get_mut(key)?;
        let bin = *sorter.bins.get(sorter.next_use)?;
        sorter.next_use += 1;
        if sorter.next_use >= sorter.bins.len() {
            sorter.next_use = 0;
        }
        Some(bin)
    }

    pub fn contains(&self, key: &BinKey) -> bool {
        self.sorters.contains_key(key)
    }
}

/// Handler bin chosen for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinChoice {
    /// Regular mapping.
    Mapped(i64),
    /// The SmarTest bin was not configured; the retest bin is used instead.
    Retest(i64),
    /// No handler bin could be determined. The device gets bin `-1` and the
    /// condition counts as a binning panic.
    Unmapped,
}

impl BinChoice {
    /// Handler bin to send, `-1` when unmapped.
    pub fn bin(self) -> i64 {
        match self {
            BinChoice::Mapped(b) | BinChoice::Retest(b) => b,
            BinChoice::Unmapped => -1,
        }
    }
}

/// Bin mapping of one driver configuration.
#[derive(Debug, Clone, Default)]
pub struct BinMapping {
    mode: BinMappingMode,
    map: Option<BinMap>,
    retest_defined: bool,
}

impl BinMapping {
    /// Build the mapping from `bin_mapping`, `handler_bin_ids`,
    /// `handler_retest_bins` and the hard/soft bin maps.
    pub fn from_config(config: &HandlerConfig) -> Result<Self, BinError> {
        let mode = config.bin_mapping;
        let ids_given = config.handler_bin_ids.len();
        let mut handler_bins = ids_given;

        if ids_given == 0 && mode != BinMappingMode::Default {
            return Err(BinError::Config(format!(
                "handler_bin_ids must be given if bin_mapping is {:?}",
                mode
            )));
        }

        let retest_defined = !config.handler_retest_bins.is_empty();
        for &bin in &config.handler_retest_bins {
            if ids_given > 0 {
                if bin < 0 || bin as usize >= ids_given {
                    return Err(BinError::Config(format!(
                        "handler bin {} in handler_retest_bins out of range for handler_bin_ids",
                        bin
                    )));
                }
            } else if bin >= 0 && bin as usize >= handler_bins {
                handler_bins = bin as usize + 1;
            }
        }

        let mut map = (handler_bins != 0).then(|| BinMap::new(handler_bins));

        if let Some(map) = map.as_mut() {
            for &bin in &config.handler_retest_bins {
                map.enter(BinKey::RETEST, bin)?;
            }
        }

        if !config.hardbin_to_handler_bin_map.is_empty() {
            if mode != BinMappingMode::MappedHardbins {
                warn!("hardbin_to_handler_bin_map ignored, bin_mapping is {:?}", mode);
            } else {
                if config.hardbin_to_handler_bin_map.len() != ids_given {
                    return Err(BinError::Config(format!(
                        "hardbin_to_handler_bin_map must be a list of {} lists, following handler_bin_ids",
                        ids_given
                    )));
                }
                let map = map.get_or_insert_with(|| BinMap::new(handler_bins));
                for (handler_bin, hardbins) in config.hardbin_to_handler_bin_map.iter().enumerate() {
                    for &hardbin in hardbins {
                        map.enter(BinKey::Number(hardbin), handler_bin as i64)?;
                    }
                }
            }
        }

        if !config.softbin_to_handler_bin_map.is_empty() {
            if mode != BinMappingMode::MappedSoftbins {
                warn!("softbin_to_handler_bin_map ignored, bin_mapping is {:?}", mode);
            } else {
                if config.softbin_to_handler_bin_map.len() != ids_given {
                    return Err(BinError::Config(format!(
                        "softbin_to_handler_bin_map must be a list of {} lists, following handler_bin_ids",
                        ids_given
                    )));
                }
                let map = map.get_or_insert_with(|| BinMap::new(handler_bins));
                for (handler_bin, codes) in config.softbin_to_handler_bin_map.iter().enumerate() {
                    for code in codes {
                        if code.len() > MAX_SOFTBIN_CODE_LEN {
                            return Err(BinError::Config(format!(
                                "entries in softbin_to_handler_bin_map are restricted to {} characters",
                                MAX_SOFTBIN_CODE_LEN
                            )));
                        }
                        map.enter(BinKey::Code(code.clone()), handler_bin as i64)?;
                    }
                }
            }
        }

        debug!(?mode, handler_bins, retest_defined, "bin mapping configured");
        Ok(Self {
            mode,
            map,
            retest_defined,
        })
    }

    pub fn mode(&self) -> BinMappingMode {
        self.mode
    }

    pub fn retest_defined(&self) -> bool {
        self.retest_defined
    }

    /// Next retest bin, if retest bins are configured.
    pub fn retest_bin(&mut self) -> Option<i64> {
        self.map.as_mut()?.map(&BinKey::RETEST)
    }

    /// Handler bin for a tested device with SmarTest hard bin `number` and
    /// soft bin `code`.
    pub fn choose(&mut self, number: i64, code: &str) -> BinChoice {
        match self.mode {
            BinMappingMode::Default => {
                if number != -1 {
                    BinChoice::Mapped(number)
                } else if self.retest_defined {
                    match self.retest_bin() {
                        Some(bin) => BinChoice::Mapped(bin),
                        None => {
                            error!("SmarTest retest bin can not be remapped to a handler bin");
                            BinChoice::Unmapped
                        }
                    }
                } else {
                    BinChoice::Mapped(-1)
                }
            }
            BinMappingMode::MappedHardbins => {
                self.with_retest_fallback(BinKey::Number(number), "hardbin_to_handler_bin_map")
            }
            BinMappingMode::MappedSoftbins => {
                self.with_retest_fallback(BinKey::Code(code.to_string()), "softbin_to_handler_bin_map")
            }
        }
    }

    fn with_retest_fallback(&mut self, key: BinKey, map_name: &str) -> BinChoice {
        let Some(map) = self.map.as_mut() else {
            return BinChoice::Unmapped;
        };
        if let Some(bin) = map.map(&key) {
            return BinChoice::Mapped(bin);
        }
        match map.map(&BinKey::RETEST) {
            Some(bin) => {
                warn!(
                    "SmarTest bin {:?} not found in {}, using retest bin from handler_retest_bins",
                    key, map_name
                );
                BinChoice::Retest(bin)
            }
            None => {
                error!(
                    "SmarTest bin {:?} not found in {} and handler_retest_bins not configured",
                    key, map_name
                );
                BinChoice::Unmapped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(toml_text: &str) -> HandlerConfig {
        let mut text = String::from("handler_site_ids = [\"1\"]\n");
        text.push_str(toml_text);
        HandlerConfig::from_toml_str(&text).unwrap()
    }

    #[test]
    fn sorter_is_round_robin_and_bounded() {
        let mut map = BinMap::new(2);
        map.enter(BinKey::Number(1), 0).unwrap();
        map.enter(BinKey::Number(1), 1).unwrap();
        assert_eq!(
            map.enter(BinKey::Number(1), 1),
            Err(BinError::SorterFull(BinKey::Number(1), 2))
        );
        assert_eq!(map.map(&BinKey::Number(1)), Some(0));
        assert_eq!(map.map(&BinKey::Number(1)), Some(1));
        assert_eq!(map.map(&BinKey::Number(1)), Some(0));
        assert_eq!(map.map(&BinKey::Number(7)), None);
    }

    #[test]
    fn default_mode_passes_numbers_through() {
        let mut m = BinMapping::from_config(&config("")).unwrap();
        assert_eq!(m.choose(5, "x"), BinChoice::Mapped(5));
        assert_eq!(m.choose(-1, "x"), BinChoice::Mapped(-1));
    }

    #[test]
    fn default_mode_remaps_retest() {
        let mut m = BinMapping::from_config(&config("handler_retest_bins = [3, 4]")).unwrap();
        assert_eq!(m.choose(-1, ""), BinChoice::Mapped(3));
        assert_eq!(m.choose(-1, ""), BinChoice::Mapped(4));
        assert_eq!(m.choose(2, ""), BinChoice::Mapped(2));
    }

    #[test]
    fn hardbin_mapping_with_retest_fallback() {
        let mut m = BinMapping::from_config(&config(
            r#"
            bin_mapping = "mapped-hardbins"
            handler_bin_ids = ["A", "B", "C"]
            hardbin_to_handler_bin_map = [[1, 2], [3], []]
            handler_retest_bins = [2]
            "#,
        ))
        .unwrap();
        assert_eq!(m.choose(2, ""), BinChoice::Mapped(0));
        assert_eq!(m.choose(3, ""), BinChoice::Mapped(1));
        assert_eq!(m.choose(99, ""), BinChoice::Retest(2));
    }

    #[test]
    fn softbin_mapping_without_retest_is_unmapped() {
        let mut m = BinMapping::from_config(&config(
            r#"
            bin_mapping = "mapped-softbins"
            handler_bin_ids = ["GOOD", "BAD"]
            softbin_to_handler_bin_map = [["pass"], ["fail", "open"]]
            "#,
        ))
        .unwrap();
        assert_eq!(m.choose(0, "open"), BinChoice::Mapped(1));
        assert_eq!(m.choose(0, "short"), BinChoice::Unmapped);
        assert_eq!(BinChoice::Unmapped.bin(), -1);
    }

    #[test]
    fn retest_bin_out_of_range_is_rejected() {
        let err = BinMapping::from_config(&config(
            r#"
            handler_bin_ids = ["A"]
            handler_retest_bins = [1]
            "#,
        ))
        .unwrap_err();
        assert!(matches!(err, BinError::Config(_)));
    }

    #[test]
    fn long_softbin_codes_are_rejected() {
        let err = BinMapping::from_config(&config(
            r#"
            bin_mapping = "mapped-softbins"
            handler_bin_ids = ["A"]
            softbin_to_handler_bin_map = [["waytoolong"]]
            "#,
        ))
        .unwrap_err();
        assert!(err.to_string().contains("restricted"));
    }
}
