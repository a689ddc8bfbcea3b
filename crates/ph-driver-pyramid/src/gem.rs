//! GEM messages exchanged with the Pyramid handler.
//!
//! The handler reports events with `S6F11` (or `S6F13`) as
//! `L[DATAID, CEID, L[report...]]`, each report being
//! `L[RPTID, L[L[VID, value]...]]`. The report layout is the one the
//! driver defines during communication setup, see [`define_reports`].

use crate::secs::Item;

/// Collection event ids.
pub mod ceid {
    pub const LOT_LOADED: u32 = 8011;
    pub const LOT_STARTED: u32 = 8012;
    pub const LOT_TEST_COMPLETE: u32 = 8021;
    pub const DEVICE_READY: u32 = 8300;
    pub const PROCESS_STATE: u32 = 4050;
    pub const SORTING_COMPLETE: u32 = 8008;
}

/// Variable ids.
pub mod vid {
    pub const SITE_INFO: u32 = 10095;
    pub const BARCODE: u32 = 10145;
    pub const PROCESS_STATE: u32 = 810;
}

/// Values of the handler status variable.
pub mod process {
    /// Stopped, needs a `START` remote command.
    pub const WAITING_FOR_START: i64 = 65;
    pub const STOPPED: i64 = 81;
    pub const READY: i64 = 85;
}

/// HCACK of a remote command with an invalid parameter.
pub const HCACK_BAD_PARAMETER: i64 = 3;

const PROCESS_REPORT: u32 = 8;

/// Report carrying the bin tray labels (`12xxx`) and their device counts
/// (`11xxx`, the label id minus 1000).
const SORTING_REPORT: u32 = 10;
const LABEL_TO_COUNT: u32 = 1000;

/// An `S6F11`/`S6F13` event report.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub ceid: u32,
    /// `(report id, [(variable id, value)])`
    pub reports: Vec<(u32, Vec<(u32, Item)>)>,
}

impl Event {
    /// Parse an event body. `None` when the layout is not an event report.
    pub fn parse(body: &Item) -> Option<Self> {
        let ceid = u32::try_from(body.get(1)?.as_i64()?).ok()?;
        let mut reports = Vec::new();
        for report in body.get(2).and_then(Item::as_list).unwrap_or_default() {
            let Some(rptid) = report.get(0).and_then(Item::as_i64) else {
                continue;
            };
            let variables = report
                .get(1)
                .and_then(Item::as_list)
                .unwrap_or_default()
                .iter()
                .filter_map(|pair| {
                    let vid = pair.get(0)?.as_i64()?;
                    Some((u32::try_from(vid).ok()?, pair.get(1)?.clone()))
                })
                .collect();
            reports.push((u32::try_from(rptid).unwrap_or_default(), variables));
        }
        Some(Self { ceid, reports })
    }

    /// First value reported for `vid`.
    pub fn variable(&self, vid: u32) -> Option<&Item> {
        self.reports
            .iter()
            .flat_map(|(_, variables)| variables.iter())
            .find(|(id, _)| *id == vid)
            .map(|(_, value)| value)
    }

    /// Device presence per handler site, from the site info variable.
    pub fn site_flags(&self) -> Vec<bool> {
        self.variable(vid::SITE_INFO)
            .map(|value| match value {
                Item::List(sites) => sites
                    .iter()
                    .map(|site| site.as_i64().unwrap_or(0) > 0)
                    .collect(),
                other => other.integers().into_iter().map(|v| v > 0).collect(),
            })
            .unwrap_or_default()
    }

    /// Comma separated barcodes for the first `sites` sites; a site without
    /// a barcode reads `0`.
    pub fn barcodes(&self, sites: usize) -> Option<String> {
        let Some(Item::List(values)) = self.variable(vid::BARCODE) else {
            return None;
        };
        let codes: Vec<&str> = (0..sites)
            .map(|k| {
                values
                    .get(k)
                    .and_then(Item::as_ascii)
                    .filter(|code| !code.is_empty())
                    .unwrap_or("0")
            })
            .collect();
        Some(codes.join(","))
    }

    /// Devices waiting in the bin tray labelled `label`, from a sorting
    /// complete event. `None` when no tray carries that label.
    pub fn retest_count(&self, label: &str) -> Option<i64> {
        let variables = self
            .reports
            .iter()
            .find(|(rptid, _)| *rptid == SORTING_REPORT)
            .map(|(_, variables)| variables)?;
        let label_vid = variables.iter().find_map(|(id, value)| {
            (*id > 12000 && value.as_ascii() == Some(label)).then_some(*id)
        })?;
        variables
            .iter()
            .find(|(id, _)| *id == label_vid - LABEL_TO_COUNT)
            .and_then(|(_, value)| value.as_i64())
    }

    /// Process state event announcing the handler is ready.
    pub fn is_process_ready(&self) -> bool {
        self.ceid == ceid::PROCESS_STATE
            && self.reports.iter().any(|(rptid, variables)| {
                *rptid == PROCESS_REPORT
                    && variables.iter().any(|(id, value)| {
                        *id == vid::PROCESS_STATE && value.as_i64() == Some(process::READY)
                    })
            })
    }
}

/// `S2F41` remote command body `L[A rcmd, L[L[A name, value]...]]`.
pub fn remote_command(rcmd: &str, params: Vec<(&str, Item)>) -> Item {
    Item::list([
        Item::ascii(rcmd),
        Item::list(
            params
                .into_iter()
                .map(|(name, value)| Item::list([Item::ascii(name), value])),
        ),
    ])
}

/// `BIN_UNITS` remote command with one bin per handler site.
pub fn bin_units(bins: &[u32]) -> Item {
    remote_command(
        "BIN_UNITS",
        vec![("BINS", Item::list(bins.iter().map(|&bin| Item::u4(bin))))],
    )
}

/// `START` remote command.
pub fn start() -> Item {
    remote_command("START", Vec::new())
}

/// First acknowledge code in a reply body: the item itself, or the first
/// element of a list.
pub fn ack_code(body: Option<&Item>) -> Option<i64> {
    match body? {
        Item::List(items) => items.first()?.as_i64(),
        other => other.as_i64(),
    }
}

/// `S1F13` establish communication.
pub fn establish_communication() -> Item {
    Item::list([])
}

/// `S1F17` request online.
pub fn request_online() -> Item {
    Item::list([])
}

/// `S6F23` purge spooled data.
pub fn purge_spool() -> Item {
    Item::u1(1)
}

/// `S2F43` reset spooling.
pub fn reset_spooling() -> Item {
    Item::list([])
}

/// `S2F37` enable or disable the events the driver listens to.
pub fn enable_events(enable: bool) -> Item {
    Item::list([
        Item::boolean(enable),
        u4_list([
            ceid::LOT_STARTED,
            ceid::DEVICE_READY,
            ceid::LOT_TEST_COMPLETE,
            ceid::PROCESS_STATE,
            ceid::SORTING_COMPLETE,
        ]),
    ])
}

/// `S2F33` deleting every report definition.
pub fn delete_reports() -> Item {
    Item::list([Item::u4(1), Item::list([])])
}

fn u4_list(values: impl IntoIterator<Item = u32>) -> Item {
    Item::list(values.into_iter().map(Item::u4))
}

fn report(rptid: u32, vids: impl IntoIterator<Item = u32>) -> Item {
    Item::list([Item::u4(rptid), u4_list(vids)])
}

/// `S2F33` report definitions.
pub fn define_reports() -> Item {
    let counters = (12010..=12080).step_by(10).chain((11010..=11080).step_by(10));
    Item::list([
        Item::u4(3),
        Item::list([
            report(2, [10185]),
            report(4, [10180]),
            report(6, [vid::SITE_INFO, vid::BARCODE, 10165, 10125]),
            report(PROCESS_REPORT, [800, vid::PROCESS_STATE]),
            report(SORTING_REPORT, counters),
        ]),
    ])
}

/// `S2F35` linking reports to events.
pub fn link_reports() -> Item {
    Item::list([
        Item::u4(5),
        Item::list([
            report(ceid::LOT_STARTED, [4]),
            report(ceid::DEVICE_READY, [6]),
            report(ceid::LOT_TEST_COMPLETE, [4]),
            report(ceid::PROCESS_STATE, [PROCESS_REPORT]),
            report(ceid::SORTING_COMPLETE, [SORTING_REPORT]),
        ]),
    ])
}

/// `S1F3` selected status request for the handler status.
pub fn status_request() -> Item {
    Item::list([Item::u4(vid::PROCESS_STATE)])
}

/// `S6F12`/`S6F14` event acknowledge.
pub fn event_ack() -> Item {
    Item::binary(0)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Device ready event as the handler reports it.
    pub fn device_ready(sites: &[u8], barcodes: &[&str]) -> Item {
        Item::list([
            Item::u4(1),
            Item::u4(ceid::DEVICE_READY),
            Item::list([Item::list([
                Item::u4(6),
                Item::list([
                    Item::list([
                        Item::u4(vid::SITE_INFO),
                        Item::list(sites.iter().map(|&s| Item::u1(s))),
                    ]),
                    Item::list([
                        Item::u4(vid::BARCODE),
                        Item::list(barcodes.iter().map(|&b| Item::ascii(b))),
                    ]),
                ]),
            ])]),
        ])
    }

    pub fn process_state(state: u32) -> Item {
        Item::list([
            Item::u4(2),
            Item::u4(ceid::PROCESS_STATE),
            Item::list([Item::list([
                Item::u4(PROCESS_REPORT),
                Item::list([
                    Item::list([Item::u4(800), Item::u4(0)]),
                    Item::list([Item::u4(vid::PROCESS_STATE), Item::u4(state)]),
                ]),
            ])]),
        ])
    }

    /// Sorting complete event with one label and count per bin tray.
    pub fn sorting_complete(trays: &[(&str, u32)]) -> Item {
        let labels = trays.iter().enumerate().map(|(i, (label, _))| {
            Item::list([Item::u4(12010 + 10 * i as u32), Item::ascii(*label)])
        });
        let counts = trays.iter().enumerate().map(|(i, (_, count))| {
            Item::list([Item::u4(11010 + 10 * i as u32), Item::u4(*count)])
        });
        Item::list([
            Item::u4(4),
            Item::u4(ceid::SORTING_COMPLETE),
            Item::list([Item::list([
                Item::u4(SORTING_REPORT),
                Item::list(labels.chain(counts)),
            ])]),
        ])
    }

    pub fn plain(ceid: u32) -> Item {
        Item::list([Item::u4(3), Item::u4(ceid), Item::list([])])
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn device_ready_event() {
        let event = Event::parse(&device_ready(&[1, 0, 2, 0], &["A1", "", "C3", ""])).unwrap();
        assert_eq!(event.ceid, ceid::DEVICE_READY);
        assert_eq!(event.site_flags(), vec![true, false, true, false]);
        assert_eq!(event.barcodes(4).as_deref(), Some("A1,0,C3,0"));
        assert_eq!(event.barcodes(2).as_deref(), Some("A1,0"));
    }

    #[test]
    fn site_info_as_array() {
        let body = Item::list([
            Item::u4(1),
            Item::u4(ceid::DEVICE_READY),
            Item::list([Item::list([
                Item::u4(6),
                Item::list([Item::list([
                    Item::u4(vid::SITE_INFO),
                    Item::U1(vec![0, 1]),
                ])]),
            ])]),
        ]);
        let event = Event::parse(&body).unwrap();
        assert_eq!(event.site_flags(), vec![false, true]);
        assert_eq!(event.barcodes(2), None);
    }

    #[test]
    fn process_state_events() {
        assert!(Event::parse(&process_state(85)).unwrap().is_process_ready());
        assert!(!Event::parse(&process_state(81)).unwrap().is_process_ready());
        assert!(!Event::parse(&plain(ceid::LOT_LOADED)).unwrap().is_process_ready());
        assert_eq!(Event::parse(&Item::ascii("nope")), None);
    }

    #[test]
    fn retest_counts_by_label() {
        let event =
            Event::parse(&sorting_complete(&[("BIN3", 0), ("BIN5", 4), ("BIN7", 2)])).unwrap();
        assert_eq!(event.retest_count("BIN5"), Some(4));
        assert_eq!(event.retest_count("BIN3"), Some(0));
        assert_eq!(event.retest_count("BIN9"), None);
        assert_eq!(
            Event::parse(&plain(ceid::SORTING_COMPLETE))
                .unwrap()
                .retest_count("BIN5"),
            None
        );
    }

    #[test]
    fn setup_messages() {
        let define = define_reports();
        let reports = define.get(1).and_then(Item::as_list).unwrap();
        assert_eq!(reports.len(), 5);
        assert_eq!(reports[4].get(1).and_then(Item::as_list).map(<[Item]>::len), Some(16));
        let bytes = reports[2].to_bytes().unwrap();
        assert_eq!(&bytes[..10], &[0x01, 0x02, 0xB1, 0x04, 0, 0, 0, 6, 0x01, 0x04]);

        let enable = enable_events(true);
        assert_eq!(enable.get(0), Some(&Item::boolean(true)));
        assert_eq!(enable.get(1).and_then(Item::as_list).map(<[Item]>::len), Some(5));
    }

    #[test]
    fn remote_commands() {
        let cmd = remote_command("LOT_START", vec![("LOT_ID", Item::ascii("L1"))]);
        assert_eq!(cmd.get(0).and_then(Item::as_ascii), Some("LOT_START"));
        let param = cmd.get(1).and_then(|p| p.get(0)).unwrap();
        assert_eq!(param.get(0).and_then(Item::as_ascii), Some("LOT_ID"));
        assert_eq!(param.get(1).and_then(Item::as_ascii), Some("L1"));

        let bins = bin_units(&[1, 0]);
        assert_eq!(bins.get(0).and_then(Item::as_ascii), Some("BIN_UNITS"));
        assert_eq!(
            bins.get(1).and_then(|p| p.get(0)).and_then(|p| p.get(1)),
            Some(&Item::list([Item::u4(1), Item::u4(0)]))
        );
        assert_eq!(ack_code(Some(&Item::list([Item::binary(0)]))), Some(0));
        assert_eq!(ack_code(Some(&Item::binary(2))), Some(2));
        assert_eq!(ack_code(None), None);
    }
}
