//! H3570 message contents.

/// Bin code sent for a site without a device.
pub const NO_BINNING_RESULT: &str = "0";

/// Answer to `QUERY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryAnswer {
    /// `NO ACTION` or `BUSY`.
    Idle(String),
    StartLot,
    EndLot,
    /// `LOT_INFO ...`, informational only.
    LotInfo(String),
    /// `TEST 1,0,1,...` with one flag per handler site.
    Test(Vec<bool>),
    /// `TEST` without a site list.
    MalformedTest(String),
    Unknown(String),
}

impl QueryAnswer {
    /// Classify an answer, ignoring case.
    pub fn parse(answer: &str) -> Self {
        let upper = answer.trim().to_ascii_uppercase();
        match upper.as_str() {
            "NO ACTION" | "BUSY" => return QueryAnswer::Idle(upper),
            "START_LOT" => return QueryAnswer::StartLot,
            "END_LOT" => return QueryAnswer::EndLot,
            _ => {}
        }
        if upper.contains("LOT_INFO ") {
            return QueryAnswer::LotInfo(upper);
        }
        match upper.find("TEST ") {
            Some(at) => match upper[at + 5..].split_whitespace().next() {
                Some(sites) => QueryAnswer::Test(sites.split(',').map(|s| s == "1").collect()),
                None => QueryAnswer::MalformedTest(upper),
            },
            None => QueryAnswer::Unknown(upper),
        }
    }
}

/// Bin code for `bin`: the configured handler bin id, or the bin number.
pub fn bin_code(bin: i64, bin_ids: &[String]) -> Option<String> {
    if bin_ids.is_empty() {
        return Some(bin.to_string());
    }
    usize::try_from(bin)
        .ok()
        .and_then(|i| bin_ids.get(i))
        .cloned()
}

/// `RESULT` command with one code per handler site.
pub fn result_command(codes: &[String]) -> String {
    format!("RESULT {}", codes.join(","))
}

/// Command for a `set_status` key.
pub fn status_command(key: &str, value: &str) -> Option<String> {
    let command = match key.to_ascii_lowercase().as_str() {
        "socket_air_blow_on" => "SOCKET_AIR_BLOW_ON",
        "socket_air_blow_off" => "SOCKET_AIR_BLOW_OFF",
        _ => return None,
    };
    Some(format!("{}{}", command, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_answers() {
        assert_eq!(QueryAnswer::parse("no action"), QueryAnswer::Idle("NO ACTION".into()));
        assert_eq!(QueryAnswer::parse("BUSY"), QueryAnswer::Idle("BUSY".into()));
        assert_eq!(QueryAnswer::parse("Start_Lot"), QueryAnswer::StartLot);
        assert_eq!(QueryAnswer::parse("END_LOT"), QueryAnswer::EndLot);
        assert!(matches!(
            QueryAnswer::parse("LOT_INFO A123 500"),
            QueryAnswer::LotInfo(_)
        ));
        assert_eq!(
            QueryAnswer::parse("TEST 1,0,1,0"),
            QueryAnswer::Test(vec![true, false, true, false])
        );
        assert!(matches!(
            QueryAnswer::parse("TEST "),
            QueryAnswer::MalformedTest(_)
        ));
        assert_eq!(QueryAnswer::parse("HELLO"), QueryAnswer::Unknown("HELLO".into()));
    }

    #[test]
    fn bin_codes() {
        assert_eq!(bin_code(12, &[]).as_deref(), Some("12"));
        let ids = vec!["A".to_string(), "B".to_string()];
        assert_eq!(bin_code(1, &ids).as_deref(), Some("B"));
        assert_eq!(bin_code(2, &ids), None);
        assert_eq!(bin_code(-1, &ids), None);
        assert_eq!(
            result_command(&["1".into(), "0".into(), "3".into()]),
            "RESULT 1,0,3"
        );
    }

    #[test]
    fn status_commands() {
        assert_eq!(
            status_command("socket_air_blow_on", "").as_deref(),
            Some("SOCKET_AIR_BLOW_ON")
        );
        assert_eq!(
            status_command("SOCKET_AIR_BLOW_OFF", " 2").as_deref(),
            Some("SOCKET_AIR_BLOW_OFF 2")
        );
        assert_eq!(status_command("temperature", ""), None);
    }
}
