//! Normalization of raw source rows into summary and detail records.
//!
//! Source payloads are loosely typed key/value rows whose key names vary
//! between endpoints (`set11` vs `s11`, `game1` vs `point1`), so every lookup
//! goes through a list of fallbacks and every number is parsed leniently.

use crate::core::{
    CurrentUnit, DetailRecord, Participant, ScoreState, SummaryRecord, UnitScore,
};
use crate::lifecycle::status::StatusStrategy;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use std::sync::OnceLock;

/// Raw key/value row as delivered by the source.
pub type RawRow = JsonMap<String, JsonValue>;

/// Maximum number of sub-units a summary row can carry.
pub const MAX_UNITS: usize = 5;

const ENTRY_MARKERS: [&str; 2] = [" (Q)", " (WC)"];

fn rank_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"#(\d+)").expect("rank pattern is valid"))
}

/// Non-empty string value of `key`. Numbers are stringified.
pub fn field(row: &RawRow, key: &str) -> Option<String> {
    match row.get(key)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First non-empty value among `keys`.
pub fn field_any(row: &RawRow, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| field(row, key))
}

/// Lenient score parsing: `"7.5"` is 7, anything unparsable is 0.
pub fn parse_score(value: Option<&str>) -> u32 {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
        .map(|v| v.floor() as u32)
        .unwrap_or(0)
}

/// Parses a display name plus an origin string such as `"ESP #231"`.
pub fn parse_participant(name: &str, origin_info: &str) -> Participant {
    let mut clean = name.to_string();
    for marker in ENTRY_MARKERS {
        clean = clean.replace(marker, "");
    }
    let origin = origin_info
        .split_whitespace()
        .next()
        .filter(|token| !token.starts_with('#'))
        .map(str::to_string);
    let rank = rank_pattern()
        .captures(origin_info)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok());

    Participant {
        name: clean.trim().to_string(),
        origin,
        rank,
    }
}

/// Round name from a `"R32-$15000-10"` style descriptor.
pub fn parse_round(round: &str) -> Option<String> {
    round
        .split('-')
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Ordered sub-unit scores (`set{i}{side}` or `s{i}{side}`).
pub fn unit_scores(row: &RawRow) -> Vec<UnitScore> {
    (1..=MAX_UNITS)
        .map(|i| {
            let home = field_any(row, &[&format!("set{}1", i), &format!("s{}1", i)]);
            let away = field_any(row, &[&format!("set{}2", i), &format!("s{}2", i)]);
            UnitScore::new(parse_score(home.as_deref()), parse_score(away.as_deref()))
        })
        .collect()
}

pub fn current_unit(row: &RawRow) -> CurrentUnit {
    CurrentUnit {
        home: field_any(row, &["game1", "point1"]),
        away: field_any(row, &["game2", "point2"]),
    }
}

/// Maps one summary row. Rows without an id are dropped.
pub fn map_summary_row(row: &RawRow, status: &dyn StatusStrategy) -> Option<SummaryRecord> {
    let id = field(row, "id")?;
    let home = parse_participant(
        &field(row, "player1").unwrap_or_default(),
        &field(row, "country1").unwrap_or_default(),
    );
    let away = parse_participant(
        &field(row, "player2").unwrap_or_default(),
        &field(row, "country2").unwrap_or_default(),
    );
    let score = ScoreState {
        units: unit_scores(row),
        current: current_unit(row),
        status: status.determine(row),
    };
    Some(SummaryRecord::new(
        id,
        field(row, "tournament_name").unwrap_or_else(|| "N/A".to_string()),
        home,
        away,
        score,
    ))
}

/// Maps a detail payload of the form `{"match": {...}, "point_by_point": [...], "h2h": "..."}`.
pub fn map_detail(raw: &JsonValue) -> Option<DetailRecord> {
    let details = raw.get("match")?.as_object()?;

    let started_at = field(details, "starttime")
        .map(|s| parse_score(Some(&s)) as i64)
        .filter(|secs| *secs > 0)
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

    let timeline = raw
        .get("point_by_point")
        .and_then(JsonValue::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .map(|block| {
                    json!({
                        "unit": block.get("game_header").cloned().unwrap_or(json!("")),
                        "points": block.get("points_log").cloned().unwrap_or(json!([])),
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let head_to_head = raw
        .get("h2h")
        .and_then(JsonValue::as_str)
        .or_else(|| details.get("h2h").and_then(JsonValue::as_str))
        .map(parse_head_to_head)
        .unwrap_or_default();

    Some(DetailRecord {
        round: field(details, "round").and_then(|r| parse_round(&r)),
        venue: field(details, "court_name"),
        started_at,
        statistics: parse_statistics(
            &field_any(details, &["stats", "statistics"]).unwrap_or_default(),
        ),
        timeline: JsonValue::Array(timeline),
        head_to_head: JsonValue::Array(head_to_head),
    })
}

const STAT_NAMES: [&str; 11] = [
    "Aces",
    "Double Faults",
    "1st Serve",
    "1st Serve Points Won",
    "2nd Serve Points Won",
    "Break Points Saved",
    "Service Games Played",
    "1st Serve Return Points Won",
    "2nd Serve Return Points Won",
    "Break Points Converted",
    "Return Games Played",
];

/// Parses `"<header>/<home,...>/<away,...>"` into service and return groups.
pub fn parse_statistics(raw: &str) -> JsonValue {
    let mut parts = raw.split('/');
    let (Some(_), Some(home), Some(away), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return JsonValue::Array(Vec::new());
    };
    let home: Vec<&str> = home.split(',').collect();
    let away: Vec<&str> = away.split(',').collect();
    let pick = |values: &[&str], idx: usize| {
        values
            .get(idx)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .unwrap_or("0")
            .to_string()
    };

    let mut service = Vec::new();
    let mut returning = Vec::new();
    for (offset, name) in STAT_NAMES.iter().enumerate() {
        let idx = offset + 1;
        // The ace counter is packed into the home list for both sides.
        let (h, a) = if idx == 1 {
            (pick(&home, 1), pick(&home, 0))
        } else {
            (pick(&home, idx), pick(&away, idx))
        };
        let item = json!({ "name": name, "home": h, "away": a });
        let is_service = name.contains("Serve")
            || name.contains("Aces")
            || name.contains("Double")
            || name.contains("Games Played");
        if is_service && !name.contains("Return") {
            service.push(item);
        } else {
            returning.push(item);
        }
    }
    json!([
        { "groupName": "Service", "items": service },
        { "groupName": "Return", "items": returning },
    ])
}

/// Parses `#`-separated previous meetings with `/`-separated fields.
pub fn parse_head_to_head(raw: &str) -> Vec<JsonValue> {
    raw.split('#')
        .filter_map(|meeting| {
            let fields: Vec<&str> = meeting.split('/').collect();
            if fields.len() < 9 {
                return None;
            }
            let get = |idx: usize| {
                fields
                    .get(idx)
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(|s| JsonValue::String(s.to_string()))
                    .unwrap_or(JsonValue::Null)
            };
            Some(json!({
                "year": get(8),
                "event": get(5),
                "surface": get(7),
                "score": get(2),
            }))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EntityStatus;
    use crate::lifecycle::status::default_strategy;

    fn row(value: JsonValue) -> RawRow {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_parse_score_is_lenient() {
        assert_eq!(parse_score(Some("6")), 6);
        assert_eq!(parse_score(Some("7.5")), 7);
        assert_eq!(parse_score(Some("")), 0);
        assert_eq!(parse_score(Some("AD")), 0);
        assert_eq!(parse_score(Some("-3")), 0);
        assert_eq!(parse_score(None), 0);
    }

    #[test]
    fn test_parse_participant() {
        let p = parse_participant("Jane Doe (Q)", "USA #231");
        assert_eq!(p.name, "Jane Doe");
        assert_eq!(p.origin.as_deref(), Some("USA"));
        assert_eq!(p.rank, Some(231));

        let unranked = parse_participant("John Roe (WC)", "");
        assert_eq!(unranked.name, "John Roe");
        assert_eq!(unranked.origin, None);
        assert_eq!(unranked.rank, None);
    }

    #[test]
    fn test_parse_round() {
        assert_eq!(parse_round("R32-$15000-10").as_deref(), Some("R32"));
        assert_eq!(parse_round(""), None);
    }

    #[test]
    fn test_unit_scores_use_fallback_keys() {
        let r = row(json!({ "set11": "6", "s12": "4", "s21": 3, "set22": "2" }));
        let units = unit_scores(&r);
        assert_eq!(units.len(), MAX_UNITS);
        assert_eq!(units[0], UnitScore::new(6, 4));
        assert_eq!(units[1], UnitScore::new(3, 2));
        assert!(units[2].is_blank());
    }

    #[test]
    fn test_map_summary_row() {
        let r = row(json!({
            "id": "9876",
            "tournament_name": "ITF W15 Monastir",
            "player1": "A. Alpha",
            "country1": "TUN #512",
            "player2": "B. Beta (Q)",
            "country2": "FRA",
            "set11": "6", "set12": "4",
            "set21": "2", "set22": "1",
            "point1": "30", "point2": "15",
        }));
        let record = map_summary_row(&r, default_strategy().as_ref()).unwrap();
        assert_eq!(record.id, "9876");
        assert_eq!(record.group_name, "ITF W15 Monastir");
        assert_eq!(record.participants[1].name, "B. Beta");
        assert_eq!(record.participants[0].rank, Some(512));
        assert_eq!(record.score.current.home.as_deref(), Some("30"));
        assert_eq!(record.score.status, EntityStatus::Live);
    }

    #[test]
    fn test_map_summary_row_requires_id() {
        let r = row(json!({ "player1": "A", "player2": "B" }));
        assert!(map_summary_row(&r, default_strategy().as_ref()).is_none());
    }

    #[test]
    fn test_map_detail() {
        let raw = json!({
            "match": {
                "round": "QF-$25000-35",
                "court_name": "Court 3",
                "starttime": "1717236000",
                "stats": "x/3,5,60,70,50,2,8,30,40,1,8/0,2,55,65,45,3,8,25,35,2,8",
            },
            "point_by_point": [ { "game_header": "1-0", "points_log": ["15-0", "30-0"] } ],
            "h2h": "a/b/6-4 6-3/c/d/W15 Antalya/e/Clay/2023",
        });
        let detail = map_detail(&raw).unwrap();
        assert_eq!(detail.round.as_deref(), Some("QF"));
        assert_eq!(detail.venue.as_deref(), Some("Court 3"));
        assert_eq!(detail.started_at.unwrap().timestamp(), 1_717_236_000);
        assert_eq!(detail.timeline.as_array().unwrap().len(), 1);
        assert_eq!(detail.head_to_head[0]["surface"], "Clay");
        assert_eq!(detail.statistics[0]["groupName"], "Service");
        assert_eq!(detail.statistics[0]["items"][0]["name"], "Aces");
        assert_eq!(detail.statistics[0]["items"][0]["home"], "5");
    }

    #[test]
    fn test_map_detail_requires_match_block() {
        assert!(map_detail(&json!({ "other": {} })).is_none());
    }

    #[test]
    fn test_parse_statistics_rejects_malformed() {
        assert_eq!(parse_statistics(""), json!([]));
        assert_eq!(parse_statistics("only/two"), json!([]));
    }
}
