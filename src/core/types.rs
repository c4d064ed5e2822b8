use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a tracked entity is still in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityStatus {
    #[default]
    Live,
    Completed,
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityStatus::Live => write!(f, "LIVE"),
            EntityStatus::Completed => write!(f, "COMPLETED"),
        }
    }
}

/// One side of a live entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Participant {
    pub name: String,
    pub origin: Option<String>,
    pub rank: Option<u32>,
}

impl Participant {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origin: None,
            rank: None,
        }
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn rank(mut self, rank: u32) -> Self {
        self.rank = Some(rank);
        self
    }
}

/// Score of one completed or in-progress sub-unit (set, period, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct UnitScore {
    pub home: u32,
    pub away: u32,
}

impl UnitScore {
    pub fn new(home: u32, away: u32) -> Self {
        Self { home, away }
    }

    pub fn is_blank(&self) -> bool {
        self.home == 0 && self.away == 0
    }
}

/// Score inside the current unit. Values are kept verbatim ("15", "AD", ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct CurrentUnit {
    pub home: Option<String>,
    pub away: Option<String>,
}

impl CurrentUnit {
    pub fn new(home: impl Into<String>, away: impl Into<String>) -> Self {
        Self {
            home: Some(home.into()),
            away: Some(away.into()),
        }
    }
}

/// Change-detection digest of the score-relevant fields of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScoreFingerprint(String);

impl ScoreFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScoreFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScoreState {
    pub units: Vec<UnitScore>,
    pub current: CurrentUnit,
    pub status: EntityStatus,
}

impl ScoreState {
    /// Digest of the ordered sub-scores and the current-unit score.
    ///
    /// Status, timestamps and metadata are deliberately left out.
    pub fn fingerprint(&self) -> ScoreFingerprint {
        let units = self
            .units
            .iter()
            .map(|unit| format!("{}-{}", unit.home, unit.away))
            .collect::<Vec<_>>()
            .join(",");
        let home = self.current.home.as_deref().unwrap_or("-");
        let away = self.current.away.as_deref().unwrap_or("-");
        ScoreFingerprint(format!("{}|{}-{}", units, home, away))
    }

    /// Human-readable score, skipping untouched units.
    pub fn display_line(&self) -> String {
        let units = self
            .units
            .iter()
            .filter(|unit| !unit.is_blank())
            .map(|unit| format!("{}-{}", unit.home, unit.away))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "{} ({}-{})",
            units,
            self.current.home.as_deref().unwrap_or("0"),
            self.current.away.as_deref().unwrap_or("0")
        )
        .trim_start()
        .to_string()
    }
}

/// Lightweight per-cycle view of a live entity returned by the source summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRecord {
    pub id: String,
    pub group_name: String,
    pub participants: Vec<Participant>,
    pub score: ScoreState,
}

impl SummaryRecord {
    pub fn new(
        id: impl Into<String>,
        group_name: impl Into<String>,
        home: Participant,
        away: Participant,
        score: ScoreState,
    ) -> Self {
        Self {
            id: id.into(),
            group_name: group_name.into(),
            participants: vec![home, away],
            score,
        }
    }
}

/// Enrichment data fetched for one entity on the slow lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DetailRecord {
    pub round: Option<String>,
    pub venue: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub statistics: serde_json::Value,
    #[serde(default)]
    pub timeline: serde_json::Value,
    #[serde(default)]
    pub head_to_head: serde_json::Value,
}

/// The unit of tracking held in the active store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveEntity {
    pub id: String,
    pub group_name: String,
    pub participants: Vec<Participant>,
    pub score: ScoreState,
    pub last_observed_at: DateTime<Utc>,
    pub has_detail: bool,
    pub detail_refreshed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub detail: Option<DetailRecord>,
}

impl LiveEntity {
    /// Builds a fresh, not yet enriched entity from a summary record.
    pub fn from_summary(record: SummaryRecord, observed_at: DateTime<Utc>) -> Self {
        Self {
            id: record.id,
            group_name: record.group_name,
            participants: record.participants,
            score: record.score,
            last_observed_at: observed_at,
            has_detail: false,
            detail_refreshed_at: None,
            detail: None,
        }
    }

    /// Overwrites the fast-lane fields, leaving enrichment untouched.
    pub fn apply_summary(&mut self, record: SummaryRecord, observed_at: DateTime<Utc>) {
        self.group_name = record.group_name;
        self.participants = record.participants;
        self.score = record.score;
        if observed_at > self.last_observed_at {
            self.last_observed_at = observed_at;
        }
    }

    /// Attaches enrichment data, leaving the live score untouched.
    pub fn apply_detail(&mut self, detail: DetailRecord, refreshed_at: DateTime<Utc>) {
        self.detail = Some(detail);
        self.has_detail = true;
        self.detail_refreshed_at = Some(refreshed_at);
        if refreshed_at > self.last_observed_at {
            self.last_observed_at = refreshed_at;
        }
    }

    pub fn is_live(&self) -> bool {
        self.score.status == EntityStatus::Live
    }

    /// "Home vs Away" label used in alerts and logs.
    pub fn matchup(&self) -> String {
        let name = |idx: usize| {
            self.participants
                .get(idx)
                .map(|p| p.name.as_str())
                .unwrap_or("?")
                .to_string()
        };
        format!("{} vs {}", name(0), name(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn score(units: &[(u32, u32)], home: &str, away: &str) -> ScoreState {
        ScoreState {
            units: units.iter().map(|(h, a)| UnitScore::new(*h, *a)).collect(),
            current: CurrentUnit::new(home, away),
            status: EntityStatus::Live,
        }
    }

    #[test]
    fn test_fingerprint_ignores_status() {
        let live = score(&[(6, 4), (2, 3)], "15", "30");
        let mut done = live.clone();
        done.status = EntityStatus::Completed;
        assert_eq!(live.fingerprint(), done.fingerprint());
        assert_eq!(live.fingerprint().as_str(), "6-4,2-3|15-30");
    }

    #[test]
    fn test_fingerprint_tracks_current_unit() {
        let a = score(&[(6, 4)], "15", "30");
        let b = score(&[(6, 4)], "30", "30");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_apply_detail_keeps_score() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let record = SummaryRecord::new(
            "m1",
            "ITF W15",
            Participant::new("A"),
            Participant::new("B"),
            score(&[(3, 2)], "40", "15"),
        );
        let mut entity = LiveEntity::from_summary(record, t0);
        let before = entity.score.clone();

        let t1 = t0 + chrono::Duration::seconds(30);
        entity.apply_detail(
            DetailRecord {
                round: Some("R32".into()),
                ..Default::default()
            },
            t1,
        );

        assert_eq!(entity.score, before);
        assert!(entity.has_detail);
        assert_eq!(entity.detail_refreshed_at, Some(t1));
        assert_eq!(entity.last_observed_at, t1);
    }

    #[test]
    fn test_display_line_skips_blank_units() {
        let s = score(&[(6, 4), (0, 0)], "AD", "40");
        assert_eq!(s.display_line(), "6-4 (AD-40)");
    }
}
