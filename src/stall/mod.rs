//! Per-entity staleness tracking.
//!
//! A live entity whose score fingerprint has not moved for longer than the
//! threshold raises exactly one alert per unchanged streak.

use crate::core::{LiveEntity, ScoreFingerprint};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{Level, event};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallState {
    pub entity_id: String,
    pub fingerprint: ScoreFingerprint,
    pub last_changed_at: DateTime<Utc>,
    pub alert_sent: bool,
}

/// A stall that should be reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallAlert {
    pub entity_id: String,
    pub message: String,
    pub unchanged_for: Duration,
}

pub struct StallDetector {
    threshold: Duration,
    states: HashMap<String, StallState>,
}

impl StallDetector {
    pub fn new(threshold: std::time::Duration) -> Self {
        Self {
            threshold: Duration::from_std(threshold).unwrap_or(Duration::MAX),
            states: HashMap::new(),
        }
    }

    /// Updates tracking from the current snapshot and returns the alerts to
    /// send.
    ///
    /// Only entities with status LIVE are tracked. Ids that left the snapshot
    /// or stopped being LIVE are dropped silently.
    pub fn check<'a, I>(&mut self, entities: I, now: DateTime<Utc>) -> Vec<StallAlert>
    where
        I: IntoIterator<Item = &'a LiveEntity>,
    {
        let mut alerts = Vec::new();
        let mut present = HashSet::new();

        for entity in entities {
            if !entity.is_live() {
                continue;
            }
            present.insert(entity.id.clone());
            let fingerprint = entity.score.fingerprint();

            let Some(state) = self.states.get_mut(&entity.id) else {
                event!(Level::DEBUG, id = %entity.id, "stall tracking started");
                self.states.insert(
                    entity.id.clone(),
                    StallState {
                        entity_id: entity.id.clone(),
                        fingerprint,
                        last_changed_at: now,
                        alert_sent: false,
                    },
                );
                continue;
            };

            if state.fingerprint != fingerprint {
                state.fingerprint = fingerprint;
                state.last_changed_at = now;
                state.alert_sent = false;
                continue;
            }

            let unchanged_for = now - state.last_changed_at;
            if unchanged_for > self.threshold && !state.alert_sent {
                state.alert_sent = true;
                event!(
                    Level::WARN,
                    id = %entity.id,
                    seconds = unchanged_for.num_seconds(),
                    "stall detected"
                );
                alerts.push(StallAlert {
                    entity_id: entity.id.clone(),
                    message: format_alert(entity, self.threshold),
                    unchanged_for,
                });
            }
        }

        let before = self.states.len();
        self.states.retain(|id, _| present.contains(id));
        let pruned = before - self.states.len();
        if pruned > 0 {
            event!(Level::DEBUG, pruned, "stall tracking pruned");
        }

        alerts
    }

    pub fn state(&self, id: &str) -> Option<&StallState> {
        self.states.get(id)
    }

    pub fn tracked(&self) -> usize {
        self.states.len()
    }
}

/// Markdown alert text for the notification sink.
pub fn format_alert(entity: &LiveEntity, threshold: Duration) -> String {
    format!(
        "*Stall Alert*\n\n*Group:* {}\n*Match:* {}\n*Score:* {}\n\n_The score has not changed for over {} minutes. This could indicate a delay (weather, injury, ...)._",
        entity.group_name,
        entity.matchup(),
        entity.score.display_line(),
        threshold.num_minutes()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        CurrentUnit, EntityStatus, Participant, ScoreState, SummaryRecord, UnitScore,
    };
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn entity(id: &str, point: &str, status: EntityStatus) -> LiveEntity {
        LiveEntity::from_summary(
            SummaryRecord::new(
                id,
                "ITF W25",
                Participant::new("Ann"),
                Participant::new("Bea"),
                ScoreState {
                    units: vec![UnitScore::new(4, 4)],
                    current: CurrentUnit::new(point, "0"),
                    status,
                },
            ),
            t(0),
        )
    }

    fn detector() -> StallDetector {
        StallDetector::new(std::time::Duration::from_secs(300))
    }

    #[test]
    fn test_first_sighting_never_alerts() {
        let mut d = detector();
        let e = entity("m", "15", EntityStatus::Live);
        assert!(d.check([&e], t(10_000)).is_empty());
        assert_eq!(d.tracked(), 1);
    }

    #[test]
    fn test_single_alert_per_streak() {
        let mut d = detector();
        let e = entity("m", "15", EntityStatus::Live);
        let mut sent = 0;
        for step in 0..=30 {
            sent += d.check([&e], t(step * 30)).len();
        }
        // 900s unchanged = 3x threshold, still one alert.
        assert_eq!(sent, 1);
        assert!(d.state("m").unwrap().alert_sent);
    }

    #[test]
    fn test_change_resets_streak() {
        let mut d = detector();
        let a = entity("m", "15", EntityStatus::Live);
        let b = entity("m", "30", EntityStatus::Live);

        d.check([&a], t(0));
        assert_eq!(d.check([&a], t(301)).len(), 1);

        assert!(d.check([&b], t(400)).is_empty());
        assert!(!d.state("m").unwrap().alert_sent);
        assert!(d.check([&b], t(700)).is_empty());
        assert_eq!(d.check([&b], t(701)).len(), 1);
    }

    #[test]
    fn test_absent_entities_are_dropped() {
        let mut d = detector();
        let e = entity("m", "15", EntityStatus::Live);
        d.check([&e], t(0));
        let none: [&LiveEntity; 0] = [];
        assert!(d.check(none, t(1000)).is_empty());
        assert_eq!(d.tracked(), 0);
    }

    #[test]
    fn test_completed_entities_are_not_tracked() {
        let mut d = detector();
        let e = entity("m", "15", EntityStatus::Completed);
        d.check([&e], t(0));
        assert!(d.check([&e], t(1000)).is_empty());
        assert_eq!(d.tracked(), 0);
    }

    #[test]
    fn test_completion_drops_tracking_state() {
        let mut d = detector();
        let live = entity("m", "15", EntityStatus::Live);
        let done = entity("m", "15", EntityStatus::Completed);
        d.check([&live], t(0));
        assert!(d.state("m").is_some());

        assert!(d.check([&done], t(30)).is_empty());
        assert!(d.state("m").is_none());
        assert_eq!(d.tracked(), 0);
    }

    #[test]
    fn test_alert_message() {
        let e = entity("m", "AD", EntityStatus::Live);
        let text = format_alert(&e, Duration::seconds(300));
        assert!(text.contains("Ann vs Bea"));
        assert!(text.contains("4-4 (AD-0)"));
        assert!(text.contains("5 minutes"));
    }
}
