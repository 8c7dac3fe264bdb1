use chrono::{Datelike, NaiveDate, Weekday};
use dashmap::DashMap;

use crate::model::*;

use super::{Engine, EngineError};

/// At most one rule per (provider, weekday). Last upsert wins.
pub struct RuleBook {
    rules: DashMap<(ProviderId, Weekday), AvailabilityRule>,
}

impl Default for RuleBook {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleBook {
    pub fn new() -> Self {
        Self {
            rules: DashMap::new(),
        }
    }

    pub fn upsert(&self, rule: AvailabilityRule) {
        self.rules.insert((rule.provider_id, rule.day_of_week), rule);
    }

    pub fn get(&self, provider_id: ProviderId, day: Weekday) -> Option<AvailabilityRule> {
        self.rules.get(&(provider_id, day)).map(|e| e.value().clone())
    }

    /// The one place the default window applies: no rule means open
    /// 10:00-17:00.
    pub fn resolve(&self, provider_id: ProviderId, date: NaiveDate) -> ResolvedAvailability {
        match self.rules.get(&(provider_id, date.weekday())) {
            Some(rule) => ResolvedAvailability {
                window: rule.window,
                is_day_off: rule.is_day_off,
                source: RuleSource::Configured,
            },
            None => ResolvedAvailability {
                window: default_window(),
                is_day_off: false,
                source: RuleSource::Default,
            },
        }
    }

    /// Configured rules of one provider, Sunday first.
    pub fn for_provider(&self, provider_id: ProviderId) -> Vec<AvailabilityRule> {
        let mut rules: Vec<AvailabilityRule> = self
            .rules
            .iter()
            .filter(|e| e.key().0 == provider_id)
            .map(|e| e.value().clone())
            .collect();
        rules.sort_by_key(|r| r.day_of_week.num_days_from_sunday());
        rules
    }

    pub fn all(&self) -> Vec<AvailabilityRule> {
        self.rules.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Merge sorted overlapping/adjacent windows into disjoint windows.
pub fn merge_overlapping(sorted: &[TimeWindow]) -> Vec<TimeWindow> {
    let mut merged: Vec<TimeWindow> = Vec::new();
    for &window in sorted {
        if let Some(last) = merged.last_mut()
            && let Some(hull) = last.merge(&window)
        {
            *last = hull;
            continue;
        }
        merged.push(window);
    }
    merged
}

/// `base` minus `to_remove`. Both sorted by start; `to_remove` disjoint.
pub fn subtract_windows(base: &[TimeWindow], to_remove: &[TimeWindow]) -> Vec<TimeWindow> {
    let mut result = Vec::new();
    let mut ri = 0;

    for b in base {
        let mut cursor = b.start();

        while ri < to_remove.len() && to_remove[ri].end() <= cursor {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start() < b.end() {
            let r = &to_remove[j];
            if let Ok(gap) = TimeWindow::new(cursor, r.start()) {
                result.push(gap);
            }
            cursor = cursor.max(r.end());
            j += 1;
        }

        if let Ok(tail) = TimeWindow::new(cursor, b.end()) {
            result.push(tail);
        }
    }

    result
}

impl Engine {
    /// Effective hours for a provider on a date. Never fails.
    pub fn resolve_availability(
        &self,
        provider_id: ProviderId,
        date: NaiveDate,
    ) -> ResolvedAvailability {
        self.rules.resolve(provider_id, date)
    }

    pub fn rules_for_provider(&self, provider_id: ProviderId) -> Vec<AvailabilityRule> {
        self.rules.for_provider(provider_id)
    }

    /// Replace the provider's rule for `rule.day_of_week`. Existing bookings
    /// are not re-validated against the new hours.
    pub async fn upsert_rule(
        &self,
        actor: UserId,
        rule: AvailabilityRule,
    ) -> Result<(), EngineError> {
        self.authorize_provider(rule.provider_id, actor).await?;
        let (provider_id, day) = (rule.provider_id, rule.day_of_week);
        self.persist_rule(rule).await?;
        tracing::info!(provider = %provider_id, ?day, "availability rule updated");
        Ok(())
    }
}
