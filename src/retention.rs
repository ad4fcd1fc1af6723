//! The GFS (Grandfather-Father-Son) retention classifier.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, Utc};

use crate::model::{BackupMetadata, RetentionCategory, RetentionConfig};

/// Classify every archive in `backups` into a [`RetentionCategory`] under
/// `cfg`. "Now" is read once at entry via `clock` so tests can pin it.
///
/// Pure function: performs no I/O and never mutates `backups`.
pub fn classify(
    backups: &[BackupMetadata],
    cfg: &RetentionConfig,
    now: DateTime<Utc>,
) -> HashMap<String, RetentionCategory> {
    let mut sorted: Vec<&BackupMetadata> = backups.iter().collect();
    sorted.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let mut result = HashMap::with_capacity(sorted.len());

    let daily_count = cfg.daily.max(0) as usize;
    let cut_index = daily_count.min(sorted.len());
    for backup in &sorted[..cut_index] {
        result.insert(backup.reference.clone(), RetentionCategory::Daily);
    }

    let current_iso_week = (now.iso_week().year(), now.iso_week().week());
    let current_month = (now.year(), now.month());
    let current_year = now.year();

    let mut weekly_seen: HashSet<(i32, u32)> = HashSet::new();
    let mut monthly_seen: HashSet<(i32, u32)> = HashSet::new();
    let mut yearly_seen: HashSet<i32> = HashSet::new();

    for backup in &sorted[cut_index..] {
        if cfg.weekly > 0 {
            let iso = backup.timestamp.iso_week();
            let key = (iso.year(), iso.week());
            if key < current_iso_week
                && !weekly_seen.contains(&key)
                && (weekly_seen.len() as i64) < cfg.weekly
            {
                weekly_seen.insert(key);
                result.insert(backup.reference.clone(), RetentionCategory::Weekly);
                continue;
            }
        }

        if cfg.monthly > 0 {
            let key = (backup.timestamp.year(), backup.timestamp.month());
            if key < current_month
                && !monthly_seen.contains(&key)
                && (monthly_seen.len() as i64) < cfg.monthly
            {
                monthly_seen.insert(key);
                result.insert(backup.reference.clone(), RetentionCategory::Monthly);
                continue;
            }
        }

        if cfg.yearly >= 0 {
            let key = backup.timestamp.year();
            let unbounded = cfg.yearly == 0;
            if key < current_year
                && !yearly_seen.contains(&key)
                && (unbounded || (yearly_seen.len() as i64) < cfg.yearly)
            {
                yearly_seen.insert(key);
                result.insert(backup.reference.clone(), RetentionCategory::Yearly);
                continue;
            }
        }
    }

    for backup in &sorted {
        result
            .entry(backup.reference.clone())
            .or_insert(RetentionCategory::Delete);
    }

    result
}

/// Per-category counts over a classification result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassificationStats {
    pub daily: usize,
    pub weekly: usize,
    pub monthly: usize,
    pub yearly: usize,
    pub delete: usize,
}

pub fn get_stats(classification: &HashMap<String, RetentionCategory>) -> ClassificationStats {
    let mut stats = ClassificationStats::default();
    for category in classification.values() {
        match category {
            RetentionCategory::Daily => stats.daily += 1,
            RetentionCategory::Weekly => stats.weekly += 1,
            RetentionCategory::Monthly => stats.monthly += 1,
            RetentionCategory::Yearly => stats.yearly += 1,
            RetentionCategory::Delete => stats.delete += 1,
        }
    }
    stats
}
