//! Core domain model and ranked-dataset ordering for Geekrank.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "geekrank-core";

/// Persisted descriptions are capped at this many characters.
pub const DESCRIPTION_MAX: usize = 8000;

/// Normalized taxonomy kinds shared across many games.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaxonomyKind {
    Publisher,
    Honor,
    Mechanic,
    Category,
}

impl TaxonomyKind {
    pub const ALL: [TaxonomyKind; 4] = [
        TaxonomyKind::Publisher,
        TaxonomyKind::Honor,
        TaxonomyKind::Mechanic,
        TaxonomyKind::Category,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaxonomyKind::Publisher => "publisher",
            TaxonomyKind::Honor => "honor",
            TaxonomyKind::Mechanic => "mechanic",
            TaxonomyKind::Category => "category",
        }
    }
}

/// Parsed catalog response handed from the catalog client into the sync pipeline.
///
/// Every scalar besides `name` is optional; the catalog omits fields freely.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GameDraft {
    pub name: String,
    pub year_published: Option<i32>,
    pub min_players: Option<i32>,
    pub max_players: Option<i32>,
    pub age: Option<i32>,
    pub average_weight: Option<f64>,
    pub playing_time: Option<i32>,
    pub min_playing_time: Option<i32>,
    pub max_playing_time: Option<i32>,
    pub description: Option<String>,
    pub thumbnail: Option<String>,
    pub image: Option<String>,
    pub sub_domain: Option<String>,
    pub average: Option<f64>,
    pub bayes_average: Option<f64>,
    pub users_rated: Option<i64>,
    pub publishers: Vec<String>,
    pub honors: Vec<String>,
    pub mechanics: Vec<String>,
    pub categories: Vec<String>,
}

impl GameDraft {
    /// Taxonomy names grouped by kind, in catalog order.
    pub fn taxonomy(&self) -> [(TaxonomyKind, &[String]); 4] {
        [
            (TaxonomyKind::Publisher, self.publishers.as_slice()),
            (TaxonomyKind::Honor, self.honors.as_slice()),
            (TaxonomyKind::Mechanic, self.mechanics.as_slice()),
            (TaxonomyKind::Category, self.categories.as_slice()),
        ]
    }
}

/// Canonical persisted game row. The description lives in its own table,
/// keyed 1:1 with the game, so it is not part of this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRecord {
    pub id: i64,
    pub name: String,
    pub year_published: Option<i32>,
    pub min_players: Option<i32>,
    pub max_players: Option<i32>,
    pub age: Option<i32>,
    pub average_weight: Option<f64>,
    pub playing_time: Option<i32>,
    pub min_playing_time: Option<i32>,
    pub max_playing_time: Option<i32>,
    pub thumbnail: Option<String>,
    pub image: Option<String>,
    pub sub_domain: Option<String>,
    pub average: Option<f64>,
    pub bayes_average: Option<f64>,
    pub users_rated: Option<i64>,
    pub old_rank: Option<i32>,
}

impl GameRecord {
    /// Build a fresh record from a catalog draft. New games carry no rank history.
    pub fn from_draft(id: i64, draft: &GameDraft) -> Self {
        Self {
            id,
            name: draft.name.clone(),
            year_published: draft.year_published,
            min_players: draft.min_players,
            max_players: draft.max_players,
            age: draft.age,
            average_weight: draft.average_weight,
            playing_time: draft.playing_time,
            min_playing_time: draft.min_playing_time,
            max_playing_time: draft.max_playing_time,
            thumbnail: draft.thumbnail.clone(),
            image: draft.image.clone(),
            sub_domain: draft.sub_domain.clone(),
            average: draft.average,
            bayes_average: draft.bayes_average,
            users_rated: draft.users_rated,
            old_rank: None,
        }
    }
}

/// Cap a description at [`DESCRIPTION_MAX`] characters without splitting a
/// code point.
pub fn truncate_description(text: &str) -> &str {
    match text.char_indices().nth(DESCRIPTION_MAX) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// One row of the ranked input dataset after zero-as-missing normalization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankedRow {
    pub id: i64,
    pub rank: Option<u32>,
    pub bayes_average: Option<f64>,
    pub average: Option<f64>,
}

impl RankedRow {
    /// The dataset uses zero as a sentinel for "missing"; normalize it away
    /// before any ordering decisions.
    pub fn new(id: i64, rank: u32, bayes_average: f64, average: f64) -> Self {
        Self {
            id,
            rank: (rank != 0).then_some(rank),
            bayes_average: (bayes_average != 0.0).then_some(bayes_average),
            average: (average != 0.0).then_some(average),
        }
    }
}

fn cmp_asc_missing_last<T: Ord>(a: &Option<T>, b: &Option<T>) -> std::cmp::Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    }
}

fn cmp_desc_missing_last(a: &Option<f64>, b: &Option<f64>) -> std::cmp::Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.total_cmp(a),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    }
}

/// Sort rows by rank ascending, then bayes-average descending, then average
/// descending, with missing values always last. The sort is stable, so fully
/// tied rows keep their dataset order.
pub fn sort_ranked(rows: &mut [RankedRow]) {
    rows.sort_by(|a, b| {
        cmp_asc_missing_last(&a.rank, &b.rank)
            .then_with(|| cmp_desc_missing_last(&a.bayes_average, &b.bayes_average))
            .then_with(|| cmp_desc_missing_last(&a.average, &b.average))
    });
}

/// Sorted identifier sequence for the reconciliation pass, best rank first.
pub fn ranked_ids(rows: &mut [RankedRow]) -> Vec<i64> {
    sort_ranked(rows);
    rows.iter().map(|r| r.id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_orders_ascending_with_missing_last() {
        let mut rows = vec![
            RankedRow::new(3, 0, 7.0, 7.2),
            RankedRow::new(1, 2, 7.9, 8.0),
            RankedRow::new(2, 1, 8.1, 8.3),
        ];
        assert_eq!(ranked_ids(&mut rows), vec![2, 1, 3]);
    }

    #[test]
    fn bayes_average_breaks_rank_ties_descending() {
        let mut rows = vec![
            RankedRow::new(10, 5, 6.5, 7.0),
            RankedRow::new(11, 5, 7.5, 6.0),
            RankedRow::new(12, 5, 0.0, 9.9),
        ];
        // Zero bayes-average is missing and sorts after real values.
        assert_eq!(ranked_ids(&mut rows), vec![11, 10, 12]);
    }

    #[test]
    fn average_breaks_remaining_ties() {
        let mut rows = vec![
            RankedRow::new(20, 3, 7.0, 6.1),
            RankedRow::new(21, 3, 7.0, 6.9),
        ];
        assert_eq!(ranked_ids(&mut rows), vec![21, 20]);
    }

    #[test]
    fn worked_example_from_dataset() {
        let mut rows = vec![
            RankedRow::new(1, 1, 8.1, 8.3),
            RankedRow::new(2, 2, 0.0, 0.0),
        ];
        assert_eq!(ranked_ids(&mut rows), vec![1, 2]);
    }

    #[test]
    fn zero_rank_is_missing_and_sorts_last() {
        let row = RankedRow::new(7, 0, 0.0, 0.0);
        assert_eq!(row.rank, None);
        assert_eq!(row.bayes_average, None);
        assert_eq!(row.average, None);
    }

    #[test]
    fn description_truncation_respects_char_boundaries() {
        let text = "é".repeat(DESCRIPTION_MAX + 10);
        let cut = truncate_description(&text);
        assert_eq!(cut.chars().count(), DESCRIPTION_MAX);

        let short = "fits";
        assert_eq!(truncate_description(short), short);
    }
}
