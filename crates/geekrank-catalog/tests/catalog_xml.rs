use std::fs;
use std::path::{Path, PathBuf};

use geekrank_catalog::{load_ranked_rows, parse_game_document, write_sorted_view, CatalogFailure};
use geekrank_core::{ranked_ids, TaxonomyKind};

fn fixture(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    fs::read_to_string(&path).expect("read fixture")
}

#[test]
fn parses_full_game_document() {
    let draft = parse_game_document(&fixture("brass_birmingham.xml")).expect("parse");

    // The primary-flagged name wins over the one listed first.
    assert_eq!(draft.name, "Brass: Birmingham");
    assert_eq!(draft.year_published, Some(2018));
    assert_eq!(draft.min_players, Some(2));
    assert_eq!(draft.max_players, Some(4));
    assert_eq!(draft.age, Some(14));
    assert_eq!(draft.playing_time, Some(120));
    assert_eq!(draft.min_playing_time, Some(60));
    assert_eq!(draft.max_playing_time, Some(120));
    assert_eq!(draft.average_weight, Some(3.91));
    assert_eq!(draft.average, Some(8.58));
    assert_eq!(draft.bayes_average, Some(8.41));
    assert_eq!(draft.users_rated, Some(46483));
    assert_eq!(draft.sub_domain.as_deref(), Some("Strategy Games"));
    assert_eq!(
        draft.thumbnail.as_deref(),
        Some("https://cf.geekdo-images.com/thumb/img/brass_t.jpg")
    );
    assert_eq!(
        draft.image.as_deref(),
        Some("https://cf.geekdo-images.com/original/img/brass.jpg")
    );
    let description = draft.description.expect("description");
    assert!(description.contains("1770 & 1870"), "entities decoded");

    assert_eq!(draft.publishers, vec!["Roxley", "Ghenos Games"]);
    assert_eq!(
        draft.honors,
        vec!["2018 Golden Geek Best Strategy Board Game Nominee"]
    );
    assert_eq!(
        draft.mechanics,
        vec!["Hand Management", "Network and Route Building"]
    );
    assert_eq!(draft.categories, vec!["Economic"]);
}

#[test]
fn taxonomy_groups_follow_kind_order() {
    let draft = parse_game_document(&fixture("brass_birmingham.xml")).expect("parse");
    let kinds: Vec<TaxonomyKind> = draft.taxonomy().iter().map(|(k, _)| *k).collect();
    assert_eq!(
        kinds,
        vec![
            TaxonomyKind::Publisher,
            TaxonomyKind::Honor,
            TaxonomyKind::Mechanic,
            TaxonomyKind::Category,
        ]
    );
}

#[test]
fn missing_primary_name_is_unreconcilable() {
    let err = parse_game_document(&fixture("no_primary_name.xml")).unwrap_err();
    assert_eq!(err, CatalogFailure::MissingName);
}

#[test]
fn error_document_is_malformed() {
    let err = parse_game_document(&fixture("item_not_found.xml")).unwrap_err();
    assert!(matches!(err, CatalogFailure::Malformed(_)));
}

#[test]
fn dataset_loads_sorts_and_persists_sorted_view() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dataset = dir.path().join("boardgames_ranks.csv");
    fs::write(
        &dataset,
        "id,rank,bayesaverage,average\n\
         224517,1,8.41,8.58\n\
         999001,0,0,0\n\
         161936,2,8.38,8.54\n\
         174430,2,8.40,8.60\n",
    )
    .expect("write dataset");

    let mut rows = load_ranked_rows(&dataset).expect("load");
    let ids = ranked_ids(&mut rows);
    // Rank ties fall back to bayes-average descending; unranked rows go last.
    assert_eq!(ids, vec![224517, 174430, 161936, 999001]);

    let view: PathBuf = dir.path().join("sorted_view.csv");
    write_sorted_view(&view, &ids).expect("write view");
    let written = fs::read_to_string(&view).expect("read view");
    assert_eq!(written, "id\n224517\n174430\n161936\n999001\n");
}

#[test]
fn empty_dataset_fields_are_missing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dataset = dir.path().join("sparse.csv");
    fs::write(&dataset, "id,rank,bayesaverage,average\n42,,,\n").expect("write dataset");

    let rows = load_ranked_rows(&dataset).expect("load");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, 42);
    assert_eq!(rows[0].rank, None);
    assert_eq!(rows[0].bayes_average, None);
    assert_eq!(rows[0].average, None);
}
