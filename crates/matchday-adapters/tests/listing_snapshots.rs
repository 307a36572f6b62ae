// Golden snapshots for the sample listing pages under fixtures/<source>/sample/.

use std::fs;
use std::path::{Path, PathBuf};

use matchday_adapters::{adapter_for_source, extract_page, LIVE_FOOTBALL_ON_TV_SOURCE_ID, SKYSPORTS_SOURCE_ID};
use matchday_core::RawFixture;

fn sample_dir(source_id: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(source_id)
        .join("sample")
}

fn assert_matches_snapshot(source_id: &str) {
    let dir = sample_dir(source_id);
    let html = fs::read_to_string(dir.join("listing.html")).expect("read listing");
    let expected: Vec<RawFixture> =
        serde_json::from_str(&fs::read_to_string(dir.join("snapshot.json")).expect("read snapshot"))
            .expect("parse snapshot");

    let adapter = adapter_for_source(source_id).expect("adapter");
    let actual = extract_page(adapter.as_ref(), &html);
    assert_eq!(actual, expected);
}

#[test]
fn skysports_listing_matches_snapshot() {
    assert_matches_snapshot(SKYSPORTS_SOURCE_ID);
}

#[test]
fn live_football_on_tv_listing_matches_snapshot() {
    assert_matches_snapshot(LIVE_FOOTBALL_ON_TV_SOURCE_ID);
}
