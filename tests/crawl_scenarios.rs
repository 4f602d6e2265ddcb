//! End-to-end Phase 1 scenarios against a scripted navigator
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use region_harvester_lib::crawling::{NavError, NextControl, TraversalController};
use region_harvester_lib::domain::{Locator, Region};
use region_harvester_lib::infrastructure::config::HarvestConfig;
use region_harvester_lib::storage::BasicRecordReader;
use region_harvester_lib::test_utils::{
    FixtureExtractor, ScriptedNavigator, Step, list_body, numbered_records, test_config,
};
use tokio_util::sync::CancellationToken;

fn controller(config: &HarvestConfig, navigator: Arc<ScriptedNavigator>) -> TraversalController {
    TraversalController::from_config(config, navigator, Arc::new(FixtureExtractor), CancellationToken::new())
        .unwrap()
}

/// Scripts `counts[i]` records on page i; the last page has a disabled next control.
fn script_subregion(navigator: &ScriptedNavigator, region: &str, subregion: &str, prefix: &str, counts: &[usize]) {
    let mut start = 1;
    for (page, count) in counts.iter().enumerate() {
        let next = if page + 1 == counts.len() {
            NextControl::Disabled
        } else {
            NextControl::Enabled
        };
        navigator.push(
            region_harvester_lib::test_utils::list_locator(region, subregion, page as u32),
            vec![Step::body(list_body(&numbered_records(prefix, start, *count), next))],
        );
        start += count;
    }
}

fn north() -> Region {
    Region::new("n", "North")
        .with_subregion("na", "North A")
        .with_subregion("nb", "North B")
}

fn south() -> Region {
    Region::new("s", "South")
        .with_subregion("s1", "South Empty")
        .with_subregion("s2", "South Full")
}

fn scripted_north_and_south() -> ScriptedNavigator {
    let navigator = ScriptedNavigator::new();
    script_subregion(&navigator, "n", "na", "NA", &[25, 25, 10]);
    script_subregion(&navigator, "n", "nb", "NB", &[20, 20]);
    navigator.push(
        region_harvester_lib::test_utils::list_locator("s", "s1", 0),
        vec![Step::body(list_body(&[], NextControl::Absent))],
    );
    script_subregion(&navigator, "s", "s2", "SB", &[30, 25]);
    navigator
}

fn read_ids(path: &Path, config: &HarvestConfig) -> Vec<String> {
    BasicRecordReader::open(path, &config.schema, &config.output.missing_value)
        .unwrap()
        .map(|r| r.unwrap().primary_id)
        .collect()
}

#[tokio::test]
async fn north_and_south_are_written_completely() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let summary = controller(&config, Arc::new(scripted_north_and_south()))
        .run(&[north(), south()])
        .await
        .unwrap();

    let north_summary = summary.region("n").unwrap();
    assert_eq!(north_summary.records_written, 100);
    assert!(north_summary.partial_subregions.is_empty());

    let south_summary = summary.region("s").unwrap();
    assert_eq!(south_summary.records_written, 55);
    assert!(south_summary.partial_subregions.is_empty());
    assert_eq!(south_summary.subregions_completed, 2);

    let records: Vec<_> = BasicRecordReader::open(&dir.path().join("NORTH_phase1.csv"), &config.schema, "N/A")
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), 100);
    assert!(records.windows(2).all(|w| w[0].extracted_at <= w[1].extracted_at));
    assert!(records.iter().all(|r| r.has_detail_reference()));

    let ids = read_ids(&dir.path().join("SOUTH_phase1.csv"), &config);
    assert_eq!(ids.len(), 55);
    assert!(dir.path().join("run_summary.json").exists());
}

#[tokio::test]
async fn second_run_writes_nothing_new() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let navigator = Arc::new(scripted_north_and_south());

    controller(&config, navigator.clone()).run(&[north()]).await.unwrap();
    let first = read_ids(&dir.path().join("NORTH_phase1.csv"), &config);

    let summary = controller(&config, navigator).run(&[north()]).await.unwrap();
    let second = read_ids(&dir.path().join("NORTH_phase1.csv"), &config);

    assert_eq!(first, second);
    let region = summary.region("n").unwrap();
    assert_eq!(region.records_written, 0);
    assert_eq!(region.records_skipped_existing, 100);
}

#[tokio::test]
async fn torn_write_then_resume_matches_uninterrupted_run() {
    let reference_dir = tempfile::tempdir().unwrap();
    let reference_config = test_config(reference_dir.path());
    controller(&reference_config, Arc::new(scripted_north_and_south()))
        .run(&[north()])
        .await
        .unwrap();
    let reference: HashSet<String> = read_ids(&reference_dir.path().join("NORTH_phase1.csv"), &reference_config)
        .into_iter()
        .collect();

    // Simulate a crash: keep the header, 37 complete rows and half of row 38
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    controller(&config, Arc::new(scripted_north_and_south()))
        .run(&[north()])
        .await
        .unwrap();
    let path = dir.path().join("NORTH_phase1.csv");
    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    let mut torn = lines[..38].join("\n");
    torn.push('\n');
    torn.push_str(&lines[38][..lines[38].len() / 2]);
    std::fs::write(&path, torn).unwrap();

    let summary = controller(&config, Arc::new(scripted_north_and_south()))
        .run(&[north()])
        .await
        .unwrap();
    let resumed = read_ids(&path, &config);
    let unique: HashSet<String> = resumed.iter().cloned().collect();

    assert_eq!(resumed.len(), unique.len(), "no duplicates after resume");
    assert_eq!(unique, reference);
    assert_eq!(summary.region("n").unwrap().records_written, 63);
}

#[tokio::test]
async fn transient_misreads_do_not_change_the_result() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let navigator = ScriptedNavigator::new();
    let region = Region::new("w", "West").with_subregion("w1", "West One");
    for page in 0..4u32 {
        let next = if page == 3 {
            NextControl::Disabled
        } else {
            NextControl::Enabled
        };
        let body = list_body(&numbered_records("W", page as usize * 10 + 1, 10), next);
        let locator = region_harvester_lib::test_utils::list_locator("w", "w1", page);
        let steps = match page % 3 {
            0 => vec![Step::loading(), Step::body(body)],
            1 => vec![
                Step::error(NavError::Transport {
                    locator: locator.clone(),
                    reason: "reset".into(),
                }),
                Step::body(body),
            ],
            _ => vec![Step::body(list_body(&[], NextControl::Absent)), Step::body(body)],
        };
        navigator.push(locator, steps);
    }
    let navigator = Arc::new(navigator);

    let summary = controller(&config, navigator.clone()).run(&[region]).await.unwrap();
    let west = summary.region("w").unwrap();
    assert_eq!(west.records_written, 40);
    assert!(west.partial_subregions.is_empty());
    assert_eq!(read_ids(&dir.path().join("WEST_phase1.csv"), &config).len(), 40);
    assert_eq!(
        navigator.calls(&Locator::ListPage {
            region_id: "w".into(),
            subregion_id: "w1".into(),
            page: 4,
        }),
        0,
        "no page past the terminal one is requested"
    );
}

#[tokio::test]
async fn cancellation_leaves_a_resumable_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let cancel = CancellationToken::new();
    let navigator = ScriptedNavigator::new();
    let region = Region::new("e", "East").with_subregion("e1", "East One");
    navigator.push(
        region_harvester_lib::test_utils::list_locator("e", "e1", 0),
        vec![Step::body(list_body(&numbered_records("E", 1, 10), NextControl::Enabled))],
    );
    navigator.push(region_harvester_lib::test_utils::list_locator("e", "e1", 1), vec![Step::hang()]);
    let navigator = Arc::new(navigator);

    let controller = TraversalController::from_config(
        &config,
        navigator.clone(),
        Arc::new(FixtureExtractor),
        cancel.clone(),
    )
    .unwrap();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancel.cancel();
    });
    let summary = controller.run(std::slice::from_ref(&region)).await.unwrap();
    canceller.await.unwrap();

    assert!(summary.interrupted);
    assert_eq!(read_ids(&dir.path().join("EAST_phase1.csv"), &config).len(), 10);
}
