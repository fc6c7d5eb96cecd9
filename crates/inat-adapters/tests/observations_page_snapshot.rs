use inat_adapters::{parse_observations_page, JsonObservationExtractor, RecordExtractor};

fn fixture_bytes() -> Vec<u8> {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures/observations_page.json");
    std::fs::read(&path).expect("fixture page")
}

#[test]
fn captured_page_extracts_every_identified_observation_in_date_order() {
    let page = parse_observations_page("fixture", &fixture_bytes(), 1, 100).expect("page");
    assert_eq!(page.len(), 7);
    assert!(page.is_final_page());

    let records: Vec<_> = page
        .raw
        .iter()
        .filter_map(|raw| JsonObservationExtractor.extract(raw))
        .collect();
    assert_eq!(records.len(), 6, "the id-less payload is skipped");

    let dated: Vec<_> = records.iter().filter_map(|r| r.date).collect();
    assert_eq!(dated.len(), 5);
    assert!(dated.windows(2).all(|w| w[0] <= w[1]));

    let naja = records.iter().find(|r| r.id == 295298).expect("naja");
    assert_eq!(naja.subspecies.as_deref(), Some("annulifera"));
    assert_eq!(naja.introduced, Some(true));
    assert_eq!(naja.date, None);
    assert_eq!(naja.coords, None);

    let duberria = records.iter().find(|r| r.id == 169856).expect("duberria");
    assert_eq!(duberria.species, None);
    assert_eq!(duberria.coords.as_deref(), Some("[-19.8, 32.8666667]"));
}
