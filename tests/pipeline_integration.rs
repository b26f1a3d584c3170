// Integration tests for the full pipeline: CSV import → run → query

use chrono::NaiveDate;
use rusqlite::Connection;
use std::io::Write;

use fp_pipeline::{
    db, query_summary, DataElement, DropReason, Method, OrgLevel, OrgUnit, Pipeline,
    PipelineConfig, PipelineError, RawRow, SummaryFilter,
};

const TABLE: &str = "cleaned_fp_summary_data";

fn jan() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
}

fn raw(org: &str, element: &str, period: &str, value: &str) -> RawRow {
    RawRow {
        org_unit: org.to_string(),
        analytic: element.to_string(),
        category_option: None,
        period: Some(period.to_string()),
        value: Some(value.to_string()),
    }
}

fn seeded_connection(rows: &[RawRow]) -> Connection {
    let mut conn = Connection::open_in_memory().unwrap();
    db::setup_database(&conn, TABLE).unwrap();

    db::replace_org_units(
        &mut conn,
        &[
            OrgUnit::new("KE", "Kenya", OrgLevel::Country, None),
            OrgUnit::new("CX", "County X", OrgLevel::County, Some("KE")),
            OrgUnit::new("CY", "County Y", OrgLevel::County, Some("KE")),
            OrgUnit::new("SCX", "Sub X", OrgLevel::SubCounty, Some("CX")),
            OrgUnit::new("WX", "Ward X", OrgLevel::Ward, Some("SCX")),
            OrgUnit::new("FA", "FacilityA", OrgLevel::Facility, Some("WX")),
            OrgUnit::new("FB", "FacilityB", OrgLevel::Facility, Some("CY")),
        ],
    )
    .unwrap();

    db::replace_data_elements(
        &mut conn,
        &[
            DataElement::new("TUHzoPGLM3t", "MOH 711 Rev 2020_Implants 2 Rod"),
            DataElement::new("cV4qoKSYiBs", "MOH 711 Rev 2020_Male Condoms"),
            DataElement::new("AVDzuypqGt9", "MOH 747A_Male Condoms"),
            DataElement::new("BQmcVE8fex4", "MOH 711 Rev 2020_Pills Combined oral contraceptive"),
        ],
    )
    .unwrap();

    db::insert_raw_rows(&mut conn, rows).unwrap();
    conn
}

fn pipeline() -> Pipeline {
    Pipeline::new(PipelineConfig::default()).unwrap()
}

fn all_rows(conn: &Connection) -> Vec<fp_pipeline::CleanedSummary> {
    query_summary(conn, TABLE, &SummaryFilter::default()).unwrap()
}

#[test]
fn test_two_rod_end_to_end() {
    let mut conn = seeded_connection(&[raw("FA", "TUHzoPGLM3t", "202401", "100")]);

    let report = pipeline().run(&mut conn).unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.dropped, 0);
    assert_eq!(report.written, 4);

    let rows = all_rows(&conn);
    let value = |analytic: &str, org: &str| {
        rows.iter()
            .find(|r| r.analytic == analytic && r.org_unit == org)
            .map(|r| (r.method, r.period, r.value))
    };

    for org in ["County X", "National"] {
        let (method, period, jadelle) = value("Jadelle", org).unwrap();
        let (_, _, levoplant) = value("Levoplant", org).unwrap();
        assert_eq!(method, Method::Service);
        assert_eq!(period, jan());
        assert!((jadelle - 80.0).abs() < 1e-9);
        assert!((levoplant - 20.0).abs() < 1e-9);
    }
    assert!(value("2 Rod", "County X").is_none());
}

#[test]
fn test_condom_multiplier_and_consumption() {
    let mut conn = seeded_connection(&[
        raw("FA", "cV4qoKSYiBs", "202401", "7"),
        raw("FB", "cV4qoKSYiBs", "202401", "3"),
        raw("FA", "AVDzuypqGt9", "202401", "7"),
    ]);
    pipeline().run(&mut conn).unwrap();

    let service = query_summary(
        &conn,
        TABLE,
        &SummaryFilter {
            method: Some(Method::Service),
            org_unit: Some("National".to_string()),
            ..SummaryFilter::default()
        },
    )
    .unwrap();
    assert_eq!(service.len(), 1);
    assert_eq!(service[0].value, 100.0);

    let consumption = query_summary(
        &conn,
        TABLE,
        &SummaryFilter {
            method: Some(Method::Consumption),
            org_unit: Some("County X".to_string()),
            ..SummaryFilter::default()
        },
    )
    .unwrap();
    assert_eq!(consumption.len(), 1);
    assert_eq!(consumption[0].value, 7.0);
}

#[test]
fn test_unmapped_element_is_dropped() {
    let rows = vec![
        raw("FA", "BQmcVE8fex4", "202401", "8"),
        raw("FB", "BQmcVE8fex4", "202401", "4"),
    ];
    let mut baseline_conn = seeded_connection(&rows);
    let baseline = pipeline().run(&mut baseline_conn).unwrap();

    let mut with_unmapped = rows.clone();
    with_unmapped.push(raw("FA", "NOT_A_FP_ELEMENT", "202401", "50"));
    let mut conn = seeded_connection(&with_unmapped);
    let report = pipeline().run(&mut conn).unwrap();

    assert_eq!(report.dropped, baseline.dropped + 1);
    assert_eq!(report.dropped_for(DropReason::UnresolvedDataElement), 1);
    assert_eq!(all_rows(&conn), all_rows(&baseline_conn));
}

#[test]
fn test_national_equals_sum_of_counties() {
    let mut conn = seeded_connection(&[
        raw("FA", "BQmcVE8fex4", "202401", "8"),
        raw("FB", "BQmcVE8fex4", "202401", "4.4"),
        raw("FA", "BQmcVE8fex4", "202402", "1.1"),
        raw("FB", "TUHzoPGLM3t", "202402", "9"),
        raw("FA", "TUHzoPGLM3t", "2024-02", "13"),
    ]);
    pipeline().run(&mut conn).unwrap();

    let rows = all_rows(&conn);
    for national in rows.iter().filter(|r| r.org_level == OrgLevel::Country) {
        let counties: f64 = rows
            .iter()
            .filter(|r| {
                r.org_level == OrgLevel::County
                    && r.analytic == national.analytic
                    && r.method == national.method
                    && r.period == national.period
            })
            .map(|r| r.value)
            .sum();
        assert!((national.value - counties).abs() < 1e-9);
    }
}

#[test]
fn test_rerun_is_idempotent() {
    let mut conn = seeded_connection(&[
        raw("FA", "TUHzoPGLM3t", "202401", "100"),
        raw("FB", "cV4qoKSYiBs", "202401", "0.3"),
        raw("FB", "cV4qoKSYiBs", "202401", "0.3"),
        raw("FA", "BQmcVE8fex4", "202402", "0.1"),
    ]);

    let first = pipeline().run(&mut conn).unwrap();
    let first_rows = all_rows(&conn);
    let second = pipeline().run(&mut conn).unwrap();
    let second_rows = all_rows(&conn);

    assert_eq!(first, second);
    assert_eq!(first_rows, second_rows);
    assert_eq!(first.duplicate_rows, 2);

    let runs = db::list_runs(&conn, 10).unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs[0].digest.is_some());
    assert_eq!(runs[0].digest, runs[1].digest);
}

#[test]
fn test_failed_run_keeps_previous_summary() {
    let mut conn = seeded_connection(&[raw("FA", "TUHzoPGLM3t", "202401", "100")]);
    pipeline().run(&mut conn).unwrap();
    let before = all_rows(&conn);
    assert!(!before.is_empty());

    // Metadata refresh wiped the org unit snapshot
    db::replace_org_units(&mut conn, &[]).unwrap();
    let failure = pipeline().run(&mut conn).unwrap_err();

    assert!(matches!(failure.error, PipelineError::LookupTableEmpty(_)));
    assert_eq!(failure.report.processed, 1);
    assert_eq!(all_rows(&conn), before);

    let runs = db::list_runs(&conn, 10).unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().any(|r| r.outcome == db::RunOutcome::Failed && r.error.is_some()));
}

#[test]
fn test_csv_import_to_summary() {
    let dir = tempfile::tempdir().unwrap();

    let org_csv = dir.path().join("org_units.csv");
    let mut f = std::fs::File::create(&org_csv).unwrap();
    writeln!(f, "id,name,level,parent_id").unwrap();
    writeln!(f, "KE,Kenya,1,").unwrap();
    writeln!(f, "CX,County X,2,KE").unwrap();
    writeln!(f, "FA,FacilityA,5,CX").unwrap();

    let de_csv = dir.path().join("data_elements.csv");
    let mut f = std::fs::File::create(&de_csv).unwrap();
    writeln!(f, "id,name").unwrap();
    writeln!(f, "MsS41X1GEFr,MOH 711 Rev 2020_Implants Jadelle").unwrap();

    let raw_csv = dir.path().join("raw.csv");
    let mut f = std::fs::File::create(&raw_csv).unwrap();
    writeln!(f, "org_unit,analytic,category_option,period,value").unwrap();
    writeln!(f, "FA,MsS41X1GEFr,,202403,6").unwrap();
    writeln!(f, "FA,MsS41X1GEFr,,202403,").unwrap();

    let mut conn = Connection::open_in_memory().unwrap();
    db::setup_database(&conn, TABLE).unwrap();
    db::replace_org_units(&mut conn, &db::load_org_units_csv(&org_csv).unwrap()).unwrap();
    db::replace_data_elements(&mut conn, &db::load_data_elements_csv(&de_csv).unwrap()).unwrap();
    db::insert_raw_rows(&mut conn, &db::load_raw_csv(&raw_csv).unwrap()).unwrap();

    let report = pipeline().run(&mut conn).unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(report.dropped_for(DropReason::Malformed), 1);

    let rows = query_summary(
        &conn,
        TABLE,
        &SummaryFilter {
            org_unit: Some("County X".to_string()),
            ..SummaryFilter::default()
        },
    )
    .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].analytic, "Jadelle");
    assert_eq!(rows[0].value, 6.0);
    assert_eq!(rows[0].period, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());

    let export = dir.path().join("summary.csv");
    db::export_summary_csv(&rows, &export).unwrap();
    let content = std::fs::read_to_string(&export).unwrap();
    assert!(content.contains("Jadelle"));
}
