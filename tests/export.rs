mod common;

use std::collections::BTreeSet;

use common::{MemoryRemote, count, find};
use serde_json::{Value, json};
use tablesync::config::Config;
use tablesync::export::{ExportRunReport, Exporter};
use tablesync::io::store::{LocalStore, SqliteStore};
use tablesync::model::{Attributes, EntityKind, ExternalId, Links};
use tablesync::sync::{Orchestrator, RunMode};
use tablesync::{ErrorKind, Result, SyncError};

fn attributes(value: Value) -> Attributes {
    serde_json::from_value(value).expect("attribute fixture")
}

fn imported() -> (Config, MemoryRemote, SqliteStore) {
    let config = common::config();
    let remote = MemoryRemote::seeded();
    let mut store = common::store();
    Orchestrator::new(&config, &remote, &mut store)
        .run(RunMode::Default)
        .expect("import");
    (config, remote, store)
}

fn export(
    config: &Config,
    remote: &MemoryRemote,
    store: &mut SqliteStore,
) -> Result<ExportRunReport> {
    Exporter::new(config, remote, store).run()
}

#[test]
fn local_records_are_created_once_and_survive_reimport() {
    let (config, remote, mut store) = imported();
    let babbage = find(&store, EntityKind::Actor, "3");
    let links = Links::from([("parent".to_string(), BTreeSet::from([babbage.id]))]);
    let mary = store
        .create_local(
            EntityKind::Actor,
            &attributes(json!({ "name": "Mary Somerville", "actor_kind": "person" })),
            &links,
        )
        .unwrap();

    let report = export(&config, &remote, &mut store).expect("export");

    let actors = report.step(EntityKind::Actor).unwrap();
    assert_eq!(actors.stats.created, 1);
    assert_eq!(actors.stats.updated, 0);
    assert_eq!(actors.stats.skipped, 3);

    let rows = remote.rows("actors");
    assert_eq!(rows.len(), 4);
    let pushed = rows.last().unwrap();
    assert_eq!(pushed["Name"], json!("Mary Somerville"));
    assert_eq!(pushed["Parent"], json!(3));
    assert_eq!(pushed["SyncUuid"], json!(mary.sync_uuid.to_string()));

    let mary = store.get(mary.id).unwrap().unwrap();
    assert_eq!(mary.external_id, Some(ExternalId::new(pushed["Id"].to_string())));
    assert!(!mary.dirty);
    assert!(mary.synced_at.is_some());

    let reimport = Orchestrator::new(&config, &remote, &mut store)
        .run(RunMode::Default)
        .expect("re-import");
    let actors = reimport.step(EntityKind::Actor).unwrap();
    assert_eq!(actors.stats.created, 0);
    assert_eq!(actors.stats.updated, 0);
    assert_eq!(count(&store, EntityKind::Actor), 4);

    let again = export(&config, &remote, &mut store).expect("second export");
    assert_eq!(again.step(EntityKind::Actor).unwrap().stats.created, 0);
    assert_eq!(remote.rows("actors").len(), 4);
}

#[test]
fn local_edits_update_the_existing_row() {
    let (config, remote, mut store) = imported();
    let ada = find(&store, EntityKind::Actor, "1");
    let mut edited = ada.attributes.clone();
    edited.insert("name".into(), json!("Augusta Ada King"));
    store.edit_local(ada.id, &edited).unwrap();

    let report = export(&config, &remote, &mut store).expect("export");

    let actors = report.step(EntityKind::Actor).unwrap();
    assert_eq!(actors.stats.updated, 1);
    assert_eq!(actors.stats.created, 0);
    let row = remote
        .rows("actors")
        .into_iter()
        .find(|row| row["Id"] == json!(1))
        .unwrap();
    assert_eq!(row["Name"], json!("Augusta Ada King"));
    assert_eq!(remote.rows("actors").len(), 3);
    assert!(!store.get(ada.id).unwrap().unwrap().dirty);
}

#[test]
fn link_fields_are_pushed_through_the_links_endpoint() {
    let (config, remote, mut store) = imported();
    let ada = find(&store, EntityKind::Actor, "1");
    let society = find(&store, EntityKind::Actor, "2");
    let founder = find(&store, EntityKind::Role, "11");
    let links = Links::from([
        ("source_actor".to_string(), BTreeSet::from([ada.id])),
        ("target_actor".to_string(), BTreeSet::from([society.id])),
        ("role".to_string(), BTreeSet::from([founder.id])),
    ]);
    let local = store
        .create_local(
            EntityKind::Affiliation,
            &attributes(json!({ "start_date": "1840-01-01" })),
            &links,
        )
        .unwrap();

    let report = export(&config, &remote, &mut store).expect("export");

    let step = report.step(EntityKind::Affiliation).unwrap();
    assert_eq!(step.stats.created, 1);
    assert_eq!(step.stats.linked, 1);

    let external_id = store.get(local.id).unwrap().unwrap().external_id.unwrap();
    assert_eq!(
        remote.link_calls(),
        vec![(
            "affiliations".to_string(),
            "Role".to_string(),
            external_id.clone(),
            vec![ExternalId::new("11")],
        )]
    );
    let row = remote
        .rows("affiliations")
        .into_iter()
        .find(|row| row.get("Id").and_then(ExternalId::from_value).as_ref() == Some(&external_id))
        .unwrap();
    assert_eq!(row["Source"], json!(1));
    assert_eq!(row["Target"], json!(2));
    assert_eq!(row["Start"], json!("1840-01-01"));

    let reimport = Orchestrator::new(&config, &remote, &mut store)
        .run(RunMode::Default)
        .expect("re-import");
    let step = reimport.step(EntityKind::Affiliation).unwrap();
    assert_eq!(step.stats.created, 0);
    assert_eq!(step.stats.updated, 0);
    assert_eq!(count(&store, EntityKind::Affiliation), 4);
}

fn unexported_actor_config() -> Config {
    let mut config = common::config();
    if let Some(actor) = config.entities.get_mut("actor") {
        actor.export = false;
    }
    config
}

fn affiliation_to(store: &mut SqliteStore, source: i64, target: i64) -> i64 {
    let links = Links::from([
        ("source_actor".to_string(), BTreeSet::from([source])),
        ("target_actor".to_string(), BTreeSet::from([target])),
    ]);
    store
        .create_local(EntityKind::Affiliation, &Attributes::new(), &links)
        .unwrap()
        .id
}

#[test]
fn targets_without_external_id_fail_the_record() {
    let (_, remote, mut store) = imported();
    let mut config = unexported_actor_config();
    config.debug = true;
    let society = find(&store, EntityKind::Actor, "2");
    let unsynced = store
        .create_local(
            EntityKind::Actor,
            &attributes(json!({ "name": "Mary Somerville" })),
            &Links::new(),
        )
        .unwrap();
    let broken = affiliation_to(&mut store, unsynced.id, society.id);

    let report = export(&config, &remote, &mut store).expect("lenient export");

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].error_kind, ErrorKind::ReferentialIntegrity);
    assert_eq!(report.step(EntityKind::Affiliation).unwrap().stats.failed, 1);
    let broken = store.get(broken).unwrap().unwrap();
    assert!(broken.external_id.is_none());
    assert!(broken.dirty);
    assert_eq!(remote.rows("affiliations").len(), 3);
}

#[test]
fn strict_export_keeps_bookkeeping_of_rows_already_written() {
    let (_, remote, mut store) = imported();
    let config = unexported_actor_config();
    let ada = find(&store, EntityKind::Actor, "1");
    let society = find(&store, EntityKind::Actor, "2");
    let unsynced = store
        .create_local(
            EntityKind::Actor,
            &attributes(json!({ "name": "Mary Somerville" })),
            &Links::new(),
        )
        .unwrap();
    let written = affiliation_to(&mut store, ada.id, society.id);
    let broken = affiliation_to(&mut store, unsynced.id, society.id);

    let error = export(&config, &remote, &mut store).unwrap_err();

    assert!(matches!(error, SyncError::ReferentialIntegrity { .. }));
    assert!(store.get(written).unwrap().unwrap().external_id.is_some());
    assert!(store.get(broken).unwrap().unwrap().external_id.is_none());
    assert_eq!(remote.rows("affiliations").len(), 4);
}

fn local_affiliation_with_role(store: &mut SqliteStore) -> i64 {
    let ada = find(&*store, EntityKind::Actor, "1");
    let society = find(&*store, EntityKind::Actor, "2");
    let founder = find(&*store, EntityKind::Role, "11");
    let links = Links::from([
        ("source_actor".to_string(), BTreeSet::from([ada.id])),
        ("target_actor".to_string(), BTreeSet::from([society.id])),
        ("role".to_string(), BTreeSet::from([founder.id])),
    ]);
    store
        .create_local(EntityKind::Affiliation, &Attributes::new(), &links)
        .unwrap()
        .id
}

#[test]
fn failed_link_push_keeps_the_created_row_for_the_next_export() {
    let (mut config, remote, mut store) = imported();
    config.debug = true;
    let local = local_affiliation_with_role(&mut store);
    remote.fail_next_links(1);

    let report = export(&config, &remote, &mut store).expect("lenient export");

    let step = report.step(EntityKind::Affiliation).unwrap();
    assert_eq!(step.stats.created, 1);
    assert_eq!(step.stats.linked, 0);
    assert_eq!(step.stats.failed, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].error_kind, ErrorKind::RemoteApi);
    assert_eq!(remote.rows("affiliations").len(), 4);
    let record = store.get(local).unwrap().unwrap();
    let external_id = record.external_id.expect("id kept after failed link push");
    assert_eq!(report.failures[0].external_id.as_deref(), Some(external_id.as_str()));
    assert!(record.dirty);
    assert!(remote.link_calls().is_empty());

    let retry = export(&config, &remote, &mut store).expect("retry");

    let step = retry.step(EntityKind::Affiliation).unwrap();
    assert_eq!(step.stats.created, 0);
    assert_eq!(step.stats.updated, 1);
    assert_eq!(step.stats.linked, 1);
    assert!(retry.failures.is_empty());
    assert_eq!(remote.rows("affiliations").len(), 4);
    assert_eq!(remote.link_calls().len(), 1);
    assert_eq!(remote.link_calls()[0].2, external_id);
    assert!(!store.get(local).unwrap().unwrap().dirty);
}

#[test]
fn strict_export_keeps_the_row_id_when_linking_fails() {
    let (config, remote, mut store) = imported();
    let local = local_affiliation_with_role(&mut store);
    remote.fail_next_links(1);

    let error = export(&config, &remote, &mut store).unwrap_err();

    assert!(matches!(error, SyncError::RemoteApi(_)));
    let record = store.get(local).unwrap().unwrap();
    assert!(record.external_id.is_some());
    assert!(record.dirty);

    export(&config, &remote, &mut store).expect("retry");
    assert_eq!(remote.rows("affiliations").len(), 4);
    assert!(!store.get(local).unwrap().unwrap().dirty);
}
